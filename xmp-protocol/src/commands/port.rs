//! Port level commands, addressed by module and port id.
use std::net::{Ipv4Addr, Ipv6Addr};

use super::{Comment, ReservationReply, ReservationRequest, Toggle, Username};
use crate::{field::FieldKind, message, value_enum};

message! {
    /// Current link speed.
    pub struct Speed {
        mbps: u32 => FieldKind::U32,
    }
}

value_enum! {
    pub enum SyncStatus {
        NoSync = 0,
        InSync = 1,
    }
}

message! {
    pub struct ReceiveSync {
        sync: SyncStatus => FieldKind::U8,
    }
}

message! {
    /// IPv4 settings the port uses to answer ARP and PING.
    pub struct Ipv4Settings {
        address: Ipv4Addr => FieldKind::Ipv4,
        subnet: Ipv4Addr => FieldKind::Ipv4,
        gateway: Ipv4Addr => FieldKind::Ipv4,
        wildcard: Ipv4Addr => FieldKind::Ipv4,
    }
}

message! {
    pub struct Ipv6Settings {
        address: Ipv6Addr => FieldKind::Ipv6,
        gateway: Ipv6Addr => FieldKind::Ipv6,
        subnet_prefix: u8 => FieldKind::U8,
        wildcard_prefix: u8 => FieldKind::U8,
    }
}

define_commands! {
    /// Reservation of a port. Required before any port mutation.
    P_RESERVATION = 0x0201, push: true, get: ReservationReply, set: ReservationRequest;
    P_RESERVEDBY = 0x0202, push: false, get: Username, set: _;
    /// Pushed whenever the link speed changes.
    P_SPEED = 0x0203, push: true, get: Speed, set: _;
    /// Starts and stops transmission on all enabled streams.
    P_TRAFFIC = 0x0204, push: true, get: Toggle, set: Toggle;
    P_RECEIVESYNC = 0x0205, push: true, get: ReceiveSync, set: _;
    P_COMMENT = 0x0206, push: false, get: Comment, set: Comment;
    P_IPADDRESS = 0x0207, push: false, get: Ipv4Settings, set: Ipv4Settings;
    P_IPV6ADDRESS = 0x0208, push: false, get: Ipv6Settings, set: Ipv6Settings;
}
