//! Chassis level commands. These are addressed without module or port.
use super::{ReservationReply, ReservationRequest, Username};
use crate::{field::FieldKind, message};

message! {
    pub struct Password {
        password: String => FieldKind::Str,
    }
}

message! {
    pub struct KeepaliveReply {
        ticks: u32 => FieldKind::U32,
    }
}

message! {
    pub struct ChassisName {
        name: String => FieldKind::Str,
    }
}

define_commands! {
    /// Logs the session on with the chassis password. Must be the first command.
    C_LOGON = 0x0001, push: false, get: _, set: Password;
    /// Announces the user name this session reserves resources under.
    C_OWNER = 0x0002, push: false, get: Username, set: Username;
    /// No-op used to keep an idle connection open.
    C_KEEPALIVE = 0x0003, push: false, get: KeepaliveReply, set: _;
    /// Reservation of the whole chassis.
    C_RESERVATION = 0x0004, push: true, get: ReservationReply, set: ReservationRequest;
    /// Name of the user holding the chassis reservation.
    C_RESERVEDBY = 0x0005, push: false, get: Username, set: _;
    C_NAME = 0x0006, push: false, get: ChassisName, set: ChassisName;
}
