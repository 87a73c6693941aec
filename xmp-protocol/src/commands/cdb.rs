//! Transceiver CDB (command data block) access.
//!
//! CDB commands run on the transceiver itself and may take seconds. While an
//! operation is in progress the equipment answers with
//! [`Status::Pending`](crate::frame::Status::Pending) and callers poll.
use crate::{field::FieldKind, message};

message! {
    /// A CDB instruction as a JSON document.
    pub struct CdbRequest {
        command: serde_json::Value => FieldKind::Json { min_len: 0 },
    }
}

message! {
    /// The transceiver reply to the last CDB instruction.
    pub struct CdbReply {
        reply: serde_json::Value => FieldKind::Json { min_len: 0 },
    }
}

define_commands! {
    /// Issues a CDB instruction (SET) and fetches its outcome (GET).
    PX_CDB_COMMAND = 0x0500, push: false, get: CdbReply, set: CdbRequest;
}
