//! Module level commands, addressed by module id.
use super::{Comment, ReservationReply, ReservationRequest, Username};

define_commands! {
    /// Reservation of a module.
    M_RESERVATION = 0x0101, push: true, get: ReservationReply, set: ReservationRequest;
    M_RESERVEDBY = 0x0102, push: false, get: Username, set: _;
    M_COMMENT = 0x0103, push: false, get: Comment, set: Comment;
}
