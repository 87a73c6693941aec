//! The built-in command catalogue.
//!
//! Each submodule declares its commands with `define_commands!`, which emits one
//! unit struct per command plus a `CATALOGUE` slice of their specifications.
//! Bodies shared by several commands live in this module.
use crate::{field::FieldKind, message, message::Message, value_enum};

macro_rules! define_commands {
    (@fields _) => { None };
    (@fields $msg:ident) => { Some(<$msg as $crate::message::Message>::FIELDS) };
    (@get $name:ident, _) => {};
    (@get $name:ident, $msg:ident) => {
        impl $crate::message::Get for $name {
            type Reply = $msg;
        }
    };
    (@set $name:ident, _) => {};
    (@set $name:ident, $msg:ident) => {
        impl $crate::message::Set for $name {
            type Request = $msg;
        }
    };
    (
        $(
            $(#[$meta:meta])*
            $name:ident = $code:literal, push: $push:literal, get: $get:tt, set: $set:tt;
        )*
    ) => {
        $(
            $(#[$meta])*
            #[allow(non_camel_case_types)]
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
            pub struct $name;

            impl $crate::message::Command for $name {
                const CODE: u16 = $code;
                const NAME: &'static str = stringify!($name);
                const PUSHED: bool = $push;
                const SPEC: $crate::message::CommandSpec = $crate::message::CommandSpec {
                    code: $code,
                    name: stringify!($name),
                    supports_push: $push,
                    reply_fields: define_commands!(@fields $get),
                    request_fields: define_commands!(@fields $set),
                };
            }

            define_commands!(@get $name, $get);
            define_commands!(@set $name, $set);
        )*

        /// Specifications of every command declared in this module.
        pub const CATALOGUE: &[$crate::message::CommandSpec] = &[
            $( <$name as $crate::message::Command>::SPEC, )*
        ];
    };
}

pub mod cdb;
pub mod chassis;
pub mod indexed;
pub mod module;
pub mod port;

/// All catalogue slices, in registration order.
pub const ALL: &[&[crate::message::CommandSpec]] = &[
    chassis::CATALOGUE,
    module::CATALOGUE,
    port::CATALOGUE,
    indexed::CATALOGUE,
    cdb::CATALOGUE,
];

value_enum! {
    /// Generic two-state setting.
    pub enum OnOff {
        Off = 0,
        On = 1,
    }
}

value_enum! {
    /// Operation carried by a `*_RESERVATION` SET.
    pub enum ReservationOperation {
        Release = 0,
        Reserve = 1,
        Relinquish = 2,
    }
}

value_enum! {
    /// Reservation as seen from the session that asks.
    pub enum ReservationStatus {
        Released = 0,
        ReservedByYou = 1,
        ReservedByOther = 2,
    }
}

message! {
    pub struct Toggle {
        state: OnOff => FieldKind::U8,
    }
}

message! {
    pub struct Username {
        username: String => FieldKind::Str,
    }
}

message! {
    pub struct Comment {
        comment: String => FieldKind::Str,
    }
}

message! {
    pub struct ReservationRequest {
        operation: ReservationOperation => FieldKind::U8,
    }
}

message! {
    pub struct ReservationReply {
        status: ReservationStatus => FieldKind::U8,
    }
}

message! {
    pub struct IndexEntry {
        index: u32 => FieldKind::U32,
    }
}

message! {
    /// The sub-indices currently defined for one indexed resource kind.
    pub struct IndexList {
        entries: Vec<IndexEntry> => FieldKind::Seq(<IndexEntry as Message>::FIELDS),
    }
}

impl IndexList {
    pub fn from_indices(indices: impl IntoIterator<Item = u32>) -> IndexList {
        IndexList {
            entries: indices
                .into_iter()
                .map(|index| IndexEntry { index })
                .collect(),
        }
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn catalogue_registers_without_conflicts() {
        let registry = Registry::builtin();
        let total: usize = ALL.iter().map(|c| c.len()).sum();
        assert_eq!(registry.len(), total);
    }

    #[test]
    fn enum_fields_reject_unknown_values() {
        use crate::field::{FromValue, Value};
        assert_eq!(
            OnOff::from_value("state", Value::U8(1)),
            Ok(OnOff::On)
        );
        assert!(ReservationStatus::from_value("status", Value::U8(9)).is_err());
    }
}
