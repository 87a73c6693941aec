//! Typed command bodies and command declarations.
use crate::{
    error::SchemaError,
    field::{FieldSpec, Value},
};

/// A typed command body with a fixed, ordered schema.
///
/// Implementations are generated with the [`message!`](crate::message!) macro,
/// which keeps one struct field per schema entry in declaration order.
pub trait Message: Sized + Send + 'static {
    const FIELDS: &'static [FieldSpec];

    fn into_values(self) -> Vec<Value>;

    fn from_values(values: Vec<Value>) -> Result<Self, SchemaError>;
}

/// Declares a struct together with its [`Message`] implementation.
///
/// ```
/// use xmp_protocol::{field::FieldKind, message};
///
/// message! {
///     /// Link speed in Mbit/s
///     pub struct Speed {
///         mbps: u32 => FieldKind::U32,
///     }
/// }
/// ```
#[macro_export]
macro_rules! message {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty => $kind:expr ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $crate::message::Message for $name {
            const FIELDS: &'static [$crate::field::FieldSpec] = &[
                $( $crate::field::FieldSpec::new(stringify!($field), $kind), )*
            ];

            fn into_values(self) -> ::std::vec::Vec<$crate::field::Value> {
                ::std::vec![ $( $crate::field::ToValue::to_value(self.$field), )* ]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(
                values: ::std::vec::Vec<$crate::field::Value>,
            ) -> Result<Self, $crate::error::SchemaError> {
                let expected = <Self as $crate::message::Message>::FIELDS.len();
                if values.len() != expected {
                    return Err($crate::error::SchemaError::FieldCount {
                        expected,
                        got: values.len(),
                    });
                }
                let mut values = values.into_iter();
                Ok($name {
                    $(
                        $field: match values.next() {
                            Some(value) => $crate::field::FromValue::from_value(stringify!($field), value)?,
                            None => return Err($crate::error::SchemaError::FieldCount {
                                expected,
                                got: 0,
                            }),
                        },
                    )*
                })
            }
        }
    };
}

message! {
    /// A body without fields, used by acknowledgements and argument-less commands.
    #[derive(Default, Eq)]
    pub struct Empty {}
}

/// Static description of a command: its code and the schemas of both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub code: u16,
    pub name: &'static str,
    /// The equipment may send this command's reply unsolicited.
    pub supports_push: bool,
    /// Fields of a GET reply, `None` if the command cannot be read.
    pub reply_fields: Option<&'static [FieldSpec]>,
    /// Fields of a SET request, `None` if the command cannot be written.
    pub request_fields: Option<&'static [FieldSpec]>,
}

impl CommandSpec {
    pub fn is_gettable(&self) -> bool {
        self.reply_fields.is_some()
    }

    pub fn is_settable(&self) -> bool {
        self.request_fields.is_some()
    }
}

/// A registered command. Implemented by the unit structs of the catalogue.
pub trait Command: Send + Sync + 'static {
    const CODE: u16;
    const NAME: &'static str;
    const PUSHED: bool;
    const SPEC: CommandSpec;
}

/// A command that can be read.
pub trait Get: Command {
    type Reply: Message;
}

/// A command that can be written.
pub trait Set: Command {
    type Request: Message;
}

/// Decodes a reply body into the typed message `M`.
pub fn decode_message<M: Message>(body: bytes::Bytes) -> Result<M, SchemaError> {
    M::from_values(crate::field::decode_fields(M::FIELDS, body)?)
}
