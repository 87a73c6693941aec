use thiserror::Error;

/// A frame body could not be encoded or decoded against its registered schema.
///
/// These errors indicate a programming or compatibility bug between client and
/// equipment. They are never recovered from silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("field `{field}` needs {needed} bytes but only {remaining} remain")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("{0} unexpected trailing bytes after the last field")]
    TrailingBytes(usize),
    #[error("expected {expected} values but got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("field `{field}` expects a {expected} value, got {found}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("field `{field}` expects {expected} hex bytes, got {got}")]
    HexLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("string in field `{field}` is {len} bytes long, the maximum is 65535")]
    StringTooLong { field: &'static str, len: usize },
    #[error("field `{field}` is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("field `{field}` holds invalid JSON: {reason}")]
    InvalidJson { field: &'static str, reason: String },
    #[error("value {value} is not a valid {type_name}")]
    InvalidEnumValue { type_name: &'static str, value: u64 },
    #[error("command {0} does not support GET")]
    NotGettable(&'static str),
    #[error("command {0} does not support SET")]
    NotSettable(&'static str),
    /// The SET body encodes to nothing, which the tester would read as a GET.
    #[error("SET of {0} has an empty body and would be read as a GET")]
    EmptySet(&'static str),
}

/// A frame header could not be read from the byte stream.
///
/// The stream cannot be resynchronised after any of these, so the connection
/// carrying it is no longer usable.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid frame magic {0:#04x}")]
    InvalidMagic(u8),
    #[error("unknown status byte {0:#04x}")]
    UnknownStatus(u8),
    #[error("frame carries {got} sub-indices, the maximum is {max}")]
    TooManyIndices { max: usize, got: usize },
    #[error("payload too large! Maximum is {max}, but got {got}")]
    PayloadTooLarge { max: usize, got: usize },
}

/// Registering a command specification failed.
///
/// Raised while the registry is assembled at startup, always a programming error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("command code {code:#06x} registered twice ({first} and {second})")]
    DuplicateCode {
        code: u16,
        first: &'static str,
        second: &'static str,
    },
    #[error("{command}: greedy field `{field}` must be the last field of its schema")]
    GreedyFieldNotLast {
        command: &'static str,
        field: &'static str,
    },
    #[error("{command}: sequence field `{field}` contains a greedy field")]
    GreedySequenceItem {
        command: &'static str,
        field: &'static str,
    },
    #[error("{command}: rows of sequence field `{field}` have no width")]
    EmptySequence {
        command: &'static str,
        field: &'static str,
    },
}
