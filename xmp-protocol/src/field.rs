//! Field codecs used to serialise command bodies.
//!
//! A command body is a flat concatenation of fields in schema order. Every field
//! has a fixed encoding chosen by its [`FieldKind`]:
//!
//! - integers are big-endian with their exact width
//! - `Hex(n)` is an `n` byte blob, `HexRest` takes whatever is left of the body
//! - `Ipv4`/`Ipv6` are 4 and 16 raw address bytes
//! - `Str` is a big-endian `u16` byte length followed by UTF-8
//! - `Seq` repeats a sub-schema until the body is exhausted (no count prefix)
//! - `Json` is a UTF-8 document, NUL padded up to a minimum length
//!
//! `HexRest`, `Seq` and `Json` consume the remainder of the body and must be the
//! last field of a schema.
use std::{
    fmt::{self, Display},
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::SchemaError;

/// Wire encoding of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// Fixed number of raw bytes, surfaced as a [`HexString`].
    Hex(usize),
    /// All remaining bytes, surfaced as a [`HexString`].
    HexRest,
    Ipv4,
    Ipv6,
    Str,
    /// Rows of a sub-schema repeated until the body ends.
    Seq(&'static [FieldSpec]),
    /// A JSON document padded with NUL bytes to at least `min_len` bytes.
    Json { min_len: usize },
}

impl FieldKind {
    /// Whether this field consumes the rest of the body.
    pub const fn is_greedy(&self) -> bool {
        matches!(self, FieldKind::HexRest | FieldKind::Seq(_) | FieldKind::Json { .. })
    }

    /// Name used in error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            FieldKind::U8 => "u8",
            FieldKind::U16 => "u16",
            FieldKind::U32 => "u32",
            FieldKind::U64 => "u64",
            FieldKind::I8 => "i8",
            FieldKind::I16 => "i16",
            FieldKind::I32 => "i32",
            FieldKind::I64 => "i64",
            FieldKind::Hex(_) | FieldKind::HexRest => "hex",
            FieldKind::Ipv4 => "ipv4",
            FieldKind::Ipv6 => "ipv6",
            FieldKind::Str => "string",
            FieldKind::Seq(_) => "sequence",
            FieldKind::Json { .. } => "json",
        }
    }

    /// The value a freshly initialised field of this kind holds.
    pub fn default_value(&self) -> Value {
        match self {
            FieldKind::U8 => Value::U8(0),
            FieldKind::U16 => Value::U16(0),
            FieldKind::U32 => Value::U32(0),
            FieldKind::U64 => Value::U64(0),
            FieldKind::I8 => Value::I8(0),
            FieldKind::I16 => Value::I16(0),
            FieldKind::I32 => Value::I32(0),
            FieldKind::I64 => Value::I64(0),
            FieldKind::Hex(n) => Value::Hex(HexString::new(vec![0; *n])),
            FieldKind::HexRest => Value::Hex(HexString::default()),
            FieldKind::Ipv4 => Value::Ipv4(Ipv4Addr::UNSPECIFIED),
            FieldKind::Ipv6 => Value::Ipv6(Ipv6Addr::UNSPECIFIED),
            FieldKind::Str => Value::Str(String::new()),
            FieldKind::Seq(_) => Value::Seq(Vec::new()),
            FieldKind::Json { .. } => Value::Json(serde_json::Value::Null),
        }
    }
}

/// A named field of a command schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> FieldSpec {
        FieldSpec { name, kind }
    }

    pub fn encode(&self, value: &Value, dst: &mut BytesMut) -> Result<(), SchemaError> {
        let mismatch = || SchemaError::TypeMismatch {
            field: self.name,
            expected: self.kind.name(),
            found: value.kind_name(),
        };
        match (self.kind, value) {
            (FieldKind::U8, Value::U8(v)) => dst.put_u8(*v),
            (FieldKind::U16, Value::U16(v)) => dst.put_u16(*v),
            (FieldKind::U32, Value::U32(v)) => dst.put_u32(*v),
            (FieldKind::U64, Value::U64(v)) => dst.put_u64(*v),
            (FieldKind::I8, Value::I8(v)) => dst.put_i8(*v),
            (FieldKind::I16, Value::I16(v)) => dst.put_i16(*v),
            (FieldKind::I32, Value::I32(v)) => dst.put_i32(*v),
            (FieldKind::I64, Value::I64(v)) => dst.put_i64(*v),
            (FieldKind::Hex(n), Value::Hex(hex)) => {
                if hex.len() != n {
                    return Err(SchemaError::HexLength {
                        field: self.name,
                        expected: n,
                        got: hex.len(),
                    });
                }
                dst.put_slice(hex.as_bytes());
            }
            (FieldKind::HexRest, Value::Hex(hex)) => dst.put_slice(hex.as_bytes()),
            (FieldKind::Ipv4, Value::Ipv4(addr)) => dst.put_slice(&addr.octets()),
            (FieldKind::Ipv6, Value::Ipv6(addr)) => dst.put_slice(&addr.octets()),
            (FieldKind::Str, Value::Str(s)) => {
                let len = u16::try_from(s.len()).map_err(|_| SchemaError::StringTooLong {
                    field: self.name,
                    len: s.len(),
                })?;
                dst.put_u16(len);
                dst.put_slice(s.as_bytes());
            }
            (FieldKind::Seq(items), Value::Seq(rows)) => {
                for row in rows {
                    encode_fields(items, row, dst)?;
                }
            }
            (FieldKind::Json { min_len }, Value::Json(doc)) => {
                let text = serde_json::to_vec(doc).map_err(|e| SchemaError::InvalidJson {
                    field: self.name,
                    reason: e.to_string(),
                })?;
                let padding = min_len.saturating_sub(text.len());
                dst.put_slice(&text);
                dst.put_bytes(0, padding);
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    pub fn decode(&self, src: &mut Bytes) -> Result<Value, SchemaError> {
        let value = match self.kind {
            FieldKind::U8 => Value::U8(self.take(src, 1)?.get_u8()),
            FieldKind::U16 => Value::U16(self.take(src, 2)?.get_u16()),
            FieldKind::U32 => Value::U32(self.take(src, 4)?.get_u32()),
            FieldKind::U64 => Value::U64(self.take(src, 8)?.get_u64()),
            FieldKind::I8 => Value::I8(self.take(src, 1)?.get_i8()),
            FieldKind::I16 => Value::I16(self.take(src, 2)?.get_i16()),
            FieldKind::I32 => Value::I32(self.take(src, 4)?.get_i32()),
            FieldKind::I64 => Value::I64(self.take(src, 8)?.get_i64()),
            FieldKind::Hex(n) => Value::Hex(HexString::new(self.take(src, n)?.to_vec())),
            FieldKind::HexRest => Value::Hex(HexString::new(src.split_to(src.len()).to_vec())),
            FieldKind::Ipv4 => {
                let mut octets = [0u8; 4];
                self.take(src, 4)?.copy_to_slice(&mut octets);
                Value::Ipv4(Ipv4Addr::from(octets))
            }
            FieldKind::Ipv6 => {
                let mut octets = [0u8; 16];
                self.take(src, 16)?.copy_to_slice(&mut octets);
                Value::Ipv6(Ipv6Addr::from(octets))
            }
            FieldKind::Str => {
                let len = self.take(src, 2)?.get_u16() as usize;
                let raw = self.take(src, len)?;
                let text = String::from_utf8(raw.to_vec())
                    .map_err(|_| SchemaError::InvalidUtf8 { field: self.name })?;
                Value::Str(text)
            }
            FieldKind::Seq(items) => {
                let mut rows = Vec::new();
                while src.has_remaining() {
                    let before = src.remaining();
                    rows.push(decode_partial(items, src)?);
                    if src.remaining() == before {
                        // Zero-width rows, the rest is left as trailing bytes.
                        break;
                    }
                }
                Value::Seq(rows)
            }
            FieldKind::Json { .. } => {
                let raw = src.split_to(src.len());
                let end = raw.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                let doc = serde_json::from_slice(&raw[..end]).map_err(|e| {
                    SchemaError::InvalidJson {
                        field: self.name,
                        reason: e.to_string(),
                    }
                })?;
                Value::Json(doc)
            }
        };
        Ok(value)
    }

    fn take(&self, src: &mut Bytes, needed: usize) -> Result<Bytes, SchemaError> {
        if src.len() < needed {
            return Err(SchemaError::Truncated {
                field: self.name,
                needed,
                remaining: src.len(),
            });
        }
        Ok(src.split_to(needed))
    }
}

/// Encodes `values` against `fields`, appending to `dst`.
pub fn encode_fields(
    fields: &[FieldSpec],
    values: &[Value],
    dst: &mut BytesMut,
) -> Result<(), SchemaError> {
    if fields.len() != values.len() {
        return Err(SchemaError::FieldCount {
            expected: fields.len(),
            got: values.len(),
        });
    }
    for (field, value) in fields.iter().zip(values) {
        field.encode(value, dst)?;
    }
    Ok(())
}

/// Decodes a complete body. Any bytes left after the last field are an error.
pub fn decode_fields(fields: &[FieldSpec], mut body: Bytes) -> Result<Vec<Value>, SchemaError> {
    let values = decode_partial(fields, &mut body)?;
    if body.has_remaining() {
        return Err(SchemaError::TrailingBytes(body.len()));
    }
    Ok(values)
}

fn decode_partial(fields: &[FieldSpec], src: &mut Bytes) -> Result<Vec<Value>, SchemaError> {
    fields.iter().map(|field| field.decode(src)).collect()
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Hex(HexString),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Str(String),
    Seq(Vec<Vec<Value>>),
    Json(serde_json::Value),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::Hex(_) => "hex",
            Value::Ipv4(_) => "ipv4",
            Value::Ipv6(_) => "ipv6",
            Value::Str(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Json(_) => "json",
        }
    }
}

/// Raw bytes of a hex field.
///
/// Displayed and parsed as `0x`-prefixed lowercase hex text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HexString(Vec<u8>);

impl HexString {
    pub fn new(bytes: Vec<u8>) -> HexString {
        HexString(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&[u8]> for HexString {
    fn from(value: &[u8]) -> Self {
        HexString(value.to_vec())
    }
}

impl Display for HexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Hex text could not be parsed into a [`HexString`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hex string `{0}`")]
pub struct ParseHexError(String);

impl FromStr for HexString {
    type Err = ParseHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.len() % 2 != 0 {
            return Err(ParseHexError(s.to_string()));
        }
        (0..digits.len())
            .step_by(2)
            .map(|i| {
                digits
                    .get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| ParseHexError(s.to_string()))
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(HexString)
    }
}

/// Conversion of a typed struct field into a wire [`Value`].
pub trait ToValue {
    fn to_value(self) -> Value;
}

/// Conversion of a decoded [`Value`] back into a typed struct field.
pub trait FromValue: Sized {
    fn from_value(field: &'static str, value: Value) -> Result<Self, SchemaError>;
}

fn type_mismatch(field: &'static str, expected: &'static str, value: &Value) -> SchemaError {
    SchemaError::TypeMismatch {
        field,
        expected,
        found: value.kind_name(),
    }
}

macro_rules! scalar_value {
    ($($ty:ty => $variant:ident, $name:literal;)*) => {
        $(
            impl ToValue for $ty {
                fn to_value(self) -> Value {
                    Value::$variant(self)
                }
            }

            impl FromValue for $ty {
                fn from_value(field: &'static str, value: Value) -> Result<Self, SchemaError> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(type_mismatch(field, $name, &other)),
                    }
                }
            }
        )*
    };
}

scalar_value! {
    u8 => U8, "u8";
    u16 => U16, "u16";
    u32 => U32, "u32";
    u64 => U64, "u64";
    i8 => I8, "i8";
    i16 => I16, "i16";
    i32 => I32, "i32";
    i64 => I64, "i64";
    HexString => Hex, "hex";
    Ipv4Addr => Ipv4, "ipv4";
    Ipv6Addr => Ipv6, "ipv6";
    String => Str, "string";
    serde_json::Value => Json, "json";
}

impl<T: crate::message::Message> ToValue for Vec<T> {
    fn to_value(self) -> Value {
        Value::Seq(self.into_iter().map(|row| row.into_values()).collect())
    }
}

impl<T: crate::message::Message> FromValue for Vec<T> {
    fn from_value(field: &'static str, value: Value) -> Result<Self, SchemaError> {
        match value {
            Value::Seq(rows) => rows.into_iter().map(T::from_values).collect(),
            other => Err(type_mismatch(field, "sequence", &other)),
        }
    }
}

/// Declares a fieldless enum carried on the wire as a `u8`.
#[macro_export]
macro_rules! value_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $value, )*
        }

        impl ::std::convert::TryFrom<u8> for $name {
            type Error = $crate::error::SchemaError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok($name::$variant), )*
                    other => Err($crate::error::SchemaError::InvalidEnumValue {
                        type_name: stringify!($name),
                        value: other as u64,
                    }),
                }
            }
        }

        impl $crate::field::ToValue for $name {
            fn to_value(self) -> $crate::field::Value {
                $crate::field::Value::U8(self as u8)
            }
        }

        impl $crate::field::FromValue for $name {
            fn from_value(
                field: &'static str,
                value: $crate::field::Value,
            ) -> Result<Self, $crate::error::SchemaError> {
                let raw = <u8 as $crate::field::FromValue>::from_value(field, value)?;
                $name::try_from(raw)
            }
        }
    };
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    const ROW: &[FieldSpec] = &[
        FieldSpec::new("index", FieldKind::U16),
        FieldSpec::new("label", FieldKind::Str),
    ];

    fn round_trip(field: FieldSpec, value: Value) -> Value {
        let mut buf = BytesMut::new();
        field.encode(&value, &mut buf).unwrap();
        let mut bytes = buf.freeze();
        let decoded = field.decode(&mut bytes).unwrap();
        assert!(bytes.is_empty(), "decoder left {} bytes", bytes.len());
        decoded
    }

    proptest! {
        #[test]
        fn integers_round_trip(a in any::<u32>(), b in any::<i64>(), c in any::<u16>()) {
            let fields = [
                FieldSpec::new("a", FieldKind::U32),
                FieldSpec::new("b", FieldKind::I64),
                FieldSpec::new("c", FieldKind::U16),
            ];
            let values = vec![Value::U32(a), Value::I64(b), Value::U16(c)];
            let mut buf = BytesMut::new();
            encode_fields(&fields, &values, &mut buf).unwrap();
            prop_assert_eq!(buf.len(), 14);
            prop_assert_eq!(decode_fields(&fields, buf.freeze()).unwrap(), values);
        }

        #[test]
        fn strings_round_trip(s in ".{0,64}") {
            let field = FieldSpec::new("s", FieldKind::Str);
            prop_assert_eq!(round_trip(field, Value::Str(s.clone())), Value::Str(s));
        }

        #[test]
        fn addresses_round_trip(v4 in any::<[u8; 4]>(), v6 in any::<[u8; 16]>()) {
            let v4 = Value::Ipv4(Ipv4Addr::from(v4));
            let v6 = Value::Ipv6(Ipv6Addr::from(v6));
            prop_assert_eq!(round_trip(FieldSpec::new("a", FieldKind::Ipv4), v4.clone()), v4);
            prop_assert_eq!(round_trip(FieldSpec::new("a", FieldKind::Ipv6), v6.clone()), v6);
        }

        #[test]
        fn hex_round_trips(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
            let value = Value::Hex(HexString::new(bytes.clone()));
            prop_assert_eq!(round_trip(FieldSpec::new("h", FieldKind::HexRest), value.clone()), value);
            let text = HexString::new(bytes.clone()).to_string();
            prop_assert_eq!(text.parse::<HexString>().unwrap().into_bytes(), bytes);
        }
    }

    #[test]
    fn integers_are_big_endian() {
        let mut buf = BytesMut::new();
        FieldSpec::new("v", FieldKind::U32)
            .encode(&Value::U32(0x0102_0304), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn string_is_length_prefixed() {
        let mut buf = BytesMut::new();
        FieldSpec::new("s", FieldKind::Str)
            .encode(&Value::Str("abc".to_string()), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"\x00\x03abc");
    }

    #[test]
    fn sequence_count_follows_body_length() {
        let field = FieldSpec::new("rows", FieldKind::Seq(ROW));
        let rows = Value::Seq(vec![
            vec![Value::U16(1), Value::Str("one".into())],
            vec![Value::U16(2), Value::Str(String::new())],
        ]);
        assert_eq!(round_trip(field, rows.clone()), rows);
        assert_eq!(round_trip(field, Value::Seq(vec![])), Value::Seq(vec![]));
    }

    #[test]
    fn partial_sequence_row_is_truncated() {
        let field = FieldSpec::new("rows", FieldKind::Seq(ROW));
        let mut body = Bytes::from_static(&[0, 1, 0, 2, b'a']);
        assert_eq!(
            field.decode(&mut body),
            Err(SchemaError::Truncated {
                field: "label",
                needed: 2,
                remaining: 1
            })
        );
    }

    #[test]
    fn json_is_padded_and_stripped() {
        let field = FieldSpec::new("doc", FieldKind::Json { min_len: 32 });
        let doc = serde_json::json!({"cmd": "abort"});
        let mut buf = BytesMut::new();
        field.encode(&Value::Json(doc.clone()), &mut buf).unwrap();
        assert_eq!(buf.len(), 32);
        assert_eq!(buf[31], 0);
        assert_eq!(round_trip(field, Value::Json(doc.clone())), Value::Json(doc));
    }

    #[test]
    fn short_body_is_an_error() {
        let fields = [FieldSpec::new("speed", FieldKind::U32)];
        assert_eq!(
            decode_fields(&fields, Bytes::from_static(&[0, 0, 1])),
            Err(SchemaError::Truncated {
                field: "speed",
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn long_body_is_an_error() {
        let fields = [FieldSpec::new("state", FieldKind::U8)];
        assert_eq!(
            decode_fields(&fields, Bytes::from_static(&[1, 0])),
            Err(SchemaError::TrailingBytes(1))
        );
    }

    #[test]
    fn wrong_value_kind_is_rejected() {
        let mut buf = BytesMut::new();
        let err = FieldSpec::new("speed", FieldKind::U32)
            .encode(&Value::U16(1), &mut buf)
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::TypeMismatch {
                field: "speed",
                expected: "u32",
                found: "u16"
            }
        );
    }

    #[test]
    fn fixed_hex_checks_length() {
        let mut buf = BytesMut::new();
        let err = FieldSpec::new("mask", FieldKind::Hex(4))
            .encode(&Value::Hex(HexString::new(vec![0xff; 3])), &mut buf)
            .unwrap_err();
        assert!(matches!(err, SchemaError::HexLength { expected: 4, got: 3, .. }));
    }

    #[test]
    fn zero_width_rows_do_not_loop() {
        let fields = [FieldSpec::new("rows", FieldKind::Seq(&[]))];
        assert_eq!(
            decode_fields(&fields, Bytes::from_static(&[1, 2, 3])),
            Err(SchemaError::TrailingBytes(3))
        );
    }

    #[test]
    fn hex_text_parsing() {
        assert_eq!(
            "0xDEADbeef".parse::<HexString>().unwrap().as_bytes(),
            &[0xde, 0xad, 0xbe, 0xef]
        );
        assert!("0x123".parse::<HexString>().is_err());
        assert!("zz".parse::<HexString>().is_err());
    }
}
