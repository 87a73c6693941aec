use std::fmt::{self, Display};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::{FrameError, SchemaError},
    field::encode_fields,
    message::{Command, CommandSpec, Get, Message, Set},
};

/// First byte of every frame.
pub const MAGIC: u8 = 0x58;
/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 12;
/// Highest number of sub-indices a frame may address.
pub const MAX_INDICES: usize = 16;
/// Default upper bound for a payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

const NO_ID: u8 = 0xFF;

/// Identifies the resource a frame targets.
///
/// Chassis level commands carry neither module nor port. Sub-resources of a
/// port (streams, filters, ...) add one or more sub-indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub module: Option<u8>,
    pub port: Option<u8>,
    pub indices: Vec<u32>,
}

impl Address {
    pub fn chassis() -> Address {
        Address::default()
    }

    pub fn module(module: u8) -> Address {
        Address {
            module: Some(module),
            ..Address::default()
        }
    }

    pub fn port(module: u8, port: u8) -> Address {
        Address {
            module: Some(module),
            port: Some(port),
            indices: Vec::new(),
        }
    }

    /// This address extended by one more sub-index.
    pub fn with_index(&self, index: u32) -> Address {
        let mut address = self.clone();
        address.indices.push(index);
        address
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.module, self.port) {
            (None, _) => write!(f, "chassis")?,
            (Some(m), None) => write!(f, "{}", m)?,
            (Some(m), Some(p)) => write!(f, "{}/{}", m, p)?,
        }
        if !self.indices.is_empty() {
            let indices: Vec<String> = self.indices.iter().map(u32::to_string).collect();
            write!(f, " [{}]", indices.join(","))?;
        }
        Ok(())
    }
}

/// Outcome reported by the equipment in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// The command or its parameters are not valid here.
    NotValid = 1,
    BadModule = 2,
    BadPort = 3,
    /// The addressed sub-index does not exist or cannot be used.
    BadIndex = 4,
    /// A mutation was attempted without holding the reservation.
    NotReserved = 5,
    ReservedByOther = 6,
    NotLoggedOn = 7,
    CapacityExceeded = 8,
    /// The equipment is busy with an earlier operation, try again later.
    Pending = 9,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl TryFrom<u8> for Status {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::NotValid,
            2 => Status::BadModule,
            3 => Status::BadPort,
            4 => Status::BadIndex,
            5 => Status::NotReserved,
            6 => Status::ReservedByOther,
            7 => Status::NotLoggedOn,
            8 => Status::CapacityExceeded,
            9 => Status::Pending,
            other => return Err(FrameError::UnknownStatus(other)),
        })
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::NotValid => "not valid",
            Status::BadModule => "bad module",
            Status::BadPort => "bad port",
            Status::BadIndex => "bad index",
            Status::NotReserved => "not reserved",
            Status::ReservedByOther => "reserved by other",
            Status::NotLoggedOn => "not logged on",
            Status::CapacityExceeded => "capacity exceeded",
            Status::Pending => "pending",
        };
        f.write_str(text)
    }
}

/// Correlation key of a frame. Replies are matched to requests by this key only.
pub type Key = (u16, Address);

/// One protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u16,
    pub status: Status,
    pub address: Address,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(code: u16, address: Address, payload: Bytes) -> Frame {
        Frame {
            code,
            status: Status::Ok,
            address,
            payload,
        }
    }

    /// A reply for `request` that carries only a status.
    pub fn status_reply(request: &Frame, status: Status) -> Frame {
        Frame {
            code: request.code,
            status,
            address: request.address.clone(),
            payload: Bytes::new(),
        }
    }

    pub fn key(&self) -> Key {
        (self.code, self.address.clone())
    }

    /// Typed shorthand for [`build_get`].
    pub fn get<C: Get>(address: Address) -> Frame {
        Frame::new(C::CODE, address, Bytes::new())
    }

    /// Typed shorthand for [`build_set`].
    pub fn set<C: Set>(address: Address, request: C::Request) -> Result<Frame, SchemaError> {
        build_set(&C::SPEC, address, &request.into_values())
    }

    /// Appends the wire representation of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        if self.address.indices.len() > MAX_INDICES {
            return Err(FrameError::TooManyIndices {
                max: MAX_INDICES,
                got: self.address.indices.len(),
            });
        }
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| FrameError::PayloadTooLarge {
                max: u32::MAX as usize,
                got: self.payload.len(),
            })?;
        dst.reserve(HEADER_SIZE + 4 * self.address.indices.len() + self.payload.len());
        dst.put_u8(MAGIC);
        dst.put_u8(self.status as u8);
        dst.put_u16(self.code);
        dst.put_u8(self.address.module.unwrap_or(NO_ID));
        dst.put_u8(self.address.port.unwrap_or(NO_ID));
        dst.put_u16(self.address.indices.len() as u16);
        dst.put_u32(payload_len);
        for index in &self.address.indices {
            dst.put_u32(*index);
        }
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Splits one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not hold a whole frame yet; nothing is
    /// consumed in that case.
    pub fn decode(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &src[..HEADER_SIZE];
        let magic = header.get_u8();
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }
        let status = Status::try_from(header.get_u8())?;
        let code = header.get_u16();
        let module = header.get_u8();
        let port = header.get_u8();
        let index_count = header.get_u16() as usize;
        let payload_len = header.get_u32() as usize;
        if index_count > MAX_INDICES {
            return Err(FrameError::TooManyIndices {
                max: MAX_INDICES,
                got: index_count,
            });
        }
        if payload_len > max_payload {
            return Err(FrameError::PayloadTooLarge {
                max: max_payload,
                got: payload_len,
            });
        }

        let total = HEADER_SIZE + 4 * index_count + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(HEADER_SIZE);
        let indices = (0..index_count).map(|_| frame.get_u32()).collect();
        Ok(Some(Frame {
            code,
            status,
            address: Address {
                module: (module != NO_ID).then_some(module),
                port: (port != NO_ID).then_some(port),
                indices,
            },
            payload: frame.freeze(),
        }))
    }
}

/// Builds a GET request for `spec`. The payload of a GET is always empty.
pub fn build_get(spec: &CommandSpec, address: Address) -> Result<Frame, SchemaError> {
    if !spec.is_gettable() {
        return Err(SchemaError::NotGettable(spec.name));
    }
    Ok(Frame::new(spec.code, address, Bytes::new()))
}

/// Builds a SET request for `spec` from one value per request field.
pub fn build_set(
    spec: &CommandSpec,
    address: Address,
    values: &[crate::field::Value],
) -> Result<Frame, SchemaError> {
    let fields = spec
        .request_fields
        .ok_or(SchemaError::NotSettable(spec.name))?;
    let mut payload = BytesMut::new();
    encode_fields(fields, values, &mut payload)?;
    // An empty body is what a GET looks like on the wire.
    if payload.is_empty() && spec.is_gettable() {
        return Err(SchemaError::EmptySet(spec.name));
    }
    Ok(Frame::new(spec.code, address, payload.freeze()))
}
