//! # XMP Protocol Library
//!
//! This crate implements the wire format of XMP, the request/response protocol
//! used to configure and monitor network test equipment (chassis, modules, ports
//! and their sub-resources) over a TCP connection.
//!
//! ## Overview
//!
//! Every exchange is a [`Frame`]: a command code, the address of the targeted
//! resource and a payload whose layout is fixed by the command's schema. This
//! crate provides:
//!
//! - the frame header format and an incremental decoder ([`frame`])
//! - field codecs for command bodies ([`field`])
//! - typed command bodies and command declarations ([`message`])
//! - a registry mapping command codes to their schemas ([`registry`])
//! - the built-in command catalogue ([`commands`])
//! - a [`tokio_util`] codec behind the `tokio` feature ([`codec`])
//!
//! ## Basic Usage
//!
//! ### Building a request
//!
//! ```
//! use xmp_protocol::{Address, Frame};
//! use xmp_protocol::commands::{OnOff, Toggle, port::P_TRAFFIC};
//! use bytes::BytesMut;
//!
//! let frame = Frame::set::<P_TRAFFIC>(Address::port(0, 1), Toggle { state: OnOff::On })
//!     .expect("toggle always encodes");
//! let mut buffer = BytesMut::new();
//! frame.encode(&mut buffer).expect("frame fits");
//! assert_eq!(&buffer[12..], &[1]);
//! ```
//!
//! ### Decoding a reply
//!
//! ```
//! use xmp_protocol::{Address, Frame, message::decode_message};
//! use xmp_protocol::commands::port::Speed;
//! use bytes::Bytes;
//!
//! let reply = Frame::new(0x0203, Address::port(0, 1), Bytes::from_static(&[0, 0, 0x27, 0x10]));
//! let speed: Speed = decode_message(reply.payload).expect("schema matches");
//! assert_eq!(speed.mbps, 10_000);
//! ```
//!
//! ## Frame Format
//!
//! All integers are big-endian.
//!
//! ```text
//! magic(1) status(1) code(2) module(1) port(1) index_count(2) payload_len(4)
//! index(4) * index_count
//! payload(payload_len)
//! ```
//!
//! Module and port are `0xFF` when absent. The protocol carries no request
//! identifier: a reply is matched to its request by command code and address.
//!
//! ## Error Handling
//!
//! [`error::FrameError`] is returned when the byte stream itself is corrupt,
//! [`error::SchemaError`] when a body does not fit its schema and
//! [`error::RegistryError`] when the command table is inconsistent.
#[cfg(feature = "tokio")]
pub mod codec;
pub mod commands;
pub mod error;
pub mod field;
pub mod frame;
pub mod message;
pub mod registry;

pub use frame::{Address, Frame, Key, Status, build_get, build_set};
pub use message::{Command, CommandSpec, Get, Message, Set};
pub use registry::Registry;
