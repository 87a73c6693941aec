//! # XMP Client
//!
//! An asynchronous client for network test equipment that speaks XMP.
//!
//! ## Overview
//!
//! One [`Connection`] carries every command of a session over a single TCP
//! stream. Requests can be issued concurrently from many tasks; because XMP
//! frames carry no request identifier, replies are attributed by command code
//! and address, first in first out per pair (see [`Token`]).
//!
//! On top of the connection this crate provides:
//!
//! - typed command handles ([`CommandHandle`]) with pipelining support
//! - listeners for pushed notifications ([`Connection::on`], [`Connection::events`])
//! - a cache of indexed sub-resources such as streams and filters ([`IndexManager`])
//! - the reservation state machine of chassis, modules and ports ([`Reservation`])
//! - the resource tree [`Tester`] → [`Module`] → [`Port`]
//! - a helper to poll commands the tester answers as busy ([`retry_while_pending`])
//!
//! For the wire format, see the [`xmp_protocol`] crate.
//!
//! ## Basic Usage
//!
//! ### Connecting and logging on
//!
//! ```ignore
//! use xmp_client::{Builder, Credentials, Tester};
//!
//! let tester = Tester::connect("10.0.0.2:22606", Credentials::new("alice", "xena"), Builder::new().build()).await?;
//! let port = tester.port(0, 1);
//! port.reservation().reserve_regardless().await?;
//! ```
//!
//! ### Managing streams
//!
//! ```ignore
//! let stream = port.streams.create().await?;
//! stream.enable().set_on().await?;
//!
//! // Someone else may have changed the streams in the meantime.
//! port.streams.server_sync().await?;
//! println!("streams: {:?}", port.streams.indices());
//! ```
//!
//! ### Pipelining
//!
//! ```ignore
//! let speed = port.speed().send_get().await?;
//! let sync = port.receive_sync().send_get().await?;
//! let (speed, sync) = (speed.await?, sync.await?);
//! ```
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`Error`]. A reply with a non-ok status
//! becomes [`Error::Status`]; [`Error::is_retryable`] tells whether the tester
//! was merely busy. When the connection fails, every pending request resolves
//! with [`Error::ConnectionClosed`] and later sends fail with
//! [`Error::NotConnected`].
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Connection lifecycle is logged at `info`,
//! requests and replies at `debug`, payload bytes at `trace`. Unmatched
//! frames, failing listeners and failed keepalives are logged at `warn`.
mod command;
mod config;
mod connection;
mod correlator;
mod error;
mod events;
mod indices;
mod reservation;
mod resources;
mod retry;

pub use command::{CommandHandle, Pending};
pub use config::{Builder, Config};
pub use connection::{Connection, ConnectionState};
pub use correlator::Token;
pub use error::{Error, Result};
pub use events::{Events, PushEvent, Subscription};
pub use indices::{IndexChange, IndexEvent, IndexKind, IndexManager, IndexedResource};
pub use reservation::{ChassisScope, ModuleScope, PortScope, Reservation, Scope};
pub use resources::{
    Credentials, Filter, Filters, Histogram, Histograms, LengthTerm, LengthTerms, MacsecRxChannel,
    MacsecRxChannels, MacsecTxChannel, MacsecTxChannels, MatchTerm, MatchTerms, Module, Port,
    Stream, Streams, Tester,
};
pub use retry::{RetryPolicy, retry_while_pending};
