//! # XMP Server Library
//!
//! This crate provides a foundation for implementing XMP servers, the side of
//! the protocol that test equipment runs, together with an in-memory tester
//! [`Emulator`] for exercising clients without hardware.
//!
//! ## Overview
//!
//! XMP is a binary request/response protocol over TCP. Clients send frames
//! addressed to the chassis, a module, a port or a sub-resource of a port; the
//! server answers each request with a frame of the same command code and
//! address, in request order, and may push unsolicited frames at any time.
//!
//! ## Architecture
//!
//! The crate is built around two main components:
//!
//! - **[`XmpDevice`] Trait**: the interface a backend implements to answer
//!   requests and to learn about sessions coming and going
//! - **[`server::Server`]**: a generic async server that accepts connections,
//!   decodes frames, forwards them to the device and writes replies and
//!   pushed frames back
//!
//! ## How It Works
//!
//! 1. A backend (e.g. the [`Emulator`]) implements the [`XmpDevice`] trait
//! 2. The backend is wrapped in a [`server::Server`] instance
//! 3. The server listens for TCP connections and opens a [`Session`] for each
//! 4. Every decoded request is handed to [`XmpDevice::handle`]
//! 5. Replies and pushed frames are queued on the session and written in order
//!
//! ## Basic Usage
//!
//! ```ignore
//! use xmp_server::{Emulator, EmulatorConfig, server::Builder};
//! use tokio::net::TcpListener;
//!
//! let emulator = Emulator::new(EmulatorConfig::default());
//! let server = Builder::new().max_payload(64 * 1024).build(emulator);
//!
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! tokio::spawn(async move { server.serve(listener).await });
//! ```
//!
//! ## Configuration
//!
//! Server behavior can be customized via [`server::Config`]:
//!
//! - **max_payload**: Maximum payload size of a request (default: 1 MiB)
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Enable logging to see:
//! - Client connections and disconnections
//! - Requests being processed and the status of each reply
//! - Corrupt streams and other error conditions
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use xmp_protocol::Frame;

pub mod emulator;
pub mod server;

pub use emulator::{Emulator, EmulatorConfig};

/// One client connection as seen by a device.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Debug, Clone)]
pub struct Session {
    id: u64,
    peer: Option<SocketAddr>,
    outbox: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
}

impl Session {
    /// Frames queued with [`Session::send`] come out of `outbox` in order.
    pub fn new(
        id: u64,
        peer: Option<SocketAddr>,
        outbox: mpsc::UnboundedSender<Frame>,
        shutdown: CancellationToken,
    ) -> Session {
        Session {
            id,
            peer,
            outbox,
            shutdown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues a frame for this client. Returns false if the client is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbox.send(frame).is_ok()
    }

    /// Drops the connection without a reply.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbox.is_closed()
    }
}

/// Trait that backends implement to act as XMP equipment.
///
/// All methods are called from the connection tasks of the server, possibly
/// concurrently for different sessions, so implementations synchronise their
/// own state.
pub trait XmpDevice: Send + Sync + 'static {
    /// A client connected.
    fn open(&self, _session: &Session) {}

    /// Answers one request.
    ///
    /// The reply must carry the request's command code and address. Returning
    /// `None` leaves the request unanswered. Frames for other clients (or
    /// unsolicited frames for this one) are queued with [`Session::send`].
    fn handle(&self, session: &Session, request: Frame) -> Option<Frame>;

    /// The client disconnected or was disconnected.
    fn close(&self, _session: &Session) {}
}
