use thiserror::Error;
use xmp_protocol::{
    Address, Status,
    error::{FrameError, SchemaError},
};

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out connecting to the tester")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    /// The connection went away before the reply arrived.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    /// The tester answered with a non-ok status.
    #[error("{command} on {address} failed: {status}")]
    Status {
        command: &'static str,
        address: Address,
        status: Status,
    },
    #[error("could not create {kind} {index} on {address}: {status}")]
    ResourceCreation {
        kind: &'static str,
        index: u32,
        address: Address,
        status: Status,
    },
    #[error("{kind} {index} on {address}: {status}")]
    ResourceLifecycle {
        kind: &'static str,
        index: u32,
        address: Address,
        status: Status,
    },
    #[error("command code {0:#06x} is not registered")]
    Unsupported(u16),
}

impl Error {
    /// Whether the operation may succeed when simply issued again later.
    pub fn is_retryable(&self) -> bool {
        self.status() == Some(Status::Pending)
    }

    /// The tester status behind this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Status { status, .. }
            | Error::ResourceCreation { status, .. }
            | Error::ResourceLifecycle { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
