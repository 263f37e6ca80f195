//! Error types for the framework.
//!
//! Every failure a caller can observe maps onto one variant of [`Error`].
//! Only [`Error::DuplicateRoute`] is fatal, and only at setup time; the
//! rest are scoped to a single connection or a single call.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level framing violations. These close the offending connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header declared a payload larger than the configured maximum.
    #[error("declared payload length {length} exceeds max packet size {max}")]
    Oversize { length: u32, max: u32 },
    /// Outgoing payload does not fit in the 32-bit length field.
    #[error("payload of {length} bytes does not fit in a 32-bit length field")]
    PayloadTooLarge { length: usize },
    /// Header buffer shorter than the codec's header length.
    #[error("header needs {expected} bytes, got {actual}")]
    ShortHeader { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    /// A second handler was bound to an already-routed message id.
    #[error("message id {0} already has a router bound")]
    DuplicateRoute(u32),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The registry is at `max_conn`.
    #[error("connection limit of {limit} reached")]
    Capacity { limit: usize },

    /// The outbound queue stayed full for the whole wait bound.
    #[error("outbound queue still full after {0:?}")]
    SendTimeout(Duration),

    #[error("connection {0} is closed")]
    ConnectionClosed(u32),

    #[error("no property named '{0}'")]
    PropertyNotFound(String),

    #[error("connection {0} not found")]
    ConnectionNotFound(u32),

    /// Submit on a pool created with zero workers.
    #[error("worker pool is disabled")]
    PoolDisabled,

    /// The worker owning the connection has exited and dropped its queue.
    #[error("worker {0} has stopped")]
    WorkerStopped(usize),
}

impl Error {
    /// Errors that end the connection they occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Io(_))
    }

    /// True when the peer simply went away between frames.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
