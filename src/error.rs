use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

use crate::core::connection::ConnState;

/// Errors raised by the ring engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No free slot in the ring's submission queue.
    #[error("submission queue is full")]
    SubmissionQueueFull,

    /// A descriptor expected to be tracked has no connection object.
    #[error("connection is missing for fd {0}")]
    ConnectionMissing(RawFd),

    /// No remote address was stored for a handed-off descriptor.
    #[error("remote address not found for fd {0}")]
    AddressNotFound(RawFd),

    #[error("unknown connection state {state:?} for fd {fd}")]
    UnknownConnectionState { fd: RawFd, state: ConnState },

    /// The worker uses native ring messaging and has no fallback queue.
    #[error("connection queue is not initialized")]
    ConnectionQueueMissing,

    #[error("unsupported address family {0}")]
    UnsupportedAddressFamily(i32),

    #[error("worker pool is empty")]
    EmptyPool,

    #[error("worker loop is already running")]
    AlreadyRunning,

    #[error("invalid balancing strategy: {0}")]
    InvalidStrategy(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that only concern one connection and never stop a loop.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            Error::ConnectionMissing(_)
                | Error::AddressNotFound(_)
                | Error::UnknownConnectionState { .. }
        )
    }
}
