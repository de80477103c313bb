use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{DecodeError, ErrorReason, Message};

/// Everything that can end a transfer early.
///
/// Each session owns and reports its own errors; none of them cross session
/// boundaries.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("malformed request: {0}")]
    Protocol(#[from] DecodeError),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("another upload is already in progress")]
    Busy,

    #[error("datagram from {0} does not belong to the active session")]
    SessionMismatch(SocketAddr),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no {waiting_for} after {attempts} attempts")]
    Timeout { waiting_for: String, attempts: usize },

    #[error("no data for {0:?}; the transfer cannot be resumed")]
    Stalled(Duration),

    #[error("no response from {0}")]
    NoResponse(SocketAddr),

    #[error("peer refused the transfer: {0}")]
    Rejected(String),

    #[error("unexpected reply: {0}")]
    Unexpected(String),

    #[error("transfer incomplete: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: u64 },
}

/// Why a [`TransferConfig`](crate::TransferConfig) cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("chunk size {0} does not fit in a single datagram")]
    ChunkTooLarge(usize),

    #[error("max retries must be at least 1")]
    ZeroRetries,

    #[error("timeouts must be greater than zero")]
    ZeroTimeout,
}

impl TransferError {
    /// The `ERR` message a server sends for this error.
    ///
    /// I/O failures only expose the error kind, never a path.
    pub fn to_wire(&self) -> Message {
        match self {
            Self::Protocol(_) => Message::error(ErrorReason::BadHeader),
            Self::NotFound(name) => Message::error_with_detail(ErrorReason::NotFound, name.clone()),
            Self::Busy => Message::error(ErrorReason::Busy),
            Self::SessionMismatch(_) => Message::error(ErrorReason::NoSession),
            Self::Io(e) => Message::error(io_reason(e)),
            _ => Message::error(ErrorReason::other("Aborted")),
        }
    }

    /// Build the client-side error for an `ERR` reply.
    pub fn rejected(reason: &ErrorReason, detail: Option<&str>) -> Self {
        match detail {
            Some(detail) => Self::Rejected(format!("{reason}: {detail}")),
            None => Self::Rejected(reason.to_string()),
        }
    }
}

/// Wire reason for an I/O error: its kind, e.g. `PermissionDenied`.
pub fn io_reason(error: &io::Error) -> ErrorReason {
    ErrorReason::other(format!("{:?}", error.kind()))
}
