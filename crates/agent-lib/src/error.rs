//! Error taxonomy for polling, flow decoding and the event bus

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Unreachable,
    ProtocolError,
    AuthError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::AuthError => "auth_error",
        }
    }
}

/// Errors surfaced by a protocol poller
#[derive(Debug, Error)]
pub enum PollError {
    /// No response within the allowed time
    #[error("poll timed out")]
    Timeout,

    /// Transport-level failure
    #[error("device unreachable: {0}")]
    Unreachable(#[from] std::io::Error),

    /// Malformed or unexpected response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bad credentials; waiting will not fix this
    #[error("authentication rejected: {0}")]
    Auth(String),
}

impl PollError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PollError::Timeout => ErrorKind::Timeout,
            PollError::Unreachable(_) => ErrorKind::Unreachable,
            PollError::Protocol(_) => ErrorKind::ProtocolError,
            PollError::Auth(_) => ErrorKind::AuthError,
        }
    }
}

/// Errors from the flow decoder. Any error means zero records were emitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated packet: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unsupported flow export version {0}")]
    UnsupportedVersion(u16),

    #[error("expected flow export version {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },

    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Errors from publishing onto the event bus
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// At least one subscriber was full past the publish timeout
    #[error("sample dropped for {dropped} subscriber(s) under backpressure")]
    BackpressureDrop { dropped: usize },

    #[error("event bus is closed")]
    Closed,
}
