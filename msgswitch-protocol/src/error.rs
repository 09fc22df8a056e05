//! Protocol error types and broker error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while framing or (de)serializing broker messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'MSWX', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("unexpected stream chunk in request")]
    UnexpectedChunk,

    #[error("unchunked frame inside an unterminated reply body")]
    InterleavedFrame,

    #[error("reply body too large: more than {max} bytes")]
    ReplyTooLarge { max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

/// Error codes a broker attaches to unsuccessful replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    NotLoggedIn,
    QueueNotFound,
    ShuttingDown,
    InternalError,
}

impl ErrorCode {
    /// Returns whether the same request may succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::ShuttingDown | ErrorCode::InternalError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotLoggedIn => "NOT_LOGGED_IN",
            ErrorCode::QueueNotFound => "QUEUE_NOT_FOUND",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(code)
    }
}
