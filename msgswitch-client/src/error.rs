//! Client error types.

use msgswitch_protocol::{ProtocolError, ReplyError};
use std::io;
use thiserror::Error;

/// Errors returned by client and server session operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The broker's reply could not be read or decoded.
    #[error("failed to read response: {0}")]
    FailedToReadResponse(String),

    /// The broker answered with a non-success status.
    #[error("unsuccessful response: {0}")]
    UnsuccessfulResponse(ReplyError),

    #[error("request timeout")]
    Timeout,

    /// The destination queue no longer exists.
    #[error("queue deleted: {0}")]
    QueueDeleted(String),

    #[error("communication failure: {0}")]
    Communication(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl ClientError {
    /// Returns whether the connection the error came from is unusable and the
    /// exchange may succeed on a fresh one.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Communication(_) | ClientError::FailedToReadResponse(_)
        )
    }

    pub(crate) fn communication(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ClientError::Communication(error.into())
    }

    pub(crate) fn not_connected() -> Self {
        ClientError::communication(io::Error::new(
            io::ErrorKind::NotConnected,
            "session is disconnected",
        ))
    }
}

impl From<io::Error> for ClientError {
    fn from(error: io::Error) -> Self {
        ClientError::Communication(Box::new(error))
    }
}

/// Failure of a single request/response exchange on one connection.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection closed before any byte of the reply arrived.
    #[error("empty response")]
    Empty,

    /// The connection closed in the middle of a reply.
    #[error("unterminated response")]
    Unterminated,

    #[error("invalid response: {0}")]
    Invalid(#[from] ProtocolError),

    #[error("unexpected response: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },

    #[error("unsuccessful response: {0}")]
    Unsuccessful(ReplyError),

    /// A previous exchange was abandoned midway; the byte stream is out of step.
    #[error("connection is out of step with the broker")]
    Broken,
}

impl From<ExchangeError> for ClientError {
    fn from(error: ExchangeError) -> Self {
        match error {
            ExchangeError::Io(e) => ClientError::from(e),
            ExchangeError::Broken => ClientError::communication(ExchangeError::Broken),
            ExchangeError::Unsuccessful(e) => ClientError::UnsuccessfulResponse(e),
            e @ (ExchangeError::Empty
            | ExchangeError::Unterminated
            | ExchangeError::Invalid(_)
            | ExchangeError::Unexpected { .. }) => ClientError::FailedToReadResponse(e.to_string()),
        }
    }
}
