//! Server error types.

use crate::config::ConfigError;
use msgswitch_client::{ClientError, ExchangeError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Client(#[from] ClientError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("server is already listening")]
    AlreadyListening,
}

impl ServerError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Io(_) => true,
            ServerError::Client(e) => e.is_retryable(),
            ServerError::Config(_) | ServerError::ShuttingDown | ServerError::AlreadyListening => {
                false
            }
        }
    }
}

impl From<ExchangeError> for ServerError {
    fn from(error: ExchangeError) -> Self {
        ServerError::Client(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(ServerError::Io(refused).is_retryable());
        assert!(ServerError::from(ExchangeError::Empty).is_retryable());
        assert!(!ServerError::ShuttingDown.is_retryable());
        assert!(!ServerError::Config(ConfigError::ValidationError("queue".into())).is_retryable());
    }
}
