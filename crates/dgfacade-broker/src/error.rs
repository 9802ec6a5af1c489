//! Broker adapter error types.

use thiserror::Error;

/// Errors raised by broker publishers and subscribers.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The adapter is not connected; the supervisor is reconnecting.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The adapter was closed and accepts no further work.
    #[error("adapter closed")]
    Closed,

    /// Wire-level or client-library failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SQL adapter failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Broker kind not available in this build or deployment.
    #[error("unsupported broker: {0}")]
    Unsupported(String),

    /// Configuration failure while resolving the channel chain.
    #[error(transparent)]
    Config(#[from] dgfacade_config::ConfigError),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BrokerError> for dgfacade_core::GatewayError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Config(inner) => inner.into(),
            other => Self::BrokerUnavailable(other.to_string()),
        }
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
