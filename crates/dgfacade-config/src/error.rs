//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The offending path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A config file could not be parsed.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// The offending path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A referenced entity does not exist.
    #[error("unresolvable {kind} reference: {id}")]
    MissingReference {
        /// What kind of entity was referenced (broker, channel, ingester).
        kind: &'static str,
        /// The missing id.
        id: String,
    },

    /// A config value is structurally invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for dgfacade_core::GatewayError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
