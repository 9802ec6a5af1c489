//! The gateway error taxonomy.

use thiserror::Error;

use crate::ids::RequestId;
use crate::response::Response;

/// Errors surfaced at the gateway's component boundaries.
///
/// Handler code may fail internally however it likes; the engine catches at
/// the boundary and translates into one of these kinds, which map onto the
/// `status`/`message` fields of the outbound [`Response`].
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Credential missing or invalid.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No enabled handler configuration resolves for the request type.
    #[error("no handler registered for request type {request_type}")]
    HandlerNotFound {
        /// The request type that failed to resolve.
        request_type: String,
    },

    /// Request validation failure.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Execution exceeded its deadline.
    #[error("execution exceeded its {ttl_minutes} minute deadline")]
    TtlExceeded {
        /// The effective TTL that fired.
        ttl_minutes: u64,
    },

    /// Handler code raised.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// Broker adapter not connected or unable to deliver.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Unresolvable channel/broker reference or malformed configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Cluster forward call failed; callers fall back to local execution.
    #[error("cluster forward failed: {0}")]
    ClusterForwardFailed(String),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The stable error kind code carried in result payloads and logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::TtlExceeded { .. } => "TTL_EXCEEDED",
            Self::HandlerFailure(_) => "HANDLER_FAILURE",
            Self::BrokerUnavailable(_) => "BROKER_UNAVAILABLE",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::ClusterForwardFailed(_) => "CLUSTER_FORWARD_FAILED",
            Self::Serialization(_) => "INVALID_REQUEST",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Convert into an outbound error [`Response`] for the given request.
    ///
    /// TTL expiry maps to the `TIMEOUT` status; every other kind maps to
    /// `ERROR` with the kind code included in the result payload.
    #[must_use]
    pub fn to_response(&self, request_id: RequestId) -> Response {
        let response = match self {
            Self::TtlExceeded { .. } => Response::timeout(request_id, self.to_string()),
            _ => Response::error(request_id, self.to_string()),
        };
        response.with_result(serde_json::json!({ "error_kind": self.code() }))
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
