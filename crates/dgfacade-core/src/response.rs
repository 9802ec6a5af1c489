//! The outbound response envelope.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, SessionId};

/// Outcome classification of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// The handler completed normally.
    Success,
    /// The handler or the dispatch pipeline failed.
    Error,
    /// The execution exceeded its TTL.
    Timeout,
    /// Acknowledgement that a streaming session started.
    StreamingStarted,
    /// An incremental streaming payload.
    StreamingData,
    /// The final message of a streaming session.
    StreamingEnded,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::StreamingStarted => "STREAMING_STARTED",
            Self::StreamingData => "STREAMING_DATA",
            Self::StreamingEnded => "STREAMING_ENDED",
        };
        write!(f, "{name}")
    }
}

/// A response produced by the gateway for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The request this response answers.
    pub request_id: RequestId,
    /// Outcome classification.
    pub status: ResponseStatus,
    /// Handler type (request type) that produced the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_type: Option<String>,
    /// Identity of the handler execution that produced the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<String>,
    /// Wall-clock execution time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// When the response was produced.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Human-readable description, populated for errors and session events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Free-form result payload.
    #[serde(default)]
    pub result: serde_json::Value,
    /// Owning streaming session, stamped on streaming responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Strictly increasing per-session sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl Response {
    fn base(request_id: RequestId, status: ResponseStatus) -> Self {
        Self {
            request_id,
            status,
            handler_type: None,
            handler_id: None,
            execution_time_ms: None,
            timestamp: Utc::now(),
            message: None,
            result: serde_json::Value::Null,
            session_id: None,
            sequence: None,
        }
    }

    /// A successful response carrying a result payload.
    #[must_use]
    pub fn success(request_id: RequestId, result: serde_json::Value) -> Self {
        let mut response = Self::base(request_id, ResponseStatus::Success);
        response.result = result;
        response
    }

    /// An error response carrying a description.
    #[must_use]
    pub fn error(request_id: RequestId, message: impl Into<String>) -> Self {
        let mut response = Self::base(request_id, ResponseStatus::Error);
        response.message = Some(message.into());
        response
    }

    /// A TTL-expiry response.
    #[must_use]
    pub fn timeout(request_id: RequestId, message: impl Into<String>) -> Self {
        let mut response = Self::base(request_id, ResponseStatus::Timeout);
        response.message = Some(message.into());
        response
    }

    /// Streaming session acknowledgement.
    #[must_use]
    pub fn streaming_started(request_id: RequestId, session_id: SessionId) -> Self {
        let mut response = Self::base(request_id, ResponseStatus::StreamingStarted);
        response.session_id = Some(session_id);
        response
    }

    /// Final streaming session message with a termination reason.
    #[must_use]
    pub fn streaming_ended(
        request_id: RequestId,
        session_id: SessionId,
        reason: impl Into<String>,
    ) -> Self {
        let mut response = Self::base(request_id, ResponseStatus::StreamingEnded);
        response.session_id = Some(session_id);
        response.message = Some(reason.into());
        response
    }

    /// Attach a result payload.
    #[must_use]
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = result;
        self
    }

    /// Whether the response is a terminal (non-incremental) one.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self.status,
            ResponseStatus::StreamingStarted | ResponseStatus::StreamingData
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&ResponseStatus::StreamingData).unwrap();
        assert_eq!(json, "\"STREAMING_DATA\"");
    }

    #[test]
    fn success_carries_result() {
        let response = Response::success("r-1".into(), serde_json::json!({"result": 13}));
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.result["result"], 13);
        assert!(response.message.is_none());
    }

    #[test]
    fn error_carries_message() {
        let response = Response::error("r-2".into(), "Division by zero");
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.message.as_deref(), Some("Division by zero"));
    }

    #[test]
    fn streaming_data_is_not_terminal() {
        let mut response = Response::success("r-3".into(), serde_json::Value::Null);
        response.status = ResponseStatus::StreamingData;
        assert!(!response.is_terminal());
        response.status = ResponseStatus::StreamingEnded;
        assert!(response.is_terminal());
    }
}
