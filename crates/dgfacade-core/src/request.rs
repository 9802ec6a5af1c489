//! The inbound request envelope.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ResponseChannel;
use crate::error::{GatewayError, GatewayResult};
use crate::ids::RequestId;

/// The ingress channel a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestSource {
    /// REST endpoint.
    Rest,
    /// WebSocket gateway.
    Websocket,
    /// Kafka ingester.
    Kafka,
    /// ActiveMQ ingester.
    Activemq,
    /// Filesystem ingester.
    Filesystem,
    /// RabbitMQ ingester.
    Rabbitmq,
    /// IBM MQ ingester.
    Ibmmq,
    /// SQL ingester.
    Sql,
    /// Manual submission (CLI, tests, operator tooling).
    Manual,
}

impl fmt::Display for RequestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rest => "REST",
            Self::Websocket => "WEBSOCKET",
            Self::Kafka => "KAFKA",
            Self::Activemq => "ACTIVEMQ",
            Self::Filesystem => "FILESYSTEM",
            Self::Rabbitmq => "RABBITMQ",
            Self::Ibmmq => "IBMMQ",
            Self::Sql => "SQL",
            Self::Manual => "MANUAL",
        };
        write!(f, "{name}")
    }
}

impl Default for RequestSource {
    fn default() -> Self {
        Self::Rest
    }
}

/// A structured request submitted to the gateway.
///
/// Serialization is lossless over the declared fields; unknown payload
/// structure is carried verbatim in `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Stable opaque identity; assigned at dispatch when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Uppercase identifier selecting a handler.
    pub request_type: String,
    /// Credential presented by the submitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// User identity derived from the credential at dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// The ingress channel the request arrived on.
    #[serde(default)]
    pub source: RequestSource,
    /// Free-form nested payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Per-request TTL override, in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_minutes: Option<u64>,
    /// Whether this request starts a streaming session.
    #[serde(default)]
    pub streaming: bool,
    /// Egress channels for a streaming session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channels: Option<BTreeSet<ResponseChannel>>,
    /// Destination topic for broker response channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_topic: Option<String>,
    /// When the request was submitted.
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
    /// When execution began, stamped by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_started_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Create a request of the given type with an empty payload.
    #[must_use]
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_id: None,
            request_type: request_type.into(),
            api_key: None,
            user_id: None,
            source: RequestSource::default(),
            payload: serde_json::Value::Null,
            ttl_minutes: None,
            streaming: false,
            response_channels: None,
            response_topic: None,
            submitted_at: Utc::now(),
            execution_started_at: None,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the ingress source.
    #[must_use]
    pub fn with_source(mut self, source: RequestSource) -> Self {
        self.source = source;
        self
    }

    /// Mark the request as streaming on the given channels.
    #[must_use]
    pub fn with_streaming(mut self, channels: impl IntoIterator<Item = ResponseChannel>) -> Self {
        self.streaming = true;
        self.response_channels = Some(channels.into_iter().collect());
        self
    }

    /// Return the request ID, assigning a fresh one if absent.
    pub fn ensure_request_id(&mut self) -> &RequestId {
        self.request_id.get_or_insert_with(RequestId::generate)
    }

    /// Validate the declared fields.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] when the request type is
    /// empty, a streaming request carries no response channels, or a broker
    /// response channel is requested without a `response_topic`.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.request_type.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "request_type is required".to_owned(),
            ));
        }
        if self.streaming {
            let channels = self
                .response_channels
                .as_ref()
                .filter(|set| !set.is_empty())
                .ok_or_else(|| {
                    GatewayError::InvalidRequest(
                        "streaming request requires at least one response channel".to_owned(),
                    )
                })?;
            if channels.iter().any(|ch| ch.is_broker()) && self.response_topic.is_none() {
                return Err(GatewayError::InvalidRequest(
                    "broker response channels require a response_topic".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_preserves_declared_fields() {
        let json = r#"{
            "request_id": "r-1",
            "request_type": "ARITHMETIC",
            "api_key": "dgf-abc",
            "payload": {"operation": "ADD", "operands": [7, 6]},
            "ttl_minutes": 5,
            "streaming": false
        }"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request.request_type, "ARITHMETIC");
        assert_eq!(request.ttl_minutes, Some(5));

        let back = serde_json::to_string(&request).unwrap();
        let reparsed: Request = serde_json::from_str(&back).unwrap();
        assert_eq!(reparsed.request_id, request.request_id);
        assert_eq!(reparsed.payload, request.payload);
        assert_eq!(reparsed.source, request.source);
    }

    #[test]
    fn ensure_request_id_is_stable() {
        let mut request = Request::new("ECHO");
        let first = request.ensure_request_id().clone();
        let second = request.ensure_request_id().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn streaming_without_channels_is_invalid() {
        let mut request = Request::new("MARKET_DATA");
        request.streaming = true;
        let err = request.validate().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));

        request.response_channels = Some(BTreeSet::new());
        assert!(request.validate().is_err());
    }

    #[test]
    fn broker_channel_requires_topic() {
        let mut request =
            Request::new("MARKET_DATA").with_streaming([ResponseChannel::Kafka]);
        assert!(request.validate().is_err());

        request.response_topic = Some("ticks".to_owned());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn websocket_only_streaming_needs_no_topic() {
        let request = Request::new("MARKET_DATA").with_streaming([ResponseChannel::Websocket]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn empty_request_type_is_invalid() {
        let request = Request::new("  ");
        assert!(request.validate().is_err());
    }
}
