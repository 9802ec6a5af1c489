//! The canonical unit moving between broker adapters and the core.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single message as seen by broker publishers and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message identity.
    pub message_id: String,
    /// Topic, queue, directory, or table the message belongs to.
    pub topic: String,
    /// The message body.
    pub payload: String,
    /// Transport headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// When the envelope was created.
    pub timestamp: DateTime<Utc>,
    /// Broker partition, when the transport exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    /// Broker offset, when the transport exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl MessageEnvelope {
    /// Create an envelope with a generated message ID.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            timestamp: Utc::now(),
            partition: None,
            offset: None,
        }
    }

    /// Attach a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Attach partition/offset coordinates.
    #[must_use]
    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.partition = Some(partition);
        self.offset = Some(offset);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_identity_payload_headers() {
        let envelope = MessageEnvelope::new("requests", "{\"a\":1}")
            .with_header("content-type", "application/json")
            .with_position(3, 42);

        let json = serde_json::to_string(&envelope).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(back.message_id, envelope.message_id);
        assert_eq!(back.payload, envelope.payload);
        assert_eq!(back.headers, envelope.headers);
        assert_eq!(back.partition, Some(3));
        assert_eq!(back.offset, Some(42));
    }
}
