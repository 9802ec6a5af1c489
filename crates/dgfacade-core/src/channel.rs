//! Response channel enumeration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An egress channel a streaming session can fan responses out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseChannel {
    /// WebSocket gateway destination.
    Websocket,
    /// Kafka topic via a configured output channel.
    Kafka,
    /// ActiveMQ destination via a configured output channel.
    Activemq,
    /// RabbitMQ destination via a configured output channel.
    Rabbitmq,
    /// IBM MQ destination via a configured output channel.
    Ibmmq,
    /// Buffered for retrieval through the REST pull endpoint.
    Rest,
}

impl ResponseChannel {
    /// Whether delivery on this channel goes through a broker and therefore
    /// requires a `response_topic` on the request.
    #[must_use]
    pub fn is_broker(self) -> bool {
        matches!(
            self,
            Self::Kafka | Self::Activemq | Self::Rabbitmq | Self::Ibmmq
        )
    }
}

impl fmt::Display for ResponseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Websocket => "WEBSOCKET",
            Self::Kafka => "KAFKA",
            Self::Activemq => "ACTIVEMQ",
            Self::Rabbitmq => "RABBITMQ",
            Self::Ibmmq => "IBMMQ",
            Self::Rest => "REST",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_screaming_snake() {
        let json = serde_json::to_string(&ResponseChannel::Websocket).unwrap();
        assert_eq!(json, "\"WEBSOCKET\"");
        let back: ResponseChannel = serde_json::from_str("\"KAFKA\"").unwrap();
        assert_eq!(back, ResponseChannel::Kafka);
    }

    #[test]
    fn broker_channels_need_topics() {
        assert!(ResponseChannel::Kafka.is_broker());
        assert!(ResponseChannel::Ibmmq.is_broker());
        assert!(!ResponseChannel::Websocket.is_broker());
        assert!(!ResponseChannel::Rest.is_broker());
    }
}
