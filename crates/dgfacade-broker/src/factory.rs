//! Broker kind selection and adapter construction.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dgfacade_config::{ConfigError, ResolvedChannel};
use serde_json::Value;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::filesystem::{FsPublisherTransport, FsSubscriberTransport};
use crate::publisher::BrokerPublisher;
use crate::sql::{SqlPublisherTransport, SqlSubscriberTransport};
use crate::stomp::{StompPublisherTransport, StompSubscriberTransport};
use crate::subscriber::BrokerSubscriber;

/// Supported broker protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerKind {
    /// Apache Kafka.
    Kafka,
    /// Confluent Cloud Kafka; a config pre-processing step over Kafka.
    ConfluentKafka,
    /// ActiveMQ over STOMP.
    Activemq,
    /// RabbitMQ over AMQP 0.9.1.
    Rabbitmq,
    /// IBM MQ.
    Ibmmq,
    /// Directory polling.
    Filesystem,
    /// SQL table polling.
    Sql,
}

impl FromStr for BrokerKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "kafka" => Ok(Self::Kafka),
            "confluent_kafka" | "confluent" => Ok(Self::ConfluentKafka),
            // jms arrives pre-normalized by channel resolution, but accept
            // it here too for direct callers.
            "activemq" | "jms" => Ok(Self::Activemq),
            "rabbitmq" | "amqp" => Ok(Self::Rabbitmq),
            "ibmmq" => Ok(Self::Ibmmq),
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "sql" => Ok(Self::Sql),
            other => Err(BrokerError::Unsupported(other.to_owned())),
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kafka => "kafka",
            Self::ConfluentKafka => "confluent_kafka",
            Self::Activemq => "activemq",
            Self::Rabbitmq => "rabbitmq",
            Self::Ibmmq => "ibmmq",
            Self::Filesystem => "filesystem",
            Self::Sql => "sql",
        };
        write!(f, "{name}")
    }
}

/// Rewrite a Confluent channel into plain Kafka properties.
///
/// Maps the structured `authentication` and `schema_registry` blocks onto
/// the native client keys (SASL_SSL + PLAIN with the API key pair, plus
/// schema registry location and credentials).
pub fn apply_confluent_profile(channel: &mut ResolvedChannel) {
    let api_key = channel
        .authentication
        .get("api_key")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let api_secret = channel
        .authentication
        .get("api_secret")
        .and_then(Value::as_str)
        .map(str::to_owned);
    if let (Some(key), Some(secret)) = (api_key, api_secret) {
        let properties = &mut channel.properties;
        properties
            .entry("security.protocol".to_owned())
            .or_insert_with(|| Value::String("SASL_SSL".to_owned()));
        properties
            .entry("sasl.mechanisms".to_owned())
            .or_insert_with(|| Value::String("PLAIN".to_owned()));
        properties.insert("sasl.username".to_owned(), Value::String(key));
        properties.insert("sasl.password".to_owned(), Value::String(secret));
    }
    if let Some(url) = channel
        .schema_registry
        .get("url")
        .and_then(Value::as_str)
        .map(str::to_owned)
    {
        channel
            .properties
            .insert("schema.registry.url".to_owned(), Value::String(url));
        if let Some(auth) = channel
            .schema_registry
            .get("basic_auth")
            .and_then(Value::as_str)
            .map(str::to_owned)
        {
            channel.properties.insert(
                "schema.registry.basic.auth.user.info".to_owned(),
                Value::String(auth),
            );
        }
    }
    debug!(channel = %channel.channel_id, "confluent profile applied");
}

fn kind_of(channel: &ResolvedChannel) -> BrokerResult<BrokerKind> {
    channel.broker_type.parse()
}

/// Construct an uninitialized publisher for the channel's broker kind.
pub fn create_publisher(channel: &ResolvedChannel) -> BrokerResult<Arc<BrokerPublisher>> {
    let mut channel = channel.clone();
    let kind = kind_of(&channel)?;
    let transport: Box<dyn crate::publisher::PublisherTransport> = match kind {
        BrokerKind::Kafka | BrokerKind::ConfluentKafka => {
            if kind == BrokerKind::ConfluentKafka {
                apply_confluent_profile(&mut channel);
            }
            kafka_publisher()?
        },
        BrokerKind::Activemq => Box::new(StompPublisherTransport::new()),
        BrokerKind::Rabbitmq => amqp_publisher()?,
        BrokerKind::Ibmmq => {
            // A broker config naming a protocol this build cannot speak is
            // a configuration error, same as an unresolvable reference.
            return Err(BrokerError::Config(ConfigError::Invalid(
                "ibmmq requires a vendor client with no Rust implementation".to_owned(),
            )));
        },
        BrokerKind::Filesystem => Box::new(FsPublisherTransport::new()),
        BrokerKind::Sql => Box::new(SqlPublisherTransport::new()),
    };
    Ok(BrokerPublisher::new(channel, transport))
}

/// Construct an uninitialized subscriber for the channel's broker kind.
pub fn create_subscriber(channel: &ResolvedChannel) -> BrokerResult<Arc<BrokerSubscriber>> {
    let mut channel = channel.clone();
    let kind = kind_of(&channel)?;
    let transport: Box<dyn crate::subscriber::SubscriberTransport> = match kind {
        BrokerKind::Kafka | BrokerKind::ConfluentKafka => {
            if kind == BrokerKind::ConfluentKafka {
                apply_confluent_profile(&mut channel);
            }
            kafka_subscriber()?
        },
        BrokerKind::Activemq => Box::new(StompSubscriberTransport::new()),
        BrokerKind::Rabbitmq => amqp_subscriber()?,
        BrokerKind::Ibmmq => {
            return Err(BrokerError::Config(ConfigError::Invalid(
                "ibmmq requires a vendor client with no Rust implementation".to_owned(),
            )));
        },
        BrokerKind::Filesystem => Box::new(FsSubscriberTransport::new()),
        BrokerKind::Sql => Box::new(SqlSubscriberTransport::new()),
    };
    Ok(BrokerSubscriber::new(channel, transport))
}

#[cfg(feature = "kafka")]
fn kafka_publisher() -> BrokerResult<Box<dyn crate::publisher::PublisherTransport>> {
    Ok(Box::new(crate::kafka::KafkaPublisherTransport::new()))
}

#[cfg(not(feature = "kafka"))]
fn kafka_publisher() -> BrokerResult<Box<dyn crate::publisher::PublisherTransport>> {
    Err(BrokerError::Unsupported(
        "built without the `kafka` feature".to_owned(),
    ))
}

#[cfg(feature = "kafka")]
fn kafka_subscriber() -> BrokerResult<Box<dyn crate::subscriber::SubscriberTransport>> {
    Ok(Box::new(crate::kafka::KafkaSubscriberTransport::new()))
}

#[cfg(not(feature = "kafka"))]
fn kafka_subscriber() -> BrokerResult<Box<dyn crate::subscriber::SubscriberTransport>> {
    Err(BrokerError::Unsupported(
        "built without the `kafka` feature".to_owned(),
    ))
}

#[cfg(feature = "amqp")]
fn amqp_publisher() -> BrokerResult<Box<dyn crate::publisher::PublisherTransport>> {
    Ok(Box::new(crate::amqp::AmqpPublisherTransport::new()))
}

#[cfg(not(feature = "amqp"))]
fn amqp_publisher() -> BrokerResult<Box<dyn crate::publisher::PublisherTransport>> {
    Err(BrokerError::Unsupported(
        "built without the `amqp` feature".to_owned(),
    ))
}

#[cfg(feature = "amqp")]
fn amqp_subscriber() -> BrokerResult<Box<dyn crate::subscriber::SubscriberTransport>> {
    Ok(Box::new(crate::amqp::AmqpSubscriberTransport::new()))
}

#[cfg(not(feature = "amqp"))]
fn amqp_subscriber() -> BrokerResult<Box<dyn crate::subscriber::SubscriberTransport>> {
    Err(BrokerError::Unsupported(
        "built without the `amqp` feature".to_owned(),
    ))
}
