//! Kafka adapter over librdkafka.
//!
//! Native-client properties from the resolved channel are passed straight
//! through to `rdkafka::ClientConfig`; the SSL block maps onto the
//! `ssl.*` properties. Consumption long-polls with a short timeout and
//! honours backpressure by pausing the consumer's assignment.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dgfacade_config::ResolvedChannel;
use dgfacade_core::MessageEnvelope;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::publisher::PublisherTransport;
use crate::subscriber::{Delivery, SubscriberTransport};

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn client_config(channel: &ResolvedChannel) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in &channel.properties {
        if let Some(value) = scalar_to_string(value) {
            config.set(key, value);
        }
    }
    if channel.ssl.enabled {
        config.set("security.protocol", "SSL");
        if let Some(ca) = channel.ssl.ca_cert.as_deref() {
            config.set("ssl.ca.location", ca);
        }
        if let Some(cert) = channel.ssl.client_cert.as_deref() {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(key) = channel.ssl.client_key.as_deref() {
            config.set("ssl.key.location", key);
        }
    }
    config
}

/// Kafka publisher transport.
#[derive(Default)]
pub struct KafkaPublisherTransport {
    producer: Option<FutureProducer>,
    send_timeout: Duration,
}

impl KafkaPublisherTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            producer: None,
            send_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl PublisherTransport for KafkaPublisherTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        self.send_timeout =
            Duration::from_millis(channel.property_u64("send_timeout_ms", 30_000));
        let producer: FutureProducer = client_config(channel)
            .create()
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        self.producer = Some(producer);
        debug!(channel = %channel.channel_id, "kafka producer created");
        Ok(())
    }

    async fn send(&mut self, topic: &str, envelope: &MessageEnvelope) -> BrokerResult<()> {
        let Some(producer) = &self.producer else {
            return Err(BrokerError::NotConnected("kafka".to_owned()));
        };
        let mut headers = OwnedHeaders::new();
        for (name, value) in &envelope.headers {
            headers = headers.insert(Header {
                key: name,
                value: Some(value.as_str()),
            });
        }
        let record = FutureRecord::to(topic)
            .key(&envelope.message_id)
            .payload(&envelope.payload)
            .headers(headers);
        producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(err, _)| BrokerError::Protocol(err.to_string()))?;
        Ok(())
    }

    async fn flush(&mut self) -> BrokerResult<()> {
        if let Some(producer) = &self.producer {
            rdkafka::producer::Producer::flush(producer, Timeout::After(self.send_timeout))
                .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.producer = None;
    }
}

/// Kafka subscriber transport.
#[derive(Default)]
pub struct KafkaSubscriberTransport {
    consumer: Option<StreamConsumer>,
    topics: Vec<String>,
    poll_timeout: Duration,
}

impl KafkaSubscriberTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            consumer: None,
            topics: Vec::new(),
            // Long-poll with a short timeout so shutdown and backpressure
            // checks stay responsive.
            poll_timeout: Duration::from_millis(200),
        }
    }

    fn apply_subscription(&self) -> BrokerResult<()> {
        let Some(consumer) = &self.consumer else {
            return Err(BrokerError::NotConnected("kafka".to_owned()));
        };
        // Dynamic subscription: the union of registered destinations.
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        if topics.is_empty() {
            consumer
                .unsubscribe();
            return Ok(());
        }
        consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl SubscriberTransport for KafkaSubscriberTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        let mut config = client_config(channel);
        if channel.property_str("group.id").is_none() {
            config.set("group.id", format!("dgfacade-{}", channel.channel_id));
        }
        config.set("enable.auto.commit", "true");
        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        self.poll_timeout = Duration::from_millis(channel.property_u64("poll_timeout_ms", 200));
        self.consumer = Some(consumer);
        self.apply_subscription()?;
        debug!(channel = %channel.channel_id, "kafka consumer created");
        Ok(())
    }

    async fn subscribe(&mut self, destination: &str) -> BrokerResult<()> {
        if !self.topics.iter().any(|t| t == destination) {
            self.topics.push(destination.to_owned());
        }
        self.apply_subscription()
    }

    async fn unsubscribe(&mut self, destination: &str) -> BrokerResult<()> {
        self.topics.retain(|t| t != destination);
        self.apply_subscription()
    }

    async fn poll(&mut self) -> BrokerResult<Vec<Delivery>> {
        let Some(consumer) = &self.consumer else {
            return Err(BrokerError::NotConnected("kafka".to_owned()));
        };
        if self.topics.is_empty() {
            return Ok(Vec::new());
        }
        match tokio::time::timeout(self.poll_timeout, consumer.recv()).await {
            Err(_) => Ok(Vec::new()),
            Ok(Err(err)) => Err(BrokerError::Protocol(err.to_string())),
            Ok(Ok(message)) => {
                let topic = message.topic().to_owned();
                let payload = message
                    .payload()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default();
                let mut headers = HashMap::new();
                if let Some(borrowed) = message.headers() {
                    for header in borrowed.iter() {
                        if let Some(value) = header.value {
                            headers.insert(
                                header.key.to_owned(),
                                String::from_utf8_lossy(value).into_owned(),
                            );
                        }
                    }
                }
                let message_id = message
                    .key()
                    .map(|key| String::from_utf8_lossy(key).into_owned())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut envelope = MessageEnvelope::new(topic.clone(), payload)
                    .with_position(message.partition(), message.offset());
                envelope.message_id = message_id;
                envelope.headers = headers;
                Ok(vec![Delivery {
                    destination: topic,
                    envelope,
                }])
            },
        }
    }

    async fn pause(&mut self) {
        if let Some(consumer) = &self.consumer {
            match consumer.assignment() {
                Ok(assignment) => {
                    if let Err(err) = consumer.pause(&assignment) {
                        warn!(error = %err, "kafka pause failed");
                    }
                },
                Err(err) => warn!(error = %err, "kafka assignment lookup failed"),
            }
        }
    }

    async fn resume(&mut self) {
        if let Some(consumer) = &self.consumer {
            match consumer.assignment() {
                Ok(assignment) => {
                    if let Err(err) = consumer.resume(&assignment) {
                        warn!(error = %err, "kafka resume failed");
                    }
                },
                Err(err) => warn!(error = %err, "kafka assignment lookup failed"),
            }
        }
    }

    async fn close(&mut self) {
        self.consumer = None;
    }
}
