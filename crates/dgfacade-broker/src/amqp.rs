//! RabbitMQ adapter over lapin (AMQP 0.9.1).
//!
//! Publishing goes through the default exchange with the topic as routing
//! key; queues are declared durable on first use. Consumption registers one
//! consumer per destination, forwarding deliveries into an internal channel
//! the poll cycle drains. Messages are acked as they are handed over
//! (at-least-once).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dgfacade_config::ResolvedChannel;
use dgfacade_core::MessageEnvelope;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::publisher::PublisherTransport;
use crate::subscriber::{Delivery, SubscriberTransport};

fn amqp_uri(channel: &ResolvedChannel) -> String {
    if let Some(uri) = channel.property_str("uri") {
        return uri.to_owned();
    }
    let host = channel.property_str("host").unwrap_or("localhost");
    let port = channel.property_u64("port", 5_672);
    let vhost = channel.property_str("vhost").unwrap_or("%2f");
    let username = channel
        .authentication
        .get("username")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("guest");
    let password = channel
        .authentication
        .get("password")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("guest");
    format!("amqp://{username}:{password}@{host}:{port}/{vhost}")
}

async fn open_channel(channel: &ResolvedChannel) -> BrokerResult<(Connection, lapin::Channel)> {
    let uri = amqp_uri(channel);
    let connection = Connection::connect(&uri, ConnectionProperties::default())
        .await
        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
    let amqp_channel = connection
        .create_channel()
        .await
        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
    debug!(channel = %channel.channel_id, "amqp channel opened");
    Ok((connection, amqp_channel))
}

async fn declare_queue(amqp_channel: &lapin::Channel, name: &str) -> BrokerResult<()> {
    amqp_channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
    Ok(())
}

/// RabbitMQ publisher transport.
#[derive(Default)]
pub struct AmqpPublisherTransport {
    connection: Option<(Connection, lapin::Channel)>,
}

impl AmqpPublisherTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self { connection: None }
    }
}

#[async_trait]
impl PublisherTransport for AmqpPublisherTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        self.connection = Some(open_channel(channel).await?);
        Ok(())
    }

    async fn register_topic(&mut self, topic: &str) -> BrokerResult<()> {
        let Some((_, amqp_channel)) = &self.connection else {
            return Err(BrokerError::NotConnected("amqp".to_owned()));
        };
        declare_queue(amqp_channel, topic).await
    }

    async fn send(&mut self, topic: &str, envelope: &MessageEnvelope) -> BrokerResult<()> {
        let Some((_, amqp_channel)) = &self.connection else {
            return Err(BrokerError::NotConnected("amqp".to_owned()));
        };
        let mut table = FieldTable::default();
        for (name, value) in &envelope.headers {
            table.insert(
                ShortString::from(name.clone()),
                AMQPValue::LongString(value.clone().into()),
            );
        }
        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(envelope.message_id.clone()))
            .with_headers(table);
        let confirm = amqp_channel
            .basic_publish(
                "",
                topic,
                BasicPublishOptions::default(),
                envelope.payload.as_bytes(),
                properties,
            )
            .await
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        confirm
            .await
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some((connection, _)) = self.connection.take() {
            let _ = connection.close(200, "shutdown").await;
        }
    }
}

/// RabbitMQ subscriber transport.
pub struct AmqpSubscriberTransport {
    connection: Option<(Connection, lapin::Channel)>,
    consumer_tags: HashMap<String, String>,
    forward_tx: mpsc::Sender<Delivery>,
    forward_rx: mpsc::Receiver<Delivery>,
    forwarders: Vec<tokio::task::JoinHandle<()>>,
    poll_timeout: Duration,
    batch_size: usize,
}

impl AmqpSubscriberTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        let (forward_tx, forward_rx) = mpsc::channel(1_024);
        Self {
            connection: None,
            consumer_tags: HashMap::new(),
            forward_tx,
            forward_rx,
            forwarders: Vec::new(),
            poll_timeout: Duration::from_millis(200),
            batch_size: 50,
        }
    }

    fn abort_forwarders(&mut self) {
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }
}

impl Default for AmqpSubscriberTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriberTransport for AmqpSubscriberTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        self.abort_forwarders();
        self.consumer_tags.clear();
        self.poll_timeout = Duration::from_millis(channel.property_u64("poll_interval_ms", 200));
        self.batch_size = usize::try_from(channel.property_u64("batch_size", 50)).unwrap_or(50);
        self.connection = Some(open_channel(channel).await?);
        Ok(())
    }

    async fn subscribe(&mut self, destination: &str) -> BrokerResult<()> {
        let Some((_, amqp_channel)) = &self.connection else {
            return Err(BrokerError::NotConnected("amqp".to_owned()));
        };
        if self.consumer_tags.contains_key(destination) {
            return Ok(());
        }
        declare_queue(amqp_channel, destination).await?;
        let consumer = amqp_channel
            .basic_consume(
                destination,
                &format!("dgfacade-{destination}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        self.consumer_tags
            .insert(destination.to_owned(), consumer.tag().to_string());

        let forward = self.forward_tx.clone();
        let queue_name = destination.to_owned();
        self.forwarders.push(tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                let Ok(delivery) = delivery else {
                    warn!(queue = %queue_name, "amqp delivery stream error");
                    return;
                };
                let payload = String::from_utf8_lossy(&delivery.data).into_owned();
                let mut envelope = MessageEnvelope::new(queue_name.clone(), payload);
                if let Some(id) = delivery.properties.message_id() {
                    envelope.message_id = id.to_string();
                }
                if let Some(table) = delivery.properties.headers() {
                    for (name, value) in table.inner() {
                        if let AMQPValue::LongString(s) = value {
                            envelope
                                .headers
                                .insert(name.to_string(), s.to_string());
                        }
                    }
                }
                if delivery.ack(BasicAckOptions::default()).await.is_err() {
                    warn!(queue = %queue_name, "amqp ack failed");
                }
                if forward
                    .send(Delivery {
                        destination: queue_name.clone(),
                        envelope,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }));
        Ok(())
    }

    async fn unsubscribe(&mut self, destination: &str) -> BrokerResult<()> {
        let Some((_, amqp_channel)) = &self.connection else {
            return Err(BrokerError::NotConnected("amqp".to_owned()));
        };
        if let Some(tag) = self.consumer_tags.remove(destination) {
            amqp_channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
                .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        }
        Ok(())
    }

    async fn poll(&mut self) -> BrokerResult<Vec<Delivery>> {
        if self.connection.is_none() {
            return Err(BrokerError::NotConnected("amqp".to_owned()));
        }
        let mut deliveries = Vec::new();
        while deliveries.len() < self.batch_size {
            let wait = if deliveries.is_empty() {
                self.poll_timeout
            } else {
                Duration::from_millis(1)
            };
            match tokio::time::timeout(wait, self.forward_rx.recv()).await {
                Err(_) => break,
                Ok(None) => return Err(BrokerError::Protocol("forwarders gone".to_owned())),
                Ok(Some(delivery)) => deliveries.push(delivery),
            }
        }
        Ok(deliveries)
    }

    async fn close(&mut self) {
        self.abort_forwarders();
        if let Some((connection, _)) = self.connection.take() {
            let _ = connection.close(200, "shutdown").await;
        }
    }
}
