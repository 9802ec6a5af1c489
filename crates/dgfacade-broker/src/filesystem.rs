//! Filesystem broker adapter.
//!
//! The publisher writes one file per envelope under `<base_dir>/<topic>/`,
//! buffering and flushing on a schedule. The subscriber polls a directory
//! per destination, one file = one envelope ordered by modification time;
//! files move to `processed/` on success and `error/` on failure, both
//! created on first use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dgfacade_config::ResolvedChannel;
use dgfacade_core::MessageEnvelope;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::publisher::PublisherTransport;
use crate::subscriber::{Delivery, SubscriberTransport};

fn base_dir(channel: &ResolvedChannel) -> BrokerResult<PathBuf> {
    channel
        .property_str("base_dir")
        .map(PathBuf::from)
        .ok_or_else(|| {
            BrokerError::Config(dgfacade_config::ConfigError::Invalid(format!(
                "filesystem channel {} requires a base_dir property",
                channel.channel_id
            )))
        })
}

/// Writes envelopes as JSON files.
#[derive(Debug, Default)]
pub struct FsPublisherTransport {
    base: Option<PathBuf>,
    pending: Vec<(String, MessageEnvelope)>,
    batch_size: usize,
    flush_interval: Duration,
}

impl FsPublisherTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: None,
            pending: Vec::new(),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
        }
    }

    fn write_one(base: &Path, topic: &str, envelope: &MessageEnvelope) -> BrokerResult<()> {
        let dir = base.join(topic);
        std::fs::create_dir_all(&dir)?;
        let file_name = format!(
            "{}_{}.json",
            envelope.timestamp.timestamp_micros(),
            envelope.message_id
        );
        let body = serde_json::to_vec_pretty(envelope)?;
        std::fs::write(dir.join(file_name), body)?;
        Ok(())
    }
}

#[async_trait]
impl PublisherTransport for FsPublisherTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        let base = base_dir(channel)?;
        std::fs::create_dir_all(&base)?;
        self.batch_size = usize::try_from(channel.property_u64("batch_size", 100)).unwrap_or(100);
        self.flush_interval =
            Duration::from_millis(channel.property_u64("flush_interval_ms", 1_000));
        self.base = Some(base);
        Ok(())
    }

    async fn send(&mut self, topic: &str, envelope: &MessageEnvelope) -> BrokerResult<()> {
        self.pending.push((topic.to_owned(), envelope.clone()));
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn register_topic(&mut self, topic: &str) -> BrokerResult<()> {
        if let Some(base) = &self.base {
            std::fs::create_dir_all(base.join(topic))?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> BrokerResult<()> {
        let Some(base) = self.base.clone() else {
            return Err(BrokerError::NotConnected("filesystem".to_owned()));
        };
        for (topic, envelope) in self.pending.drain(..) {
            Self::write_one(&base, &topic, &envelope)?;
        }
        Ok(())
    }

    fn flush_interval(&self) -> Option<Duration> {
        Some(self.flush_interval)
    }
}

/// Polls destination directories for files.
#[derive(Debug, Default)]
pub struct FsSubscriberTransport {
    base: Option<PathBuf>,
    destinations: Vec<String>,
    batch_size: usize,
}

impl FsSubscriberTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: None,
            destinations: Vec::new(),
            batch_size: 50,
        }
    }

    /// Move a file into a sibling bucket (`processed/` or `error/`),
    /// creating the bucket on first use.
    fn move_to(path: &Path, bucket: &str) -> BrokerResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| BrokerError::Protocol(format!("{} has no parent", path.display())))?
            .join(bucket);
        std::fs::create_dir_all(&dir)?;
        let Some(name) = path.file_name() else {
            return Err(BrokerError::Protocol(format!(
                "{} has no file name",
                path.display()
            )));
        };
        let mut target = dir.join(name);
        if target.exists() {
            let unique = format!(
                "{}_{}",
                uuid::Uuid::new_v4(),
                name.to_string_lossy()
            );
            target = dir.join(unique);
        }
        std::fs::rename(path, target)?;
        Ok(())
    }

    fn poll_destination(&self, base: &Path, destination: &str) -> BrokerResult<Vec<Delivery>> {
        let dir = base.join(destination);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);
            files.push((modified, path));
        }
        // Ordering by modification time.
        files.sort();
        files.truncate(self.batch_size);

        let mut deliveries = Vec::new();
        for (_, path) in files {
            match std::fs::read_to_string(&path) {
                Ok(contents) if !contents.trim().is_empty() => {
                    // A file written by the matching publisher is a full
                    // envelope; anything else is carried as a raw payload.
                    let envelope = serde_json::from_str::<MessageEnvelope>(&contents)
                        .unwrap_or_else(|_| {
                            MessageEnvelope::new(destination, contents).with_header(
                                "file_name",
                                path.file_name()
                                    .map(|n| n.to_string_lossy().into_owned())
                                    .unwrap_or_default(),
                            )
                        });
                    Self::move_to(&path, "processed")?;
                    deliveries.push(Delivery {
                        destination: destination.to_owned(),
                        envelope,
                    });
                },
                Ok(_) => {
                    warn!(file = %path.display(), "empty file moved to error/");
                    Self::move_to(&path, "error")?;
                },
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "unreadable file moved to error/");
                    Self::move_to(&path, "error")?;
                },
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl SubscriberTransport for FsSubscriberTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        let base = base_dir(channel)?;
        std::fs::create_dir_all(&base)?;
        self.batch_size = usize::try_from(channel.property_u64("batch_size", 50)).unwrap_or(50);
        self.base = Some(base);
        Ok(())
    }

    async fn subscribe(&mut self, destination: &str) -> BrokerResult<()> {
        if !self.destinations.iter().any(|d| d == destination) {
            self.destinations.push(destination.to_owned());
        }
        if let Some(base) = &self.base {
            let dir = base.join(destination);
            // Working directories exist from first use.
            std::fs::create_dir_all(dir.join("processed"))?;
            std::fs::create_dir_all(dir.join("error"))?;
            debug!(destination, "watching directory");
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, destination: &str) -> BrokerResult<()> {
        self.destinations.retain(|d| d != destination);
        Ok(())
    }

    async fn poll(&mut self) -> BrokerResult<Vec<Delivery>> {
        let Some(base) = self.base.clone() else {
            return Err(BrokerError::NotConnected("filesystem".to_owned()));
        };
        let mut deliveries = Vec::new();
        for destination in self.destinations.clone() {
            deliveries.extend(self.poll_destination(&base, &destination)?);
        }
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_for(base: &Path) -> ResolvedChannel {
        let broker: dgfacade_config::BrokerConfig = serde_json::from_value(serde_json::json!({
            "type": "filesystem",
            "connection": {"base_dir": base.display().to_string()}
        }))
        .unwrap();
        let channel: dgfacade_config::ChannelConfig = serde_json::from_value(serde_json::json!({
            "type": "filesystem",
            "broker": "fs",
            "destinations": [{"name": "inbox", "type": "directory"}]
        }))
        .unwrap();
        dgfacade_config::resolve::resolve_channel("fs-channel", &channel, &broker).unwrap()
    }

    #[tokio::test]
    async fn publisher_to_subscriber_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = channel_for(tmp.path());

        let mut publisher = FsPublisherTransport::new();
        publisher.connect(&channel).await.unwrap();
        let envelope = MessageEnvelope::new("inbox", "{\"request_type\":\"ECHO\"}")
            .with_header("origin", "test");
        publisher.send("inbox", &envelope).await.unwrap();
        publisher.flush().await.unwrap();

        let mut subscriber = FsSubscriberTransport::new();
        subscriber.connect(&channel).await.unwrap();
        subscriber.subscribe("inbox").await.unwrap();
        let batch = subscriber.poll().await.unwrap();

        assert_eq!(batch.len(), 1);
        let received = &batch[0].envelope;
        assert_eq!(received.message_id, envelope.message_id);
        assert_eq!(received.payload, envelope.payload);
        assert_eq!(received.headers, envelope.headers);

        // Consumed file landed in processed/.
        let processed = std::fs::read_dir(tmp.path().join("inbox/processed"))
            .unwrap()
            .count();
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn raw_file_is_carried_as_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = channel_for(tmp.path());

        let mut subscriber = FsSubscriberTransport::new();
        subscriber.connect(&channel).await.unwrap();
        subscriber.subscribe("inbox").await.unwrap();

        std::fs::write(
            tmp.path().join("inbox/request.json"),
            r#"{"request_type": "ECHO", "payload": {"message": "hi"}}"#,
        )
        .unwrap();

        let batch = subscriber.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].envelope.payload.contains("\"ECHO\""));
        assert_eq!(
            batch[0].envelope.headers.get("file_name").map(String::as_str),
            Some("request.json")
        );
    }

    #[tokio::test]
    async fn empty_file_moves_to_error() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = channel_for(tmp.path());

        let mut subscriber = FsSubscriberTransport::new();
        subscriber.connect(&channel).await.unwrap();
        subscriber.subscribe("inbox").await.unwrap();

        std::fs::write(tmp.path().join("inbox/empty.json"), "").unwrap();
        let batch = subscriber.poll().await.unwrap();
        assert!(batch.is_empty());

        let errored = std::fs::read_dir(tmp.path().join("inbox/error"))
            .unwrap()
            .count();
        assert_eq!(errored, 1);
    }

    #[tokio::test]
    async fn files_delivered_in_modification_order() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = channel_for(tmp.path());

        let mut subscriber = FsSubscriberTransport::new();
        subscriber.connect(&channel).await.unwrap();
        subscriber.subscribe("inbox").await.unwrap();

        for n in 0..3 {
            std::fs::write(tmp.path().join(format!("inbox/f{n}")), format!("body-{n}")).unwrap();
            // Distinct modification times.
            std::thread::sleep(Duration::from_millis(10));
        }

        let batch = subscriber.poll().await.unwrap();
        let payloads: Vec<_> = batch.iter().map(|d| d.envelope.payload.as_str()).collect();
        assert_eq!(payloads, vec!["body-0", "body-1", "body-2"]);
    }
}
