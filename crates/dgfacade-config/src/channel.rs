//! Input/output channel definitions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::SslConfig;
use crate::error::ConfigResult;
use crate::loader::JsonDirRegistry;

/// What a destination name refers to on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Publish/subscribe topic.
    Topic,
    /// Point-to-point queue.
    Queue,
    /// Filesystem directory.
    Directory,
    /// SQL table.
    Table,
}

impl Default for DestinationKind {
    fn default() -> Self {
        Self::Queue
    }
}

/// One named destination on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Topic/queue/directory/table name.
    pub name: String,
    /// Destination kind.
    #[serde(rename = "type", default)]
    pub kind: DestinationKind,
}

fn default_queue_depth() -> usize {
    10_000
}
fn default_warning_pct() -> u8 {
    80
}
fn default_critical_pct() -> u8 {
    95
}
fn default_drain_resume_pct() -> u8 {
    50
}

/// Internal queue sizing for a channel's subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Backpressure limit; the subscriber stops pulling at this depth.
    #[serde(default = "default_queue_depth")]
    pub depth: usize,
    /// Depth percentage that logs a warning.
    #[serde(default = "default_warning_pct")]
    pub warning_threshold_pct: u8,
    /// Depth percentage that logs at error level.
    #[serde(default = "default_critical_pct")]
    pub critical_threshold_pct: u8,
    /// Depth percentage at which a paused transport resumes pulling.
    #[serde(default = "default_drain_resume_pct")]
    pub drain_resume_pct: u8,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            depth: default_queue_depth(),
            warning_threshold_pct: default_warning_pct(),
            critical_threshold_pct: default_critical_pct(),
            drain_resume_pct: default_drain_resume_pct(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Retry policy for channel operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// One channel definition (`config/input-channels/<id>.json` or
/// `config/output-channels/<id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel transport type; `jms` normalizes to `activemq`.
    #[serde(rename = "type")]
    pub channel_type: String,
    /// The broker this channel rides on.
    pub broker: String,
    /// Destinations on the broker.
    #[serde(default)]
    pub destinations: Vec<Destination>,
    /// Subscriber queue sizing.
    #[serde(default)]
    pub queue: QueueSettings,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Channel-level TLS override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslConfig>,
    /// Channel-level property overrides merged over the broker's.
    #[serde(flatten)]
    pub overrides: serde_json::Map<String, serde_json::Value>,
}

/// Registry over one channel directory.
#[derive(Debug)]
pub struct ChannelRegistry {
    inner: JsonDirRegistry<ChannelConfig>,
}

impl ChannelRegistry {
    /// Load the channel directory.
    pub fn open(dir: impl AsRef<Path>) -> ConfigResult<Self> {
        Ok(Self {
            inner: JsonDirRegistry::open(dir.as_ref())?,
        })
    }

    /// Look up a channel by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ChannelConfig> {
        self.inner.get(id)
    }

    /// Snapshot of all channels.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, ChannelConfig>> {
        self.inner.snapshot()
    }

    /// Rebuild from disk.
    pub fn reload(&self) -> ConfigResult<usize> {
        self.inner.reload()
    }

    /// The watched directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.inner.dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_with_overrides() {
        let json = r#"{
            "type": "jms",
            "broker": "amq-east",
            "destinations": [{"name": "requests.in", "type": "queue"}],
            "queue": {"depth": 500},
            "poll_interval_seconds": 2
        }"#;
        let channel: ChannelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(channel.channel_type, "jms");
        assert_eq!(channel.broker, "amq-east");
        assert_eq!(channel.destinations[0].kind, DestinationKind::Queue);
        assert_eq!(channel.queue.depth, 500);
        assert_eq!(channel.queue.warning_threshold_pct, 80);
        assert_eq!(channel.overrides["poll_interval_seconds"], 2);
    }

    #[test]
    fn queue_defaults() {
        let settings = QueueSettings::default();
        assert_eq!(settings.depth, 10_000);
        assert_eq!(settings.drain_resume_pct, 50);
    }
}
