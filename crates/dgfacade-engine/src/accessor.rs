//! Handler-facing channel access with lazily-cached adapters.

use std::sync::Arc;

use dashmap::DashMap;
use dgfacade_broker::{BrokerPublisher, BrokerSubscriber, create_publisher, create_subscriber};
use dgfacade_config::ConfigStore;
use dgfacade_core::GatewayResult;
use tracing::{debug, warn};

/// Lazily constructs broker publishers and subscribers by channel id,
/// resolving the channel → broker chain and caching the instance for the
/// process lifetime.
pub struct ChannelAccessor {
    store: Arc<ConfigStore>,
    publishers: DashMap<String, Arc<BrokerPublisher>>,
    subscribers: DashMap<String, Arc<BrokerSubscriber>>,
}

impl ChannelAccessor {
    /// Create an accessor over the config store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            publishers: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    /// The underlying config store.
    #[must_use]
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Publisher for an output channel id, built on first use.
    ///
    /// A publisher whose initial connect fails is still cached; its
    /// reconnect loop keeps running and publishes fail with
    /// `BROKER_UNAVAILABLE` until it comes up.
    pub async fn publisher(&self, channel_id: &str) -> GatewayResult<Arc<BrokerPublisher>> {
        if let Some(existing) = self.publishers.get(channel_id) {
            return Ok(Arc::clone(existing.value()));
        }
        let resolved = self.store.resolve_output_channel(channel_id)?;
        let publisher = create_publisher(&resolved)?;
        if let Err(err) = publisher.initialize().await {
            warn!(channel = %channel_id, error = %err, "publisher starting disconnected");
        }
        let cached = self
            .publishers
            .entry(channel_id.to_owned())
            .or_insert_with(|| Arc::clone(&publisher))
            .clone();
        if !Arc::ptr_eq(&cached, &publisher) {
            // Lost a construction race; discard the spare.
            publisher.close().await;
        }
        debug!(channel = %channel_id, "publisher ready");
        Ok(cached)
    }

    /// Subscriber for an input channel id, built on first use.
    pub async fn subscriber(&self, channel_id: &str) -> GatewayResult<Arc<BrokerSubscriber>> {
        if let Some(existing) = self.subscribers.get(channel_id) {
            return Ok(Arc::clone(existing.value()));
        }
        let resolved = self.store.resolve_input_channel(channel_id)?;
        let subscriber = create_subscriber(&resolved)?;
        if let Err(err) = subscriber.initialize().await {
            warn!(channel = %channel_id, error = %err, "subscriber starting disconnected");
        }
        let cached = self
            .subscribers
            .entry(channel_id.to_owned())
            .or_insert_with(|| Arc::clone(&subscriber))
            .clone();
        if !Arc::ptr_eq(&cached, &subscriber) {
            subscriber.close().await;
        }
        debug!(channel = %channel_id, "subscriber ready");
        Ok(cached)
    }

    /// Close and drop every cached adapter.
    pub async fn shutdown(&self) {
        let publishers: Vec<_> = self
            .publishers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.publishers.clear();
        for publisher in publishers {
            publisher.close().await;
        }
        let subscribers: Vec<_> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.subscribers.clear();
        for subscriber in subscribers {
            subscriber.close().await;
        }
        debug!("channel accessor shut down");
    }
}

impl std::fmt::Debug for ChannelAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAccessor")
            .field("publishers", &self.publishers.len())
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_fs_channels() -> (tempfile::TempDir, Arc<ConfigStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in ["brokers", "input-channels", "output-channels"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        let base = root.join("spool");
        std::fs::write(
            root.join("brokers/fs.json"),
            format!(
                r#"{{"type": "filesystem", "connection": {{"base_dir": "{}"}}}}"#,
                base.display()
            ),
        )
        .unwrap();
        std::fs::write(
            root.join("output-channels/out.json"),
            r#"{"type": "filesystem", "broker": "fs",
                "destinations": [{"name": "responses", "type": "directory"}]}"#,
        )
        .unwrap();
        std::fs::write(
            root.join("input-channels/in.json"),
            r#"{"type": "filesystem", "broker": "fs",
                "destinations": [{"name": "requests", "type": "directory"}]}"#,
        )
        .unwrap();
        let store = Arc::new(ConfigStore::open(root).unwrap());
        (tmp, store)
    }

    #[tokio::test]
    async fn caches_publisher_per_channel_id() {
        let (_tmp, store) = store_with_fs_channels();
        let accessor = ChannelAccessor::new(store);

        let first = accessor.publisher("out").await.unwrap();
        let second = accessor.publisher("out").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_connected());
        accessor.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_channel_is_config_error() {
        let (_tmp, store) = store_with_fs_channels();
        let accessor = ChannelAccessor::new(store);
        let err = accessor.publisher("missing").await.unwrap_err();
        assert!(matches!(err, dgfacade_core::GatewayError::ConfigError(_)));
    }

    #[tokio::test]
    async fn subscriber_resolves_input_chain() {
        let (_tmp, store) = store_with_fs_channels();
        let accessor = ChannelAccessor::new(store);
        let subscriber = accessor.subscriber("in").await.unwrap();
        assert_eq!(
            subscriber.connection_state(),
            dgfacade_broker::ConnectionState::Connected
        );
        accessor.shutdown().await;
    }
}
