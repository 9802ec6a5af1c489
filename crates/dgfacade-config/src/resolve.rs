//! The ingester -> input channel -> broker resolution chain.
//!
//! The resolved configuration is a single property map merged in priority
//! order: broker connection + broker properties (lowest), then channel-level
//! overrides, then ingester-level overrides (highest). Objects merge per
//! key; scalars and arrays from the higher layer replace.

use serde_json::{Map, Value};

use crate::broker::{BrokerConfig, SslConfig};
use crate::channel::{ChannelConfig, Destination, QueueSettings, RetrySettings};
use crate::error::{ConfigError, ConfigResult};
use crate::ingester::IngesterConfig;

/// Recursively deep-merge `overlay` into `base`.
///
/// - Objects merge recursively per-field.
/// - Scalars and arrays from the overlay **replace** the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_map.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Normalize a channel type for adapter selection (`jms` is `activemq`).
#[must_use]
pub fn normalize_channel_type(channel_type: &str) -> String {
    let lowered = channel_type.to_ascii_lowercase();
    if lowered == "jms" {
        "activemq".to_owned()
    } else {
        lowered
    }
}

/// A channel with its broker chain fully resolved and merged.
#[derive(Debug, Clone)]
pub struct ResolvedChannel {
    /// The channel id.
    pub channel_id: String,
    /// Normalized channel type.
    pub channel_type: String,
    /// The broker id the channel rides on.
    pub broker_id: String,
    /// The broker protocol.
    pub broker_type: String,
    /// Destinations on the broker.
    pub destinations: Vec<Destination>,
    /// Merged connection + native-client properties.
    pub properties: Map<String, Value>,
    /// Effective TLS settings: broker SSL merged per field with the
    /// channel's override block.
    pub ssl: SslConfig,
    /// Structured authentication block from the broker.
    pub authentication: Map<String, Value>,
    /// Structured schema-registry block from the broker.
    pub schema_registry: Map<String, Value>,
    /// Subscriber queue sizing from the channel.
    pub queue: QueueSettings,
    /// Retry policy from the channel.
    pub retry: RetrySettings,
}

impl ResolvedChannel {
    /// A merged property as a string.
    #[must_use]
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// A merged property as an unsigned integer, with a default.
    #[must_use]
    pub fn property_u64(&self, key: &str, default: u64) -> u64 {
        self.properties
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    /// The first configured destination name, if any.
    #[must_use]
    pub fn primary_destination(&self) -> Option<&Destination> {
        self.destinations.first()
    }
}

/// Merge a channel onto its broker.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] when the broker is disabled.
pub fn resolve_channel(
    channel_id: &str,
    channel: &ChannelConfig,
    broker: &BrokerConfig,
) -> ConfigResult<ResolvedChannel> {
    if !broker.enabled {
        return Err(ConfigError::Invalid(format!(
            "broker {} referenced by channel {channel_id} is disabled",
            channel.broker
        )));
    }

    let mut properties = Value::Object(Map::new());
    deep_merge(&mut properties, &Value::Object(broker.connection.clone()));
    deep_merge(&mut properties, &Value::Object(broker.properties.clone()));
    deep_merge(&mut properties, &Value::Object(channel.overrides.clone()));

    let Value::Object(properties) = properties else {
        // deep_merge of objects always yields an object
        return Err(ConfigError::Invalid(
            "merged channel properties are not an object".to_owned(),
        ));
    };

    Ok(ResolvedChannel {
        channel_id: channel_id.to_owned(),
        channel_type: normalize_channel_type(&channel.channel_type),
        broker_id: channel.broker.clone(),
        broker_type: normalize_channel_type(&broker.broker_type),
        destinations: channel.destinations.clone(),
        properties,
        ssl: match &channel.ssl {
            Some(channel_ssl) => broker.ssl.merged_with(channel_ssl),
            None => broker.ssl.clone(),
        },
        authentication: broker.authentication.clone(),
        schema_registry: broker.schema_registry.clone(),
        queue: channel.queue.clone(),
        retry: channel.retry.clone(),
    })
}

/// Apply an ingester's overrides on top of its resolved channel.
#[must_use]
pub fn apply_ingester_overrides(
    mut resolved: ResolvedChannel,
    ingester: &IngesterConfig,
) -> ResolvedChannel {
    let mut properties = Value::Object(std::mem::take(&mut resolved.properties));
    deep_merge(&mut properties, &Value::Object(ingester.overrides.clone()));
    if let Value::Object(map) = properties {
        resolved.properties = map;
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker() -> BrokerConfig {
        serde_json::from_value(json!({
            "type": "kafka",
            "connection": {"bootstrap.servers": "k1:9092", "client.id": "dgf"},
            "properties": {"linger.ms": 5, "batch": {"size": 100}}
        }))
        .unwrap()
    }

    fn channel() -> ChannelConfig {
        serde_json::from_value(json!({
            "type": "kafka",
            "broker": "main",
            "destinations": [{"name": "requests", "type": "topic"}],
            "linger.ms": 10
        }))
        .unwrap()
    }

    #[test]
    fn precedence_broker_then_channel_then_ingester() {
        let resolved = resolve_channel("in-1", &channel(), &broker()).unwrap();
        // channel override wins over broker property
        assert_eq!(resolved.properties["linger.ms"], 10);
        // broker-only values survive
        assert_eq!(resolved.properties["bootstrap.servers"], "k1:9092");

        let ingester: IngesterConfig = serde_json::from_value(json!({
            "input_channel": "in-1",
            "overrides": {"linger.ms": 20, "batch": {"count": 7}}
        }))
        .unwrap();
        let resolved = apply_ingester_overrides(resolved, &ingester);
        assert_eq!(resolved.properties["linger.ms"], 20);
        // nested objects merge instead of replacing
        assert_eq!(resolved.properties["batch"]["size"], 100);
        assert_eq!(resolved.properties["batch"]["count"], 7);
    }

    #[test]
    fn jms_normalizes_to_activemq() {
        assert_eq!(normalize_channel_type("jms"), "activemq");
        assert_eq!(normalize_channel_type("JMS"), "activemq");
        assert_eq!(normalize_channel_type("Kafka"), "kafka");
    }

    #[test]
    fn disabled_broker_fails_resolution() {
        let mut disabled = broker();
        disabled.enabled = false;
        let err = resolve_channel("in-1", &channel(), &disabled).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn channel_ssl_wins_over_broker_ssl() {
        let mut with_ssl = broker();
        with_ssl.ssl.enabled = true;
        with_ssl.ssl.ca_cert = Some("/broker/ca.pem".to_owned());

        let mut ch = channel();
        ch.ssl = Some(SslConfig {
            enabled: true,
            ca_cert: Some("/channel/ca.pem".to_owned()),
            ..SslConfig::default()
        });

        let resolved = resolve_channel("in-1", &ch, &with_ssl).unwrap();
        assert_eq!(resolved.ssl.ca_cert.as_deref(), Some("/channel/ca.pem"));
    }

    #[test]
    fn channel_ssl_merges_per_field_with_broker_ssl() {
        // Broker carries the shared CA and protocol; the channel only adds
        // its client pair for mutual TLS.
        let mut with_ssl = broker();
        with_ssl.ssl.enabled = true;
        with_ssl.ssl.ca_cert = Some("/broker/ca.pem".to_owned());
        with_ssl.ssl.protocol = Some("TLSv1.2".to_owned());
        with_ssl
            .ssl
            .extra
            .insert("verify_hostname".to_owned(), json!(true));

        let mut ch = channel();
        ch.ssl = Some(SslConfig {
            client_cert: Some("/channel/client.pem".to_owned()),
            client_key: Some("/channel/client.key".to_owned()),
            ..SslConfig::default()
        });

        let resolved = resolve_channel("in-1", &ch, &with_ssl).unwrap();
        // Broker-level fields survive the overlay.
        assert!(resolved.ssl.enabled);
        assert_eq!(resolved.ssl.ca_cert.as_deref(), Some("/broker/ca.pem"));
        assert_eq!(resolved.ssl.protocol.as_deref(), Some("TLSv1.2"));
        assert_eq!(resolved.ssl.extra["verify_hostname"], json!(true));
        // Channel-level additions land.
        assert_eq!(
            resolved.ssl.client_cert.as_deref(),
            Some("/channel/client.pem")
        );
        assert_eq!(
            resolved.ssl.client_key.as_deref(),
            Some("/channel/client.key")
        );
    }

    #[test]
    fn scalars_replace_arrays_replace() {
        let mut base = json!({"a": [1, 2], "b": {"c": 1}});
        let overlay = json!({"a": [3], "b": {"d": 2}});
        deep_merge(&mut base, &overlay);
        assert_eq!(base["a"], json!([3]));
        assert_eq!(base["b"], json!({"c": 1, "d": 2}));
    }
}
