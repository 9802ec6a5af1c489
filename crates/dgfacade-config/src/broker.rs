//! Broker definitions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::loader::JsonDirRegistry;

fn default_true() -> bool {
    true
}

/// TLS block of a broker or channel definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SslConfig {
    /// Whether TLS is enabled for the connection.
    #[serde(default)]
    pub enabled: bool,
    /// Certificate material format; `pem` is the supported value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Path to the CA certificate bundle (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    /// Path to the client certificate chain (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    /// Path to the client private key (PEM: PKCS#8, PKCS#1 RSA, or SEC1 EC).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// Minimum protocol version; defaults to TLSv1.3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Native-client TLS properties passed through to the adapter.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SslConfig {
    /// Overlay a higher-precedence block onto this one, field by field.
    ///
    /// Same precedence semantics as the channel resolution chain: fields
    /// the overlay sets win, fields it leaves unset fall through. A block
    /// that enables TLS anywhere in the chain leaves it enabled.
    #[must_use]
    pub fn merged_with(&self, overlay: &SslConfig) -> SslConfig {
        let mut extra = serde_json::Value::Object(self.extra.clone());
        crate::resolve::deep_merge(&mut extra, &serde_json::Value::Object(overlay.extra.clone()));
        let extra = match extra {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        SslConfig {
            enabled: self.enabled || overlay.enabled,
            format: overlay.format.clone().or_else(|| self.format.clone()),
            ca_cert: overlay.ca_cert.clone().or_else(|| self.ca_cert.clone()),
            client_cert: overlay
                .client_cert
                .clone()
                .or_else(|| self.client_cert.clone()),
            client_key: overlay
                .client_key
                .clone()
                .or_else(|| self.client_key.clone()),
            protocol: overlay.protocol.clone().or_else(|| self.protocol.clone()),
            extra,
        }
    }
}

/// One broker definition (`config/brokers/<id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker protocol (`kafka`, `confluent_kafka`, `activemq`, `rabbitmq`,
    /// `ibmmq`, `filesystem`, `sql`).
    #[serde(rename = "type")]
    pub broker_type: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disabled brokers do not resolve.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Connection details (hosts, ports, credentials paths).
    #[serde(default)]
    pub connection: serde_json::Map<String, serde_json::Value>,
    /// TLS settings.
    #[serde(default)]
    pub ssl: SslConfig,
    /// Native-client properties.
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Structured authentication block.
    #[serde(default)]
    pub authentication: serde_json::Map<String, serde_json::Value>,
    /// Structured schema-registry block (Confluent).
    #[serde(default)]
    pub schema_registry: serde_json::Map<String, serde_json::Value>,
}

/// Registry over `config/brokers/`.
#[derive(Debug)]
pub struct BrokerRegistry {
    inner: JsonDirRegistry<BrokerConfig>,
}

impl BrokerRegistry {
    /// Load the broker directory.
    pub fn open(dir: impl AsRef<Path>) -> ConfigResult<Self> {
        Ok(Self {
            inner: JsonDirRegistry::open(dir.as_ref())?,
        })
    }

    /// Look up a broker by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<BrokerConfig> {
        self.inner.get(id)
    }

    /// Snapshot of all brokers.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, BrokerConfig>> {
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
    fn parses_full_broker_entry() {
        let json = r#"{
            "type": "kafka",
            "description": "main cluster",
            "connection": {"bootstrap.servers": "k1:9092,k2:9092"},
            "ssl": {"enabled": true, "format": "pem", "ca_cert": "/etc/ssl/ca.pem"},
            "properties": {"linger.ms": 5},
            "authentication": {"mechanism": "PLAIN"},
            "schema_registry": {"url": "https://sr:8081"}
        }"#;
        let broker: BrokerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(broker.broker_type, "kafka");
        assert!(broker.enabled);
        assert!(broker.ssl.enabled);
        assert_eq!(broker.ssl.ca_cert.as_deref(), Some("/etc/ssl/ca.pem"));
        assert_eq!(broker.properties["linger.ms"], 5);
    }

    #[test]
    fn missing_directory_is_empty() {
        let registry = BrokerRegistry::open("/nonexistent/brokers").unwrap();
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn serialize_write_read_is_lossless() {
        let original: BrokerConfig = serde_json::from_str(
            r#"{
                "type": "activemq",
                "enabled": true,
                "connection": {"host": "amq1", "port": 61613},
                "ssl": {"enabled": true, "format": "pem", "ca_cert": "/etc/ssl/ca.pem"},
                "properties": {"reconnect_interval_seconds": 5}
            }"#,
        )
        .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("amq-east.json"),
            serde_json::to_string_pretty(&original).unwrap(),
        )
        .unwrap();

        let registry = BrokerRegistry::open(tmp.path()).unwrap();
        let read_back = registry.get("amq-east").unwrap();
        assert_eq!(read_back.broker_type, original.broker_type);
        assert_eq!(read_back.connection, original.connection);
        assert_eq!(read_back.ssl, original.ssl);
        assert_eq!(read_back.properties, original.properties);
    }
}
