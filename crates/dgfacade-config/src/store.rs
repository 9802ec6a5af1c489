//! Aggregated registry store rooted at one config directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use crate::broker::BrokerRegistry;
use crate::chain::ChainRegistry;
use crate::channel::ChannelRegistry;
use crate::credentials::CredentialStore;
use crate::error::{ConfigError, ConfigResult};
use crate::handler::HandlerRegistry;
use crate::ingester::IngesterRegistry;
use crate::reload::AutoReloadService;
use crate::resolve::{ResolvedChannel, apply_ingester_overrides, resolve_channel};
use crate::settings::GatewaySettings;

/// Every registry under one `config/` root.
#[derive(Debug)]
pub struct ConfigStore {
    root: PathBuf,
    settings: GatewaySettings,
    handlers: HandlerRegistry,
    brokers: BrokerRegistry,
    input_channels: ChannelRegistry,
    output_channels: ChannelRegistry,
    ingesters: IngesterRegistry,
    chains: ChainRegistry,
    credentials: CredentialStore,
}

impl ConfigStore {
    /// Open every registry under `root`.
    ///
    /// Missing directories load as empty registries; a malformed file in a
    /// present directory is a hard error so startup fails loudly.
    pub fn open(root: impl Into<PathBuf>) -> ConfigResult<Self> {
        let root = root.into();
        let settings = GatewaySettings::load(&root.join("gateway.json"))?;
        let store = Self {
            handlers: HandlerRegistry::open(root.join("handlers"))?,
            brokers: BrokerRegistry::open(root.join("brokers"))?,
            input_channels: ChannelRegistry::open(root.join("input-channels"))?,
            output_channels: ChannelRegistry::open(root.join("output-channels"))?,
            ingesters: IngesterRegistry::open(root.join("ingesters"))?,
            chains: ChainRegistry::open(root.join("chains"))?,
            credentials: CredentialStore::open(root.join("users.json"), root.join("apikeys.json"))?,
            settings,
            root,
        };
        info!(root = %store.root.display(), "configuration loaded");
        Ok(store)
    }

    /// The config root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Process-level settings.
    #[must_use]
    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Handler catalogues.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Broker definitions.
    #[must_use]
    pub fn brokers(&self) -> &BrokerRegistry {
        &self.brokers
    }

    /// Input channel definitions.
    #[must_use]
    pub fn input_channels(&self) -> &ChannelRegistry {
        &self.input_channels
    }

    /// Output channel definitions.
    #[must_use]
    pub fn output_channels(&self) -> &ChannelRegistry {
        &self.output_channels
    }

    /// Ingester definitions.
    #[must_use]
    pub fn ingesters(&self) -> &IngesterRegistry {
        &self.ingesters
    }

    /// Chain definitions.
    #[must_use]
    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    /// Credential stores.
    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    fn resolve_from(
        &self,
        registry: &ChannelRegistry,
        channel_id: &str,
    ) -> ConfigResult<ResolvedChannel> {
        let channel = registry
            .get(channel_id)
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "channel",
                id: channel_id.to_owned(),
            })?;
        let broker = self
            .brokers
            .get(&channel.broker)
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "broker",
                id: channel.broker.clone(),
            })?;
        resolve_channel(channel_id, &channel, &broker)
    }

    /// Resolve an input channel through its broker.
    pub fn resolve_input_channel(&self, channel_id: &str) -> ConfigResult<ResolvedChannel> {
        self.resolve_from(&self.input_channels, channel_id)
    }

    /// Resolve an output channel through its broker.
    pub fn resolve_output_channel(&self, channel_id: &str) -> ConfigResult<ResolvedChannel> {
        self.resolve_from(&self.output_channels, channel_id)
    }

    /// Resolve an ingester through its channel and broker, applying the
    /// ingester's own overrides last.
    pub fn resolve_ingester(
        &self,
        ingester_id: &str,
    ) -> ConfigResult<(crate::ingester::IngesterConfig, ResolvedChannel)> {
        let ingester =
            self.ingesters
                .get(ingester_id)
                .ok_or_else(|| ConfigError::MissingReference {
                    kind: "ingester",
                    id: ingester_id.to_owned(),
                })?;
        let resolved = self.resolve_input_channel(&ingester.input_channel)?;
        let resolved = apply_ingester_overrides(resolved, &ingester);
        Ok((ingester, resolved))
    }

    /// Register every registry directory with the auto-reload service.
    pub fn register_auto_reload(self: &Arc<Self>, service: &AutoReloadService) {
        let registrations: [(&str, PathBuf, Box<dyn Fn(&Self) -> ConfigResult<usize> + Send + Sync>); 6] = [
            (
                "handlers",
                self.handlers.dir().to_path_buf(),
                Box::new(|store| store.handlers.reload()),
            ),
            (
                "brokers",
                self.brokers.dir().to_path_buf(),
                Box::new(|store| store.brokers.reload()),
            ),
            (
                "input-channels",
                self.input_channels.dir().to_path_buf(),
                Box::new(|store| store.input_channels.reload()),
            ),
            (
                "output-channels",
                self.output_channels.dir().to_path_buf(),
                Box::new(|store| store.output_channels.reload()),
            ),
            (
                "ingesters",
                self.ingesters.dir().to_path_buf(),
                Box::new(|store| store.ingesters.reload()),
            ),
            (
                "chains",
                self.chains.dir().to_path_buf(),
                Box::new(|store| store.chains.reload()),
            ),
        ];
        for (name, dir, reload) in registrations {
            let store = Arc::clone(self);
            service.register(
                name,
                dir,
                Arc::new(move || match reload(&store) {
                    Ok(count) => info!(registry = name, count, "registry reloaded"),
                    Err(err) => error!(registry = name, error = %err, "reload failed, previous config kept"),
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_config_root() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in [
            "handlers",
            "brokers",
            "input-channels",
            "output-channels",
            "ingesters",
            "chains",
        ] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        std::fs::write(
            root.join("brokers/fs-local.json"),
            r#"{"type": "filesystem", "connection": {"base_dir": "/var/dgf"}}"#,
        )
        .unwrap();
        std::fs::write(
            root.join("input-channels/files-in.json"),
            r#"{"type": "filesystem", "broker": "fs-local",
                "destinations": [{"name": "inbox", "type": "directory"}]}"#,
        )
        .unwrap();
        std::fs::write(
            root.join("ingesters/file-intake.json"),
            r#"{"input_channel": "files-in", "overrides": {"poll_interval_seconds": 1}}"#,
        )
        .unwrap();
        tmp
    }

    #[test]
    fn resolves_ingester_chain_end_to_end() {
        let tmp = seed_config_root();
        let store = ConfigStore::open(tmp.path()).unwrap();

        let (ingester, resolved) = store.resolve_ingester("file-intake").unwrap();
        assert_eq!(ingester.input_channel, "files-in");
        assert_eq!(resolved.channel_type, "filesystem");
        assert_eq!(resolved.broker_id, "fs-local");
        assert_eq!(resolved.properties["base_dir"], "/var/dgf");
        assert_eq!(resolved.properties["poll_interval_seconds"], 1);
        assert_eq!(resolved.primary_destination().unwrap().name, "inbox");
    }

    #[test]
    fn missing_references_fail() {
        let tmp = seed_config_root();
        let store = ConfigStore::open(tmp.path()).unwrap();

        assert!(matches!(
            store.resolve_input_channel("nope"),
            Err(ConfigError::MissingReference { kind: "channel", .. })
        ));
        assert!(matches!(
            store.resolve_ingester("nope"),
            Err(ConfigError::MissingReference { kind: "ingester", .. })
        ));
    }

    #[test]
    fn auto_reload_registers_all_directories() {
        let tmp = seed_config_root();
        let store = Arc::new(ConfigStore::open(tmp.path()).unwrap());
        let service = AutoReloadService::new(std::time::Duration::from_secs(300));
        store.register_auto_reload(&service);

        // A new broker file fires exactly the brokers registry.
        std::fs::write(
            tmp.path().join("brokers/k-main.json"),
            r#"{"type": "kafka"}"#,
        )
        .unwrap();
        assert_eq!(service.check_once(), vec!["brokers".to_owned()]);
        assert!(store.brokers().get("k-main").is_some());
    }
}
