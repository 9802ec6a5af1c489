#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Configuration system for the DGFacade request gateway.
//!
//! Each registry owns one directory of JSON files under the config root:
//!
//! ```text
//! config/
//!   gateway.json          process-level settings
//!   users.json            user records
//!   apikeys.json          api key -> user mapping
//!   handlers/             per-user handler catalogues (+ default.json)
//!   brokers/              one broker definition per file
//!   input-channels/       one input channel per file
//!   output-channels/      one output channel per file
//!   ingesters/            one ingester per file
//!   chains/               one chain definition per file
//! ```
//!
//! Maps are immutable after load; a reload builds a fresh map and installs
//! it atomically. The auto-reload scheduler fingerprints each registered
//! directory and only invokes a registry's reload callback when the
//! fingerprint actually changed.

/// Broker definitions.
pub mod broker;
/// Chain definitions.
pub mod chain;
/// Input/output channel definitions.
pub mod channel;
/// User and API key stores.
pub mod credentials;
/// Configuration error types.
pub mod error;
/// Handler catalogues.
pub mod handler;
/// Ingester definitions.
pub mod ingester;
mod loader;
/// Directory fingerprinting and the reload scheduler.
pub mod reload;
/// The ingester -> channel -> broker resolution chain.
pub mod resolve;
/// Process-level gateway settings.
pub mod settings;
/// Aggregated registry store.
pub mod store;

pub use broker::{BrokerConfig, BrokerRegistry, SslConfig};
pub use chain::{ChainConfig, ChainRegistry};
pub use channel::{
    ChannelConfig, ChannelRegistry, Destination, DestinationKind, QueueSettings, RetrySettings,
};
pub use credentials::{ApiKeyRecord, CredentialStore, UserRecord};
pub use error::{ConfigError, ConfigResult};
pub use handler::{DEFAULT_TTL_MINUTES, HandlerConfig, HandlerRegistry};
pub use ingester::{IngesterConfig, IngesterRegistry};
pub use reload::{AutoReloadService, fingerprint_dir};
pub use resolve::{ResolvedChannel, deep_merge, normalize_channel_type};
pub use settings::GatewaySettings;
pub use store::ConfigStore;
