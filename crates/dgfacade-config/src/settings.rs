//! Process-level gateway settings (`config/gateway.json`).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use dgfacade_core::{NodeRole, ResponseChannel};
use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::loader::read_json_file;

fn default_node_id() -> String {
    // Node ids are operator-set in real deployments; this default only
    // covers ad-hoc runs.
    format!("node-{}", std::process::id())
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}
fn default_port() -> u16 {
    9200
}
fn default_role() -> NodeRole {
    NodeRole::Both
}

/// Identity of this process in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node id; generated for ad-hoc runs.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Reachable host for peers.
    #[serde(default = "default_host")]
    pub host: String,
    /// Reachable port for peers.
    #[serde(default = "default_port")]
    pub port: u16,
    /// What work this node accepts.
    #[serde(default = "default_role")]
    pub role: NodeRole,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            host: default_host(),
            port: default_port(),
            role: default_role(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    10
}

/// Cluster membership settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Seed peer base URLs; empty means standalone.
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Heartbeat cadence in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
        }
    }
}

impl ClusterSettings {
    /// Whether clustering is active.
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        !self.seeds.is_empty()
    }
}

fn default_reload_interval() -> u64 {
    300
}
fn default_ring_capacity() -> usize {
    1_000
}
fn default_grace_seconds() -> u64 {
    5
}

/// Execution engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Capacity of the recent handler-states ring.
    #[serde(default = "default_ring_capacity")]
    pub recent_states_capacity: usize,
    /// Grace period after stop/TTL before an execution is torn down.
    #[serde(default = "default_grace_seconds")]
    pub grace_period_seconds: u64,
    /// Load-shedding threshold; requests past it are forwarded when
    /// clustering is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_handlers: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recent_states_capacity: default_ring_capacity(),
            grace_period_seconds: default_grace_seconds(),
            max_active_handlers: None,
        }
    }
}

fn default_stream_prefix() -> String {
    "stream".to_owned()
}
fn default_rest_buffer() -> usize {
    256
}
fn default_channel_queue() -> usize {
    256
}

/// Streaming fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSettings {
    /// WebSocket destination prefix: `/<prefix>/<session_id>`.
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    /// Per-session REST pull buffer capacity.
    #[serde(default = "default_rest_buffer")]
    pub rest_buffer_capacity: usize,
    /// Per-channel delivery queue capacity inside a session.
    #[serde(default = "default_channel_queue")]
    pub channel_queue_capacity: usize,
    /// Output channel id used for each broker response channel.
    #[serde(default)]
    pub output_channels: HashMap<ResponseChannel, String>,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            stream_prefix: default_stream_prefix(),
            rest_buffer_capacity: default_rest_buffer(),
            channel_queue_capacity: default_channel_queue(),
            output_channels: HashMap::new(),
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Request types that bypass authentication.
    #[serde(default)]
    pub public_request_types: BTreeSet<String>,
}

/// The process-level settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Node identity.
    #[serde(default)]
    pub node: NodeSettings,
    /// Cluster membership.
    #[serde(default)]
    pub cluster: ClusterSettings,
    /// Config auto-reload interval in seconds.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_seconds: u64,
    /// Execution engine tuning.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Streaming fan-out settings.
    #[serde(default)]
    pub streaming: StreamingSettings,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            cluster: ClusterSettings::default(),
            reload_interval_seconds: default_reload_interval(),
            engine: EngineSettings::default(),
            streaming: StreamingSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

impl GatewaySettings {
    /// Load from `gateway.json`; a missing file yields defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if path.is_file() {
            read_json_file(path)
        } else {
            Ok(Self::default())
        }
    }
}
