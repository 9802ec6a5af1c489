//! Cluster membership types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// What work a cluster node accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    /// Accepts inbound requests but never executes handlers.
    Gateway,
    /// Executes handlers but exposes no ingress.
    Executor,
    /// Both ingress and execution.
    Both,
}

impl NodeRole {
    /// Whether this role executes handlers.
    #[must_use]
    pub fn executes(self) -> bool {
        matches!(self, Self::Executor | Self::Both)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gateway => "GATEWAY",
            Self::Executor => "EXECUTOR",
            Self::Both => "BOTH",
        };
        write!(f, "{name}")
    }
}

/// Liveness classification of a peer, derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Heartbeats arriving on schedule.
    Up,
    /// Heartbeats late beyond twice the interval.
    Suspect,
    /// Heartbeats late beyond five times the interval.
    Down,
    /// The node announced a graceful departure.
    Leaving,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Up => "UP",
            Self::Suspect => "SUSPECT",
            Self::Down => "DOWN",
            Self::Leaving => "LEAVING",
        };
        write!(f, "{name}")
    }
}

/// A cluster member as exchanged over the heartbeat protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Node identity.
    pub node_id: NodeId,
    /// Reachable host.
    pub host: String,
    /// Reachable port.
    pub port: u16,
    /// Software version.
    pub version: String,
    /// What work the node accepts.
    pub role: NodeRole,
    /// Liveness classification.
    pub status: NodeStatus,
    /// When the node was last heard from.
    pub last_heartbeat: DateTime<Utc>,
    /// Handler executions currently in flight on the node.
    #[serde(default)]
    pub active_handlers: u64,
    /// Total requests the node has accepted.
    #[serde(default)]
    pub total_requests: u64,
}

impl NodeState {
    /// Create a fresh `UP` node state.
    #[must_use]
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16, role: NodeRole) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            role,
            status: NodeStatus::Up,
            last_heartbeat: Utc::now(),
            active_handlers: 0,
            total_requests: 0,
        }
    }

    /// The node's base URL for cluster HTTP calls.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_that_execute() {
        assert!(NodeRole::Executor.executes());
        assert!(NodeRole::Both.executes());
        assert!(!NodeRole::Gateway.executes());
    }

    #[test]
    fn node_state_roundtrip() {
        let state = NodeState::new("node-a".into(), "10.0.0.1", 9200, NodeRole::Both);
        let json = serde_json::to_string(&state).unwrap();
        let back: NodeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_id, state.node_id);
        assert_eq!(back.role, NodeRole::Both);
        assert_eq!(back.status, NodeStatus::Up);
    }
}
