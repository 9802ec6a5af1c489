//! Cluster membership: heartbeats, peer liveness, and request forwarding.
//!
//! Standalone (no configured seeds) the service is a no-op. Clustered, a
//! single heartbeat task POSTs this node's state to every known peer on a
//! fixed cadence and merges whatever state comes back. Peer liveness is
//! derived from heartbeat age; dead and departed peers are evicted. The
//! peer table has one writer (the heartbeat task) and any number of
//! concurrent readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dgfacade_config::GatewaySettings;
use dgfacade_core::{
    GatewayError, GatewayResult, NodeId, NodeState, NodeStatus, Request, Response,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wire shape of a forwarded request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    /// The request to execute remotely.
    pub request: Request,
    /// The forwarding node.
    pub origin_node_id: NodeId,
}

/// Point-in-time forwarding counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClusterStatsSnapshot {
    /// Requests this node forwarded to peers.
    pub forwarded: u64,
    /// Forwarded requests this node executed for peers.
    pub received: u64,
}

/// Cluster membership and forwarding.
pub struct ClusterService {
    local: RwLock<NodeState>,
    peers: RwLock<HashMap<NodeId, NodeState>>,
    seeds: Vec<String>,
    interval: Duration,
    http: reqwest::Client,
    round_robin: AtomicUsize,
    forwarded: AtomicU64,
    received: AtomicU64,
    shutdown: CancellationToken,
}

impl ClusterService {
    /// Build the service from gateway settings.
    #[must_use]
    pub fn new(settings: &GatewaySettings) -> Arc<Self> {
        let node = &settings.node;
        let local = NodeState::new(
            NodeId::new(node.node_id.clone()),
            node.host.clone(),
            node.port,
            node.role,
        );
        Arc::new(Self {
            local: RwLock::new(local),
            peers: RwLock::new(HashMap::new()),
            seeds: settings.cluster.seeds.clone(),
            interval: Duration::from_secs(settings.cluster.heartbeat_interval_seconds.max(1)),
            http: reqwest::Client::new(),
            round_robin: AtomicUsize::new(0),
            forwarded: AtomicU64::new(0),
            received: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Whether clustering is active (any seeds configured).
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        !self.seeds.is_empty()
    }

    /// Snapshot of this node's state.
    #[must_use]
    pub fn local(&self) -> NodeState {
        self.local
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the whole membership, local node first.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeState> {
        let mut nodes = vec![self.local()];
        let peers = self
            .peers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        nodes.extend(peers.values().cloned());
        nodes
    }

    /// Apply a peer's heartbeat and answer with this node's state.
    ///
    /// This is the body of the cluster `POST /cluster/heartbeat` endpoint;
    /// the HTTP layer mounting it lives outside the core.
    pub fn handle_heartbeat(&self, mut remote: NodeState) -> NodeState {
        remote.last_heartbeat = Utc::now();
        if remote.status != NodeStatus::Leaving {
            remote.status = NodeStatus::Up;
        }
        debug!(peer = %remote.node_id, "heartbeat received");
        let mut peers = self
            .peers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        peers.insert(remote.node_id.clone(), remote);
        drop(peers);
        self.local()
    }

    /// Note a forwarded request executed on behalf of a peer.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Update this node's load figures, carried in outgoing heartbeats.
    pub fn update_load(&self, active_handlers: u64, total_requests: u64) {
        let mut local = self
            .local
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        local.active_handlers = active_handlers;
        local.total_requests = total_requests;
    }

    /// Announce a graceful departure; peers evict after their timeout.
    pub fn mark_leaving(&self) {
        let mut local = self
            .local
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        local.status = NodeStatus::Leaving;
    }

    /// Forwarding counters.
    #[must_use]
    pub fn stats(&self) -> ClusterStatsSnapshot {
        ClusterStatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    /// Pick the next `UP` executor peer, round-robin.
    #[must_use]
    pub fn pick_executor(&self) -> Option<NodeState> {
        let peers = self
            .peers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut executors: Vec<&NodeState> = peers
            .values()
            .filter(|peer| peer.role.executes() && peer.status == NodeStatus::Up)
            .collect();
        if executors.is_empty() {
            return None;
        }
        executors.sort_by(|a, b| a.node_id.as_str().cmp(b.node_id.as_str()));
        let index = self
            .round_robin
            .fetch_add(1, Ordering::Relaxed)
            .checked_rem(executors.len())
            .unwrap_or(0);
        executors.get(index).map(|peer| (*peer).clone())
    }

    /// Forward a request to a peer's forward endpoint.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ClusterForwardFailed`]; callers fall back to local
    /// execution.
    pub async fn forward(&self, request: &Request, peer: &NodeState) -> GatewayResult<Response> {
        let envelope = ForwardEnvelope {
            request: request.clone(),
            origin_node_id: self.local().node_id,
        };
        let url = format!("{}/cluster/forward", peer.base_url());
        let reply = self
            .http
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|err| GatewayError::ClusterForwardFailed(err.to_string()))?;
        if !reply.status().is_success() {
            return Err(GatewayError::ClusterForwardFailed(format!(
                "{url} answered {}",
                reply.status()
            )));
        }
        let response: Response = reply
            .json()
            .await
            .map_err(|err| GatewayError::ClusterForwardFailed(err.to_string()))?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer.node_id, request_id = %response.request_id, "request forwarded");
        Ok(response)
    }

    /// Reclassify peers by heartbeat age and evict the departed.
    fn refresh_statuses(&self, now: DateTime<Utc>) {
        let interval =
            chrono::Duration::from_std(self.interval).unwrap_or_else(|_| chrono::Duration::seconds(10));
        let suspect_after = interval.checked_mul(2).unwrap_or(interval);
        let down_after = interval.checked_mul(5).unwrap_or(interval);

        let mut peers = self
            .peers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        peers.retain(|node_id, peer| {
            let silence = now.signed_duration_since(peer.last_heartbeat);
            match peer.status {
                NodeStatus::Leaving => {
                    let keep = silence <= chrono::Duration::seconds(60);
                    if !keep {
                        info!(peer = %node_id, "departed peer evicted");
                    }
                    keep
                },
                _ => {
                    if silence > down_after {
                        if peer.status != NodeStatus::Down {
                            warn!(peer = %node_id, "peer marked DOWN");
                        }
                        peer.status = NodeStatus::Down;
                        // DOWN for over ten minutes is gone for good.
                        let keep = silence <= down_after
                            .checked_add(&chrono::Duration::minutes(10))
                            .unwrap_or(down_after);
                        if !keep {
                            info!(peer = %node_id, "dead peer evicted");
                        }
                        keep
                    } else {
                        peer.status = if silence > suspect_after {
                            NodeStatus::Suspect
                        } else {
                            NodeStatus::Up
                        };
                        true
                    }
                },
            }
        });
    }

    /// Spawn the heartbeat loop. A no-op without seeds.
    pub fn start(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if !self.is_clustered() {
            debug!("standalone node, cluster service idle");
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = this.shutdown.cancelled() => return,
                    _ = ticker.tick() => this.beat_once().await,
                }
            }
        }))
    }

    /// One heartbeat round: reclassify, then exchange state with every
    /// seed and discovered peer.
    pub async fn beat_once(&self) {
        self.refresh_statuses(Utc::now());
        let mut local = self.local();
        local.last_heartbeat = Utc::now();

        let mut targets: Vec<String> = self.seeds.clone();
        {
            let peers = self
                .peers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for peer in peers.values() {
                let url = peer.base_url();
                if !targets.contains(&url) {
                    targets.push(url);
                }
            }
        }
        let own_url = local.base_url();
        for target in targets {
            if target == own_url {
                continue;
            }
            let url = format!("{target}/cluster/heartbeat");
            match self.http.post(&url).json(&local).send().await {
                Ok(reply) if reply.status().is_success() => {
                    match reply.json::<NodeState>().await {
                        Ok(peer_state) => {
                            let _ = self.handle_heartbeat(peer_state);
                        },
                        Err(err) => warn!(target = %target, error = %err, "bad heartbeat reply"),
                    }
                },
                Ok(reply) => {
                    debug!(target = %target, status = %reply.status(), "heartbeat rejected");
                },
                Err(err) => {
                    debug!(target = %target, error = %err, "heartbeat failed");
                },
            }
        }
    }

    /// Stop the heartbeat loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ClusterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterService")
            .field("clustered", &self.is_clustered())
            .field("local", &self.local().node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgfacade_core::NodeRole;

    fn settings(seeds: &[&str], interval: u64) -> GatewaySettings {
        serde_json::from_value(serde_json::json!({
            "node": {"node_id": "gw-1", "host": "127.0.0.1", "port": 9200, "role": "GATEWAY"},
            "cluster": {
                "seeds": seeds,
                "heartbeat_interval_seconds": interval
            }
        }))
        .unwrap()
    }

    fn peer(id: &str, role: NodeRole, seconds_silent: i64) -> NodeState {
        let mut state = NodeState::new(id.into(), "10.0.0.9", 9200, role);
        state.last_heartbeat = Utc::now() - chrono::Duration::seconds(seconds_silent);
        state
    }

    #[test]
    fn standalone_is_noop() {
        let cluster = ClusterService::new(&settings(&[], 10));
        assert!(!cluster.is_clustered());
        assert!(cluster.pick_executor().is_none());
        assert_eq!(cluster.nodes().len(), 1);
    }

    #[test]
    fn heartbeat_merges_and_returns_local() {
        let cluster = ClusterService::new(&settings(&["http://10.0.0.2:9200"], 10));
        let reply = cluster.handle_heartbeat(peer("ex-1", NodeRole::Executor, 0));
        assert_eq!(reply.node_id.as_str(), "gw-1");
        assert_eq!(cluster.nodes().len(), 2);
    }

    #[test]
    fn status_follows_heartbeat_age() {
        let cluster = ClusterService::new(&settings(&["http://seed:9200"], 10));
        let _ = cluster.handle_heartbeat(peer("fresh", NodeRole::Both, 0));
        let _ = cluster.handle_heartbeat(peer("late", NodeRole::Both, 0));
        let _ = cluster.handle_heartbeat(peer("gone", NodeRole::Both, 0));
        {
            // Age the peers directly; handle_heartbeat stamps "now".
            let mut peers = cluster.peers.write().unwrap();
            peers.get_mut(&"late".into()).unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(25);
            peers.get_mut(&"gone".into()).unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(70);
        }

        cluster.refresh_statuses(Utc::now());
        let by_id: HashMap<String, NodeStatus> = cluster
            .nodes()
            .into_iter()
            .map(|node| (node.node_id.as_str().to_owned(), node.status))
            .collect();
        assert_eq!(by_id["fresh"], NodeStatus::Up);
        assert_eq!(by_id["late"], NodeStatus::Suspect);
        assert_eq!(by_id["gone"], NodeStatus::Down);
    }

    #[test]
    fn long_dead_and_departed_peers_evict() {
        let cluster = ClusterService::new(&settings(&["http://seed:9200"], 10));
        let _ = cluster.handle_heartbeat(peer("dead", NodeRole::Both, 0));
        let mut leaving = peer("leaving", NodeRole::Both, 0);
        leaving.status = NodeStatus::Leaving;
        let _ = cluster.handle_heartbeat(leaving);
        {
            let mut peers = cluster.peers.write().unwrap();
            // DOWN threshold (50 s) plus the ten-minute corpse timer.
            peers.get_mut(&"dead".into()).unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(651);
            peers.get_mut(&"leaving".into()).unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::seconds(61);
        }

        cluster.refresh_statuses(Utc::now());
        assert_eq!(cluster.nodes().len(), 1);
    }

    #[test]
    fn round_robin_skips_non_executors() {
        let cluster = ClusterService::new(&settings(&["http://seed:9200"], 10));
        let _ = cluster.handle_heartbeat(peer("ex-a", NodeRole::Executor, 0));
        let _ = cluster.handle_heartbeat(peer("ex-b", NodeRole::Both, 0));
        let _ = cluster.handle_heartbeat(peer("gw-2", NodeRole::Gateway, 0));

        let picks: Vec<String> = (0..4)
            .map(|_| cluster.pick_executor().unwrap().node_id.as_str().to_owned())
            .collect();
        assert_eq!(picks, vec!["ex-a", "ex-b", "ex-a", "ex-b"]);
    }

    #[test]
    fn forward_envelope_wire_shape() {
        let mut request = Request::new("ARITHMETIC");
        request.ensure_request_id();
        let envelope = ForwardEnvelope {
            request,
            origin_node_id: "gw-1".into(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("request").is_some());
        assert_eq!(json["origin_node_id"], "gw-1");

        let back: ForwardEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.origin_node_id, "gw-1".into());
    }

    #[tokio::test]
    async fn forward_to_unreachable_peer_fails() {
        let cluster = ClusterService::new(&settings(&["http://seed:9200"], 10));
        // Nothing listens on this port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = NodeState::new("ex-1".into(), "127.0.0.1", port, NodeRole::Executor);
        let err = cluster
            .forward(&Request::new("ECHO"), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ClusterForwardFailed(_)));
        assert_eq!(cluster.stats().forwarded, 0);
    }
}
