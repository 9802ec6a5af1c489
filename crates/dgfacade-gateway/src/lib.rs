#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Gateway daemon wiring for DGFacade.
//!
//! Builds the full stack from one config root: registries, engine,
//! dispatcher, ingesters, cluster membership, and the auto-reload
//! scheduler. HTTP/WebSocket transports are external collaborators; they
//! mount on the [`Gateway`]'s dispatcher, stream gate, and cluster
//! service.

mod sink;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dgfacade_config::{AutoReloadService, ConfigStore};
use dgfacade_core::{GatewayError, GatewayResult};
use dgfacade_dispatch::{ClusterService, Dispatcher};
use dgfacade_engine::builtin::register_builtins;
use dgfacade_engine::{BroadcastGate, EngineContext, ExecutionEngine, StreamGate};
use dgfacade_ingest::IngesterManager;
use tracing::info;

pub use sink::DispatcherSink;

/// The assembled gateway.
pub struct Gateway {
    store: Arc<ConfigStore>,
    ctx: Arc<EngineContext>,
    dispatcher: Arc<Dispatcher>,
    ingesters: Arc<IngesterManager>,
    cluster: Arc<ClusterService>,
    reload: Arc<AutoReloadService>,
    gate: Arc<BroadcastGate>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// Wire the stack from a config root.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ConfigError`] for unreadable or malformed
    /// configuration; startup maps it to exit code 2.
    pub fn build(config_root: &Path) -> GatewayResult<Self> {
        let store = Arc::new(ConfigStore::open(config_root).map_err(GatewayError::from)?);
        let settings = store.settings().clone();

        let gate = Arc::new(BroadcastGate::new(1_024));
        let ctx = EngineContext::new(
            Arc::clone(&store),
            Some(Arc::clone(&gate) as Arc<dyn StreamGate>),
        );
        register_builtins(&ctx.catalog);

        let cluster = ClusterService::new(&settings);
        let engine = ExecutionEngine::new(Arc::clone(&ctx));
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::clone(&store), engine).with_cluster(Arc::clone(&cluster)),
        );
        let ingesters = Arc::new(IngesterManager::new(
            Arc::clone(&store),
            Arc::new(DispatcherSink::new(Arc::clone(&dispatcher))),
        ));
        let reload = Arc::new(AutoReloadService::new(Duration::from_secs(
            settings.reload_interval_seconds.max(1),
        )));
        store.register_auto_reload(&reload);

        Ok(Self {
            store,
            ctx,
            dispatcher,
            ingesters,
            cluster,
            reload,
            gate,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start the background services: auto-reload, cluster heartbeats,
    /// and every enabled ingester.
    pub async fn start(&self) {
        let reload_task = Arc::clone(&self.reload).spawn(self.ctx.shutdown.child_token());
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.push(reload_task);
        if let Some(heartbeat) = self.cluster.start() {
            tasks.push(heartbeat);
        }
        drop(tasks);
        let _ = self.ingesters.start_all().await;
        info!(node = %self.store.settings().node.node_id, "gateway started");
    }

    /// Stop everything in dependency order: intake first, then sessions
    /// and executions, then the cached channels.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.ingesters.stop_all().await;

        // Announce departure while heartbeats still flow.
        self.cluster.mark_leaving();
        if self.cluster.is_clustered() {
            self.cluster.beat_once().await;
        }
        self.cluster.stop();

        // Cancels executions and streaming sessions.
        self.ctx.shutdown.cancel();
        // Give execution units their grace period to unwind.
        let grace = Duration::from_secs(self.store.settings().engine.grace_period_seconds);
        let deadline = tokio::time::Instant::now() + grace;
        while self.ctx.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.ctx.accessor.shutdown().await;

        let tasks: Vec<_> = {
            let mut guard = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("gateway stopped");
    }

    /// The config store.
    #[must_use]
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// The dispatch pipeline; inbound transports submit through it.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The ingester manager.
    #[must_use]
    pub fn ingesters(&self) -> &Arc<IngesterManager> {
        &self.ingesters
    }

    /// The cluster service; the HTTP layer mounts its heartbeat and
    /// forward endpoints.
    #[must_use]
    pub fn cluster(&self) -> &Arc<ClusterService> {
        &self.cluster
    }

    /// The auto-reload scheduler (force-reload API).
    #[must_use]
    pub fn reload(&self) -> &Arc<AutoReloadService> {
        &self.reload
    }

    /// The in-process stream gate; the WebSocket layer subscribes here.
    #[must_use]
    pub fn stream_gate(&self) -> &Arc<BroadcastGate> {
        &self.gate
    }

    /// The engine context (state ring, sessions, accessor).
    #[must_use]
    pub fn engine_context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("node", &self.store.settings().node.node_id)
            .finish_non_exhaustive()
    }
}
