//! The engine context: every collaborator an execution unit needs,
//! constructed once at startup and passed explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dgfacade_config::handler::HandlerConfig;
use dgfacade_config::{ConfigStore, GatewaySettings};
use dgfacade_core::GatewayResult;
use tokio_util::sync::CancellationToken;

use crate::accessor::ChannelAccessor;
use crate::fanout::{FanoutPublisher, RestBuffer, StreamGate};
use crate::handler::{Handler, HandlerCatalog};
use crate::session::SessionManager;
use crate::state::StateRing;

/// Boundary to the out-of-process foreign worker (`is_python` handlers).
///
/// The worker itself is outside the core; installing a bridge makes
/// `is_python` catalogue entries executable.
pub trait ForeignWorkerBridge: Send + Sync {
    /// Instantiate a handler proxy for a foreign-worker catalogue entry.
    fn instantiate(&self, config: &HandlerConfig) -> GatewayResult<Box<dyn Handler>>;
}

/// Shared state of the execution engine.
pub struct EngineContext {
    /// Registered handler classes.
    pub catalog: Arc<HandlerCatalog>,
    /// Recent execution states.
    pub ring: Arc<StateRing>,
    /// Live streaming sessions.
    pub sessions: Arc<SessionManager>,
    /// Handler-facing channel access.
    pub accessor: Arc<ChannelAccessor>,
    /// REST pull buffers for streamed responses.
    pub rest: Arc<RestBuffer>,
    /// Process-level settings.
    pub settings: GatewaySettings,
    /// Optional foreign-worker boundary.
    pub foreign_bridge: Option<Arc<dyn ForeignWorkerBridge>>,
    /// Engine-wide shutdown signal.
    pub shutdown: CancellationToken,
    pub(crate) active: AtomicU64,
    pub(crate) total: AtomicU64,
}

impl EngineContext {
    /// Wire a context from the config store.
    ///
    /// `gate` is the in-process delivery surface for the WebSocket layer;
    /// `None` means websocket fan-out is skipped (and logged).
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, gate: Option<Arc<dyn StreamGate>>) -> Arc<Self> {
        let settings = store.settings().clone();
        let accessor = Arc::new(ChannelAccessor::new(store));
        let rest = Arc::new(RestBuffer::new(settings.streaming.rest_buffer_capacity));
        let fanout = Arc::new(FanoutPublisher::new(
            Arc::clone(&accessor),
            gate,
            Arc::clone(&rest),
            settings.streaming.stream_prefix.clone(),
            settings.streaming.output_channels.clone(),
        ));
        let sessions = SessionManager::new(fanout, settings.streaming.channel_queue_capacity);
        Arc::new(Self {
            catalog: Arc::new(HandlerCatalog::new()),
            ring: Arc::new(StateRing::new(settings.engine.recent_states_capacity)),
            sessions,
            accessor,
            rest,
            settings,
            foreign_bridge: None,
            shutdown: CancellationToken::new(),
            active: AtomicU64::new(0),
            total: AtomicU64::new(0),
        })
    }

    /// Install the foreign worker boundary.
    #[must_use]
    pub fn with_foreign_bridge(self: Arc<Self>, bridge: Arc<dyn ForeignWorkerBridge>) -> Arc<Self> {
        // Contexts are wired once at startup, before executions run, so
        // rebuilding the Arc here is safe.
        let mut inner = Arc::try_unwrap(self).unwrap_or_else(|shared| Self {
            catalog: Arc::clone(&shared.catalog),
            ring: Arc::clone(&shared.ring),
            sessions: Arc::clone(&shared.sessions),
            accessor: Arc::clone(&shared.accessor),
            rest: Arc::clone(&shared.rest),
            settings: shared.settings.clone(),
            foreign_bridge: shared.foreign_bridge.clone(),
            shutdown: shared.shutdown.clone(),
            active: AtomicU64::new(shared.active.load(Ordering::SeqCst)),
            total: AtomicU64::new(shared.total.load(Ordering::SeqCst)),
        });
        inner.foreign_bridge = Some(bridge);
        Arc::new(inner)
    }

    /// Executions currently in flight.
    #[must_use]
    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Executions accepted since startup.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("active", &self.active_count())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
