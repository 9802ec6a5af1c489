//! Builds and owns the configured ingesters.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dgfacade_broker::create_subscriber;
use dgfacade_config::ConfigStore;
use dgfacade_core::{GatewayError, GatewayResult};
use tracing::{error, info, warn};

use crate::ingester::{Ingester, IngesterStatsSnapshot};
use crate::sink::RequestSink;

/// Resolves, builds, and supervises every configured ingester.
pub struct IngesterManager {
    store: Arc<ConfigStore>,
    sink: Arc<dyn RequestSink>,
    ingesters: DashMap<String, Arc<Ingester>>,
}

impl IngesterManager {
    /// Create a manager over the config store and dispatch sink.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, sink: Arc<dyn RequestSink>) -> Self {
        Self {
            store,
            sink,
            ingesters: DashMap::new(),
        }
    }

    /// Build and start every enabled ingester.
    ///
    /// A single broken ingester is logged and skipped; it never stops the
    /// others from starting. Returns the number started.
    pub async fn start_all(&self) -> usize {
        let configured: Vec<String> = self
            .store
            .ingesters()
            .snapshot()
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(id, _)| id.clone())
            .collect();
        let mut started = 0usize;
        for id in configured {
            match self.start_one(&id).await {
                Ok(()) => started = started.saturating_add(1),
                Err(err) => {
                    error!(ingester = %id, error = %err, "ingester failed to start");
                },
            }
        }
        info!(started, "ingesters running");
        started
    }

    /// Build and start one ingester by id.
    pub async fn start_one(&self, ingester_id: &str) -> GatewayResult<()> {
        if self.ingesters.contains_key(ingester_id) {
            return Err(GatewayError::InvalidRequest(format!(
                "ingester {ingester_id} is already running"
            )));
        }
        let (_, resolved) = self.store.resolve_ingester(ingester_id)?;
        let subscriber = create_subscriber(&resolved)?;
        if let Err(err) = subscriber.initialize().await {
            // The supervisor keeps reconnecting; consumption starts when
            // the broker comes up.
            warn!(ingester = %ingester_id, error = %err, "ingester starting disconnected");
        }
        let ingester = Ingester::new(ingester_id, subscriber, Arc::clone(&self.sink));
        ingester.start().await?;
        self.ingesters.insert(ingester_id.to_owned(), ingester);
        Ok(())
    }

    /// Stop one ingester and close its subscriber.
    pub async fn stop_one(&self, ingester_id: &str) -> bool {
        match self.ingesters.remove(ingester_id) {
            Some((_, ingester)) => {
                ingester.stop().await;
                true
            },
            None => false,
        }
    }

    /// Stop every running ingester.
    pub async fn stop_all(&self) {
        let running: Vec<String> = self
            .ingesters
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in running {
            let _ = self.stop_one(&id).await;
        }
        info!("ingesters stopped");
    }

    /// A running ingester by id.
    #[must_use]
    pub fn get(&self, ingester_id: &str) -> Option<Arc<Ingester>> {
        self.ingesters
            .get(ingester_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Process a JSON body through a running ingester as if it came from
    /// its broker.
    pub async fn submit_manual(&self, ingester_id: &str, body: &str) -> GatewayResult<()> {
        let ingester = self.get(ingester_id).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("no running ingester {ingester_id}"))
        })?;
        ingester.submit_manual(body).await;
        Ok(())
    }

    /// Counter snapshots for every running ingester.
    #[must_use]
    pub fn stats(&self) -> HashMap<String, IngesterStatsSnapshot> {
        self.ingesters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }
}

impl std::fmt::Debug for IngesterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngesterManager")
            .field("running", &self.ingesters.len())
            .finish_non_exhaustive()
    }
}
