//! One ingester: a subscriber, a request synthesizer, and counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dgfacade_broker::BrokerSubscriber;
use dgfacade_core::{Request, RequestSource};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::sink::RequestSink;

/// Map a normalized channel type onto the request source it stamps.
fn source_for(channel_type: &str) -> RequestSource {
    match channel_type {
        "kafka" | "confluent_kafka" => RequestSource::Kafka,
        "activemq" => RequestSource::Activemq,
        "rabbitmq" => RequestSource::Rabbitmq,
        "ibmmq" => RequestSource::Ibmmq,
        "filesystem" => RequestSource::Filesystem,
        "sql" => RequestSource::Sql,
        _ => RequestSource::Manual,
    }
}

#[derive(Debug, Default)]
struct IngesterStats {
    received: AtomicU64,
    submitted: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time ingester counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngesterStatsSnapshot {
    /// Messages pulled off the channel.
    pub received: u64,
    /// Requests handed to the dispatcher.
    pub submitted: u64,
    /// Dispatch failures.
    pub failed: u64,
    /// Messages that did not parse as requests.
    pub rejected: u64,
}

/// A scoped adapter from one input channel to the dispatch pipeline.
pub struct Ingester {
    id: String,
    source: RequestSource,
    subscriber: Arc<BrokerSubscriber>,
    sink: Arc<dyn RequestSink>,
    stats: Arc<IngesterStats>,
    running: AtomicBool,
}

impl Ingester {
    /// Wrap a resolved subscriber.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        subscriber: Arc<BrokerSubscriber>,
        sink: Arc<dyn RequestSink>,
    ) -> Arc<Self> {
        let source = source_for(&subscriber.channel().channel_type);
        Arc::new(Self {
            id: id.into(),
            source,
            subscriber,
            sink,
            stats: Arc::new(IngesterStats::default()),
            running: AtomicBool::new(false),
        })
    }

    /// The ingester id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The source stamped onto synthesized requests.
    #[must_use]
    pub fn source(&self) -> RequestSource {
        self.source
    }

    /// Whether the ingester is consuming.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The underlying subscriber.
    #[must_use]
    pub fn subscriber(&self) -> &Arc<BrokerSubscriber> {
        &self.subscriber
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> IngesterStatsSnapshot {
        IngesterStatsSnapshot {
            received: self.stats.received.load(Ordering::Relaxed),
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    /// Subscribe every configured destination and start consuming.
    pub async fn start(self: &Arc<Self>) -> dgfacade_core::GatewayResult<()> {
        let destinations: Vec<String> = self
            .subscriber
            .channel()
            .destinations
            .iter()
            .map(|destination| destination.name.clone())
            .collect();
        for destination in destinations {
            let this = Arc::clone(self);
            self.subscriber
                .subscribe(
                    &destination,
                    Arc::new(move |envelope| {
                        let this = Arc::clone(&this);
                        Box::pin(async move {
                            this.process(&envelope.payload).await;
                        })
                    }),
                )
                .await?;
        }
        self.subscriber.start();
        self.running.store(true, Ordering::SeqCst);
        info!(ingester = %self.id, source = %self.source, "ingester started");
        Ok(())
    }

    /// Stop consuming and close the underlying subscriber.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.subscriber.close().await;
        info!(ingester = %self.id, "ingester stopped");
    }

    /// Process a supplied JSON string as if it came from the broker.
    pub async fn submit_manual(&self, body: &str) {
        self.process(body).await;
    }

    /// Synthesize and dispatch one request from a message body.
    async fn process(&self, body: &str) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let mut request: Request = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(err) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(ingester = %self.id, error = %err, "message rejected, not a request");
                return;
            },
        };
        request.source = self.source;
        let request_id = request.ensure_request_id().clone();

        match self.sink.submit(request).await {
            Ok(response) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    ingester = %self.id,
                    request_id = %request_id,
                    status = %response.status,
                    "request dispatched"
                );
            },
            Err(err) => {
                // Ingester-sourced requests have no response channel;
                // failures go to logs and counters only.
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(ingester = %self.id, request_id = %request_id, error = %err, "dispatch failed");
            },
        }
    }
}

impl std::fmt::Debug for Ingester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingester")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
