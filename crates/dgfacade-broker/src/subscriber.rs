//! The shared subscriber supervisor.
//!
//! Owns the bounded internal queue, the backpressure policy, reconnection
//! with re-subscription, and listener dispatch. Protocol specifics live
//! behind [`SubscriberTransport`].
//!
//! Backpressure: when the queue depth reaches the configured limit the
//! supervisor stops pulling from the broker (the transport is paused, or
//! the poll cycle skipped). Messages stay with the broker; nothing already
//! received is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dgfacade_config::ResolvedChannel;
use dgfacade_core::MessageEnvelope;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::error::{BrokerError, BrokerResult};
use crate::state::ConnectionState;
use crate::stats::{SubscriberStats, SubscriberStatsSnapshot};

/// One message pulled from the broker, tagged with its destination.
#[derive(Debug)]
pub struct Delivery {
    /// The destination the message arrived on.
    pub destination: String,
    /// The message.
    pub envelope: MessageEnvelope,
}

/// Async listener invoked per delivered envelope.
pub type Listener = Arc<dyn Fn(MessageEnvelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Protocol-specific half of a subscriber.
#[async_trait]
pub trait SubscriberTransport: Send {
    /// Establish the connection described by the resolved channel.
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()>;

    /// Register interest in a destination.
    async fn subscribe(&mut self, destination: &str) -> BrokerResult<()>;

    /// Drop interest in a destination.
    async fn unsubscribe(&mut self, destination: &str) -> BrokerResult<()>;

    /// Pull the next batch of messages. An empty batch is a completed poll
    /// cycle; the supervisor idles before the next one.
    async fn poll(&mut self) -> BrokerResult<Vec<Delivery>>;

    /// Stop the flow from the broker without dropping the connection.
    async fn pause(&mut self) {}

    /// Resume the flow after a pause.
    async fn resume(&mut self) {}

    /// Release the connection.
    async fn close(&mut self) {}
}

/// Default backpressure limit on the internal queue.
pub const DEFAULT_MAX_DEPTH: usize = 10_000;

/// A supervised broker subscriber.
pub struct BrokerSubscriber {
    channel: ResolvedChannel,
    transport: tokio::sync::Mutex<Box<dyn SubscriberTransport>>,
    listeners: DashMap<String, Listener>,
    state: std::sync::RwLock<ConnectionState>,
    paused: AtomicBool,
    depth: AtomicUsize,
    max_depth: usize,
    resume_depth: usize,
    poll_idle: Duration,
    stats: SubscriberStats,
    queue_tx: mpsc::Sender<Delivery>,
    queue_rx: std::sync::Mutex<Option<mpsc::Receiver<Delivery>>>,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BrokerSubscriber {
    /// Wrap a transport for the given resolved channel.
    #[must_use]
    pub fn new(channel: ResolvedChannel, transport: Box<dyn SubscriberTransport>) -> Arc<Self> {
        let max_depth = if channel.queue.depth == 0 {
            DEFAULT_MAX_DEPTH
        } else {
            channel.queue.depth
        };
        let resume_depth = max_depth
            .saturating_mul(usize::from(channel.queue.drain_resume_pct))
            .checked_div(100)
            .unwrap_or(0);
        let poll_idle = Duration::from_millis(channel.property_u64("poll_interval_ms", 200));
        let (queue_tx, queue_rx) = mpsc::channel(max_depth);
        Arc::new(Self {
            channel,
            transport: tokio::sync::Mutex::new(transport),
            listeners: DashMap::new(),
            state: std::sync::RwLock::new(ConnectionState::Disconnected),
            paused: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            max_depth,
            resume_depth,
            poll_idle,
            stats: SubscriberStats::default(),
            queue_tx,
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
            shutdown: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// The channel this subscriber rides on.
    #[must_use]
    pub fn channel(&self) -> &ResolvedChannel {
        &self.channel
    }

    fn set_state(&self, state: ConnectionState) {
        let mut guard = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = state;
    }

    fn state(&self) -> ConnectionState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Connect; destinations registered before this call are subscribed.
    pub async fn initialize(&self) -> BrokerResult<()> {
        self.set_state(ConnectionState::Connecting);
        let mut transport = self.transport.lock().await;
        transport.connect(&self.channel).await.inspect_err(|_| {
            self.set_state(ConnectionState::Reconnecting);
        })?;
        let destinations: Vec<String> = self
            .listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for destination in destinations {
            transport.subscribe(&destination).await?;
        }
        drop(transport);
        self.set_state(ConnectionState::Connected);
        info!(channel = %self.channel.channel_id, broker = %self.channel.broker_id, "subscriber connected");
        Ok(())
    }

    /// Register a listener for a destination.
    pub async fn subscribe(&self, destination: &str, listener: Listener) -> BrokerResult<()> {
        self.listeners.insert(destination.to_owned(), listener);
        if self.state() == ConnectionState::Connected {
            let mut transport = self.transport.lock().await;
            transport.subscribe(destination).await?;
        }
        debug!(channel = %self.channel.channel_id, destination, "subscribed");
        Ok(())
    }

    /// Drop a destination's listener.
    pub async fn unsubscribe(&self, destination: &str) -> BrokerResult<()> {
        self.listeners.remove(destination);
        if self.state() == ConnectionState::Connected {
            let mut transport = self.transport.lock().await;
            transport.unsubscribe(destination).await?;
        }
        Ok(())
    }

    /// Spawn the poll and dispatch loops.
    pub fn start(self: &Arc<Self>) {
        let receiver = self
            .queue_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            warn!(channel = %self.channel.channel_id, "subscriber already started");
            return;
        };
        let poll_task = tokio::spawn(Arc::clone(self).poll_loop());
        let dispatch_task = tokio::spawn(Arc::clone(self).dispatch_loop(receiver));
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.push(poll_task);
        tasks.push(dispatch_task);
    }

    /// Hold the flow; the poll loop idles until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Paused);
    }

    /// Resume the flow after a pause.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        if self.state() == ConnectionState::Paused {
            self.set_state(ConnectionState::Connected);
        }
    }

    /// Destinations with registered listeners.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Current internal queue depth.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> SubscriberStatsSnapshot {
        self.stats.snapshot(self.queue_depth())
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    /// Stop the loops, release the connection, and refuse further work.
    ///
    /// An in-flight poll cycle finishes before the transport closes.
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.shutdown.cancel();
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
        let mut transport = self.transport.lock().await;
        transport.close().await;
        drop(transport);
        self.set_state(ConnectionState::Closed);
        debug!(channel = %self.channel.channel_id, "subscriber closed");
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut backoff = Backoff::for_channel(&self.channel);
        let mut transport_paused = false;
        let warn_depth = self
            .max_depth
            .saturating_mul(usize::from(self.channel.queue.warning_threshold_pct))
            .checked_div(100)
            .unwrap_or(usize::MAX);
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if self.paused.load(Ordering::SeqCst) {
                self.idle().await;
                continue;
            }

            let depth = self.queue_depth();
            if depth >= self.max_depth {
                // Backpressure: stop pulling; messages stay with the broker.
                if !transport_paused {
                    warn!(
                        channel = %self.channel.channel_id,
                        depth,
                        max = self.max_depth,
                        "backpressure engaged, transport paused"
                    );
                    self.transport.lock().await.pause().await;
                    transport_paused = true;
                }
                self.idle().await;
                continue;
            }
            if transport_paused && depth <= self.resume_depth {
                debug!(channel = %self.channel.channel_id, depth, "backpressure released");
                self.transport.lock().await.resume().await;
                transport_paused = false;
            }
            if depth >= warn_depth {
                warn!(channel = %self.channel.channel_id, depth, "queue depth past warning threshold");
            }

            let batch = {
                let mut transport = self.transport.lock().await;
                transport.poll().await
            };
            match batch {
                Ok(batch) if batch.is_empty() => {
                    self.idle().await;
                },
                Ok(batch) => {
                    for delivery in batch {
                        // Reserve the slot first so the observed depth can
                        // never exceed the configured limit.
                        let Ok(permit) = self.queue_tx.reserve().await else {
                            // Dispatch loop gone; shutting down.
                            return;
                        };
                        self.stats.received.fetch_add(1, Ordering::Relaxed);
                        self.depth.fetch_add(1, Ordering::SeqCst);
                        permit.send(delivery);
                    }
                },
                Err(err) => {
                    error!(channel = %self.channel.channel_id, error = %err, "poll failed, reconnecting");
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Reconnecting);
                    if !self.reconnect(&mut backoff).await {
                        return;
                    }
                    transport_paused = false;
                },
            }
        }
    }

    /// Sleep the poll interval, or return early on shutdown.
    async fn idle(&self) {
        tokio::select! {
            () = self.shutdown.cancelled() => {},
            () = tokio::time::sleep(self.poll_idle) => {},
        }
    }

    /// Reconnect with backoff until success or shutdown. Returns false on
    /// shutdown.
    async fn reconnect(&self, backoff: &mut Backoff) -> bool {
        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }
            self.set_state(ConnectionState::Connecting);
            let mut transport = self.transport.lock().await;
            match transport.connect(&self.channel).await {
                Ok(()) => {
                    // Re-establish every prior subscription.
                    let destinations: Vec<String> = self
                        .listeners
                        .iter()
                        .map(|entry| entry.key().clone())
                        .collect();
                    let mut resubscribed = true;
                    for destination in destinations {
                        if let Err(err) = transport.subscribe(&destination).await {
                            warn!(destination = %destination, error = %err, "re-subscription failed");
                            resubscribed = false;
                        }
                    }
                    drop(transport);
                    if resubscribed {
                        backoff.reset();
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.set_state(ConnectionState::Connected);
                        info!(channel = %self.channel.channel_id, "subscriber reconnected");
                        return true;
                    }
                    self.set_state(ConnectionState::Reconnecting);
                },
                Err(err) => {
                    drop(transport);
                    warn!(channel = %self.channel.channel_id, error = %err, "reconnect attempt failed");
                    self.set_state(ConnectionState::Reconnecting);
                },
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut receiver: mpsc::Receiver<Delivery>) {
        loop {
            let delivery = tokio::select! {
                () = self.shutdown.cancelled() => return,
                delivery = receiver.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                return;
            };
            self.depth.fetch_sub(1, Ordering::SeqCst);
            let listener = self
                .listeners
                .get(&delivery.destination)
                .map(|entry| Arc::clone(entry.value()));
            if let Some(listener) = listener {
                trace!(
                    channel = %self.channel.channel_id,
                    destination = %delivery.destination,
                    message_id = %delivery.envelope.message_id,
                    "dispatching"
                );
                (listener)(delivery.envelope).await;
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!(
                    channel = %self.channel.channel_id,
                    destination = %delivery.destination,
                    "no listener for destination"
                );
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for BrokerSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSubscriber")
            .field("channel", &self.channel.channel_id)
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn test_channel(depth: usize) -> ResolvedChannel {
        let broker: dgfacade_config::BrokerConfig = serde_json::from_value(serde_json::json!({
            "type": "filesystem",
            "properties": {"reconnect_interval_seconds": 0, "poll_interval_ms": 5}
        }))
        .unwrap();
        let channel: dgfacade_config::ChannelConfig = serde_json::from_value(serde_json::json!({
            "type": "filesystem",
            "broker": "test",
            "queue": {"depth": depth}
        }))
        .unwrap();
        dgfacade_config::resolve::resolve_channel("test-channel", &channel, &broker).unwrap()
    }

    /// Transport fed from a shared script of poll results.
    struct ScriptedTransport {
        script: Arc<Mutex<VecDeque<BrokerResult<Vec<Delivery>>>>>,
        connects: Arc<AtomicUsize>,
        subscriptions: Arc<Mutex<Vec<String>>>,
        paused: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SubscriberTransport for ScriptedTransport {
        async fn connect(&mut self, _channel: &ResolvedChannel) -> BrokerResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn subscribe(&mut self, destination: &str) -> BrokerResult<()> {
            self.subscriptions
                .lock()
                .unwrap()
                .push(destination.to_owned());
            Ok(())
        }

        async fn unsubscribe(&mut self, _destination: &str) -> BrokerResult<()> {
            Ok(())
        }

        async fn poll(&mut self) -> BrokerResult<Vec<Delivery>> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn pause(&mut self) {
            self.paused.store(true, Ordering::SeqCst);
        }

        async fn resume(&mut self) {
            self.paused.store(false, Ordering::SeqCst);
        }
    }

    fn delivery(dest: &str, n: usize) -> Delivery {
        Delivery {
            destination: dest.to_owned(),
            envelope: MessageEnvelope::new(dest, format!("m{n}")),
        }
    }

    #[tokio::test]
    async fn delivers_to_listener_in_order() {
        let script = Arc::new(Mutex::new(VecDeque::from([Ok(vec![
            delivery("in", 1),
            delivery("in", 2),
            delivery("in", 3),
        ])])));
        let subscriber = BrokerSubscriber::new(
            test_channel(100),
            Box::new(ScriptedTransport {
                script,
                connects: Arc::new(AtomicUsize::new(0)),
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                paused: Arc::new(AtomicBool::new(false)),
            }),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        subscriber
            .subscribe(
                "in",
                Arc::new(move |envelope| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        sink.lock().unwrap().push(envelope.payload);
                    })
                }),
            )
            .await
            .unwrap();
        subscriber.initialize().await.unwrap();
        subscriber.start();

        for _ in 0..100 {
            if seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        subscriber.close().await;

        assert_eq!(*seen.lock().unwrap(), vec!["m1", "m2", "m3"]);
        let stats = subscriber.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.queue_depth, 0);
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes_after_poll_error() {
        let script = Arc::new(Mutex::new(VecDeque::from([
            Err(BrokerError::Protocol("broker went away".to_owned())),
            Ok(vec![delivery("in", 1)]),
        ])));
        let connects = Arc::new(AtomicUsize::new(0));
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let subscriber = BrokerSubscriber::new(
            test_channel(100),
            Box::new(ScriptedTransport {
                script,
                connects: Arc::clone(&connects),
                subscriptions: Arc::clone(&subscriptions),
                paused: Arc::new(AtomicBool::new(false)),
            }),
        );

        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        subscriber
            .subscribe(
                "in",
                Arc::new(move |_| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        sink.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await
            .unwrap();
        subscriber.initialize().await.unwrap();
        subscriber.start();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        subscriber.close().await;

        // initialize + reconnect
        assert!(connects.load(Ordering::SeqCst) >= 2);
        // subscribed on initialize and again after reconnect
        assert!(subscriptions.lock().unwrap().len() >= 2);
        assert_eq!(subscriber.stats().reconnects, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backpressure_pauses_transport_and_never_exceeds_depth() {
        // Queue limit of 4; a slow listener keeps the queue full.
        let script = Arc::new(Mutex::new(VecDeque::from([
            Ok((0..4).map(|n| delivery("in", n)).collect::<Vec<_>>()),
            Ok(vec![delivery("in", 99)]),
        ])));
        let paused = Arc::new(AtomicBool::new(false));
        let subscriber = BrokerSubscriber::new(
            test_channel(4),
            Box::new(ScriptedTransport {
                script,
                connects: Arc::new(AtomicUsize::new(0)),
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                paused: Arc::clone(&paused),
            }),
        );

        let max_seen_depth = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&max_seen_depth);
        let this = Arc::clone(&subscriber);
        subscriber
            .subscribe(
                "in",
                Arc::new(move |_| {
                    let probe = Arc::clone(&probe);
                    let this = Arc::clone(&this);
                    Box::pin(async move {
                        probe.fetch_max(this.queue_depth(), Ordering::SeqCst);
                        // Slow consumer.
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    })
                }),
            )
            .await
            .unwrap();
        subscriber.initialize().await.unwrap();
        subscriber.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Depth never exceeded the limit while the consumer lagged.
        assert!(max_seen_depth.load(Ordering::SeqCst) <= 4);
        // Transport saw a pause while saturated.
        assert!(paused.load(Ordering::SeqCst) || subscriber.queue_depth() < 4);
        subscriber.close().await;
        let stats = subscriber.stats();
        let backlog = usize::try_from(stats.received.saturating_sub(stats.dispatched)).unwrap();
        assert_eq!(backlog, subscriber.queue_depth());
    }
}
