//! The shared publisher supervisor.
//!
//! Owns the connection state machine, reconnection with jittered backoff,
//! topic re-registration after reconnect, and the publish/flush contract.
//! Protocol specifics live behind [`PublisherTransport`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dgfacade_config::ResolvedChannel;
use dgfacade_core::MessageEnvelope;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{BrokerError, BrokerResult};
use crate::state::ConnectionState;
use crate::stats::{PublisherStats, PublisherStatsSnapshot};

/// Protocol-specific half of a publisher.
#[async_trait]
pub trait PublisherTransport: Send {
    /// Establish the connection described by the resolved channel.
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()>;

    /// Deliver one envelope to a topic.
    async fn send(&mut self, topic: &str, envelope: &MessageEnvelope) -> BrokerResult<()>;

    /// Prepare a topic before first use (declare a queue, create a
    /// directory or table). Default: nothing to do.
    async fn register_topic(&mut self, _topic: &str) -> BrokerResult<()> {
        Ok(())
    }

    /// Push buffered envelopes out. Default: nothing buffered.
    async fn flush(&mut self) -> BrokerResult<()> {
        Ok(())
    }

    /// Batching transports flush on this schedule.
    fn flush_interval(&self) -> Option<Duration> {
        None
    }

    /// Release the connection.
    async fn close(&mut self) {}
}

/// A supervised broker publisher.
pub struct BrokerPublisher {
    channel: ResolvedChannel,
    transport: tokio::sync::Mutex<Box<dyn PublisherTransport>>,
    state: std::sync::RwLock<ConnectionState>,
    topics: std::sync::Mutex<BTreeSet<String>>,
    stats: PublisherStats,
    backoff: std::sync::Mutex<Backoff>,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

impl BrokerPublisher {
    /// Wrap a transport for the given resolved channel.
    #[must_use]
    pub fn new(channel: ResolvedChannel, transport: Box<dyn PublisherTransport>) -> Arc<Self> {
        let backoff = Backoff::for_channel(&channel);
        Arc::new(Self {
            channel,
            transport: tokio::sync::Mutex::new(transport),
            state: std::sync::RwLock::new(ConnectionState::Disconnected),
            topics: std::sync::Mutex::new(BTreeSet::new()),
            stats: PublisherStats::default(),
            backoff: std::sync::Mutex::new(backoff),
            reconnecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// The channel this publisher rides on.
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

    /// Connect and start the flush schedule if the transport batches.
    ///
    /// A failed initial connect leaves the publisher `RECONNECTING` with
    /// the backoff loop running, and returns the error so callers can
    /// surface it.
    pub async fn initialize(self: &Arc<Self>) -> BrokerResult<()> {
        self.set_state(ConnectionState::Connecting);
        let result = {
            let mut transport = self.transport.lock().await;
            transport.connect(&self.channel).await
        };
        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.register_known_topics().await;
                self.spawn_flush_schedule();
                info!(channel = %self.channel.channel_id, broker = %self.channel.broker_id, "publisher connected");
                Ok(())
            },
            Err(err) => {
                warn!(channel = %self.channel.channel_id, error = %err, "publisher connect failed");
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_reconnect();
                Err(err)
            },
        }
    }

    async fn register_known_topics(&self) {
        let topics: Vec<String> = {
            let guard = self
                .topics
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.iter().cloned().collect()
        };
        let mut transport = self.transport.lock().await;
        for topic in topics {
            if let Err(err) = transport.register_topic(&topic).await {
                warn!(topic = %topic, error = %err, "topic re-registration failed");
            }
        }
    }

    fn spawn_flush_schedule(self: &Arc<Self>) {
        let interval = {
            // flush_interval is a pure accessor; a blocking lock here would
            // be wrong inside async, so consult it through try_lock.
            match self.transport.try_lock() {
                Ok(transport) => transport.flush_interval(),
                Err(_) => None,
            }
        };
        let Some(interval) = interval else {
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = this.shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if this.state() == ConnectionState::Connected
                            && let Err(err) = this.flush().await
                        {
                            warn!(channel = %this.channel.channel_id, error = %err, "scheduled flush failed");
                        }
                    }
                }
            }
        });
    }

    /// Track a topic; batching transports get it prepared immediately when
    /// connected.
    pub async fn add_topic(&self, topic: &str) -> BrokerResult<()> {
        let newly_added = self
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(topic.to_owned());
        if newly_added && self.state() == ConnectionState::Connected {
            let mut transport = self.transport.lock().await;
            transport.register_topic(topic).await?;
        }
        Ok(())
    }

    /// Publish one envelope.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotConnected`] while disconnected (the reconnect loop
    /// keeps running); transport failures flip the state machine to
    /// `RECONNECTING` and bubble up.
    pub async fn publish(
        self: &Arc<Self>,
        topic: &str,
        envelope: &MessageEnvelope,
    ) -> BrokerResult<()> {
        self.add_topic(topic).await?;
        match self.state() {
            ConnectionState::Connected => {},
            state if state.is_terminal() => return Err(BrokerError::Closed),
            _ => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.schedule_reconnect();
                return Err(BrokerError::NotConnected(self.channel.channel_id.clone()));
            },
        }

        let result = {
            let mut transport = self.transport.lock().await;
            transport.send(topic, envelope).await
        };
        match result {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(err) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %self.channel.channel_id, topic = %topic, error = %err, "publish failed");
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_reconnect();
                Err(err)
            },
        }
    }

    /// Publish a batch; stops on the first failure.
    pub async fn publish_batch(
        self: &Arc<Self>,
        topic: &str,
        envelopes: &[MessageEnvelope],
    ) -> BrokerResult<()> {
        for envelope in envelopes {
            self.publish(topic, envelope).await?;
        }
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Push buffered envelopes out now.
    pub async fn flush(&self) -> BrokerResult<()> {
        let mut transport = self.transport.lock().await;
        transport.flush().await
    }

    /// Whether the publisher is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Flush, release the connection, and refuse further work.
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.shutdown.cancel();
        let mut transport = self.transport.lock().await;
        if let Err(err) = transport.flush().await {
            warn!(channel = %self.channel.channel_id, error = %err, "flush during close failed");
        }
        transport.close().await;
        drop(transport);
        self.set_state(ConnectionState::Closed);
        debug!(channel = %self.channel.channel_id, "publisher closed");
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = {
                    let mut backoff = this
                        .backoff
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    backoff.next_delay()
                };
                tokio::select! {
                    () = this.shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                this.set_state(ConnectionState::Connecting);
                let result = {
                    let mut transport = this.transport.lock().await;
                    transport.connect(&this.channel).await
                };
                match result {
                    Ok(()) => {
                        this.set_state(ConnectionState::Connected);
                        this.backoff
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .reset();
                        this.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        this.register_known_topics().await;
                        info!(channel = %this.channel.channel_id, "publisher reconnected");
                        break;
                    },
                    Err(err) => {
                        warn!(channel = %this.channel.channel_id, error = %err, "reconnect attempt failed");
                        this.set_state(ConnectionState::Reconnecting);
                    },
                }
            }
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

impl std::fmt::Debug for BrokerPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPublisher")
            .field("channel", &self.channel.channel_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
