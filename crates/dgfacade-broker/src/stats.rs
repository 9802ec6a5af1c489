//! Adapter counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live publisher counters.
#[derive(Debug, Default)]
pub(crate) struct PublisherStats {
    pub(crate) published: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) failures: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

impl PublisherStats {
    pub(crate) fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time publisher counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PublisherStatsSnapshot {
    /// Envelopes successfully handed to the broker.
    pub published: u64,
    /// Batch publishes completed.
    pub batches: u64,
    /// Failed publish attempts.
    pub failures: u64,
    /// Successful reconnections.
    pub reconnects: u64,
}

/// Live subscriber counters.
#[derive(Debug, Default)]
pub(crate) struct SubscriberStats {
    pub(crate) received: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) failures: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

impl SubscriberStats {
    pub(crate) fn snapshot(&self, queue_depth: usize) -> SubscriberStatsSnapshot {
        SubscriberStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            queue_depth,
        }
    }
}

/// Point-in-time subscriber counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubscriberStatsSnapshot {
    /// Envelopes pulled from the broker.
    pub received: u64,
    /// Envelopes delivered to listeners.
    pub dispatched: u64,
    /// Poll or dispatch failures.
    pub failures: u64,
    /// Successful reconnections.
    pub reconnects: u64,
    /// Current internal queue depth.
    pub queue_depth: usize,
}
