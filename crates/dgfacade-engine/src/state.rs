//! Per-execution state capture and the bounded recent-states ring.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dgfacade_core::RequestId;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of one handler execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerPhase {
    /// State allocated, nothing run yet.
    Created,
    /// `construct` in flight.
    Constructing,
    /// Construction done, execution not yet started.
    Started,
    /// `execute` in flight.
    Executing,
    /// `execute_streaming` in flight with a live session.
    Streaming,
    /// Cooperative shutdown in flight.
    Stopping,
    /// Completed normally.
    Stopped,
    /// Handler code failed.
    Failed,
    /// The TTL fired before completion.
    TimedOut,
}

/// Captured state of one handler execution.
///
/// Mutated only by its owning execution unit; everyone else reads
/// snapshots out of the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerState {
    /// The request being executed.
    pub request_id: RequestId,
    /// The request type.
    pub request_type: String,
    /// Current lifecycle phase.
    pub phase: HandlerPhase,
    /// When the execution unit started.
    pub started_at: DateTime<Utc>,
    /// When the execution unit finished, on any path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether the execution succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Captured failure detail (panic payload, foreign stack).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_stack: Option<String>,
    /// JSON snapshot of the final response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_snapshot: Option<serde_json::Value>,
}

impl HandlerState {
    /// Fresh `CREATED` state for a request.
    #[must_use]
    pub fn new(request_id: RequestId, request_type: impl Into<String>) -> Self {
        Self {
            request_id,
            request_type: request_type.into(),
            phase: HandlerPhase::Created,
            started_at: Utc::now(),
            completed_at: None,
            success: None,
            error_message: None,
            exception_stack: None,
            response_snapshot: None,
        }
    }

    /// Whether the execution has reached a terminal phase.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            HandlerPhase::Stopped | HandlerPhase::Failed | HandlerPhase::TimedOut
        )
    }
}

/// Shared handle to one execution's state.
pub type StateHandle = Arc<Mutex<HandlerState>>;

/// Apply a mutation through a state handle.
pub(crate) fn update_state(handle: &StateHandle, mutate: impl FnOnce(&mut HandlerState)) {
    let mut guard = handle
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    mutate(&mut guard);
}

/// Bounded ring of the most recent execution states.
#[derive(Debug)]
pub struct StateRing {
    capacity: usize,
    entries: Mutex<VecDeque<StateHandle>>,
}

impl StateRing {
    /// Create a ring holding up to `capacity` states.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Push a fresh state, evicting the oldest past capacity. Returns the
    /// handle the owning execution unit mutates through.
    pub fn push(&self, state: HandlerState) -> StateHandle {
        let handle: StateHandle = Arc::new(Mutex::new(state));
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.push_back(Arc::clone(&handle));
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        handle
    }

    /// Snapshot of the retained states, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HandlerState> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .map(|handle| {
                handle
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone()
            })
            .collect()
    }

    /// Snapshot of one request's state, if still retained.
    #[must_use]
    pub fn find(&self, request_id: &RequestId) -> Option<HandlerState> {
        self.snapshot()
            .into_iter()
            .rev()
            .find(|state| &state.request_id == request_id)
    }

    /// Number of retained states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_most_recent() {
        let ring = StateRing::new(3);
        for n in 0..5 {
            let _ = ring.push(HandlerState::new(format!("r-{n}").into(), "ECHO"));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].request_id, "r-2".into());
        assert_eq!(snapshot[2].request_id, "r-4".into());
    }

    #[test]
    fn handle_mutations_visible_in_snapshot() {
        let ring = StateRing::new(10);
        let handle = ring.push(HandlerState::new("r-1".into(), "ECHO"));
        update_state(&handle, |state| {
            state.phase = HandlerPhase::Stopped;
            state.success = Some(true);
        });
        let snapshot = ring.find(&"r-1".into()).unwrap();
        assert_eq!(snapshot.phase, HandlerPhase::Stopped);
        assert_eq!(snapshot.success, Some(true));
        assert!(snapshot.is_finished());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let ring = StateRing::new(0);
        let _ = ring.push(HandlerState::new("r-1".into(), "ECHO"));
        assert_eq!(ring.len(), 1);
    }
}
