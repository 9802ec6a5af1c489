//! Streaming session bookkeeping and the injected publisher callback.
//!
//! A session exists exactly as long as its owning execution unit is alive;
//! the unit drives creation and removal. The injected [`StreamPublisher`]
//! holds only the session id and a weak manager reference, so the
//! session ↔ handler ↔ publisher triangle never forms a strong cycle.
//! Each channel in the session's set gets its own delivery task and
//! bounded queue; a slow channel delays nobody else.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use dgfacade_core::{
    GatewayError, GatewayResult, Request, RequestId, Response, ResponseChannel, ResponseStatus,
    SessionId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fanout::FanoutPublisher;

/// Lifecycle status of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Producing and fanning out data.
    Active,
    /// Shutdown signalled; draining.
    Stopping,
    /// Terminated and about to be removed.
    Ended,
}

/// The stateful context of one streaming handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSession {
    /// Session identity.
    pub session_id: SessionId,
    /// The owning request.
    pub request_id: RequestId,
    /// The owning request type.
    pub request_type: String,
    /// Channels the session fans out to.
    pub response_channels: BTreeSet<ResponseChannel>,
    /// Destination topic for broker channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_topic: Option<String>,
    /// Session TTL.
    pub ttl_minutes: u64,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// `started_at + ttl_minutes`.
    pub expires_at: DateTime<Utc>,
    /// Responses published through the callback so far.
    pub messages_published: u64,
    /// Credential-derived user that owns the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

struct SessionEntry {
    info: std::sync::Mutex<StreamingSession>,
    sequence: AtomicU64,
    published: AtomicU64,
    stop: CancellationToken,
    channels: std::sync::Mutex<Vec<(ResponseChannel, mpsc::Sender<Response>)>>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SessionEntry {
    fn senders(&self) -> Vec<(ResponseChannel, mpsc::Sender<Response>)> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SessionEntry {
    fn snapshot(&self) -> StreamingSession {
        let mut session = self
            .info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        session.messages_published = self.published.load(Ordering::Relaxed);
        session
    }
}

/// Owns every live streaming session.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    fanout: Arc<FanoutPublisher>,
    channel_queue_capacity: usize,
}

impl SessionManager {
    /// Create a manager delivering through the given fan-out publisher.
    #[must_use]
    pub fn new(fanout: Arc<FanoutPublisher>, channel_queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            fanout,
            channel_queue_capacity: channel_queue_capacity.max(1),
        })
    }

    /// Register a session for an execution unit and build its publisher
    /// callback. One delivery task per channel starts immediately.
    pub(crate) fn create(
        self: &Arc<Self>,
        request: &Request,
        channels: BTreeSet<ResponseChannel>,
        ttl_minutes: u64,
    ) -> (SessionId, StreamPublisher, CancellationToken) {
        let session_id = SessionId::new();
        let started_at = Utc::now();
        let expires_at = i64::try_from(ttl_minutes)
            .ok()
            .and_then(ChronoDuration::try_minutes)
            .and_then(|ttl| started_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let session = StreamingSession {
            session_id,
            request_id: request
                .request_id
                .clone()
                .unwrap_or_else(RequestId::generate),
            request_type: request.request_type.clone(),
            response_channels: channels.clone(),
            response_topic: request.response_topic.clone(),
            ttl_minutes,
            status: SessionStatus::Active,
            started_at,
            expires_at,
            messages_published: 0,
            user_id: request.user_id.clone(),
        };

        let stop = CancellationToken::new();
        let mut senders = Vec::with_capacity(channels.len());
        let mut tasks = Vec::with_capacity(channels.len());
        for channel in channels {
            let (tx, mut rx) = mpsc::channel::<Response>(self.channel_queue_capacity);
            let fanout = Arc::clone(&self.fanout);
            let topic = session.response_topic.clone();
            let task = tokio::spawn(async move {
                while let Some(response) = rx.recv().await {
                    let _ = fanout
                        .deliver(channel, session_id, topic.as_deref(), &response)
                        .await;
                }
            });
            senders.push((channel, tx));
            tasks.push(task);
        }

        let entry = Arc::new(SessionEntry {
            info: std::sync::Mutex::new(session),
            sequence: AtomicU64::new(0),
            published: AtomicU64::new(0),
            stop: stop.clone(),
            channels: std::sync::Mutex::new(senders),
            tasks: std::sync::Mutex::new(tasks),
        });
        self.sessions.insert(session_id, entry);
        info!(%session_id, request_type = %request.request_type, "streaming session registered");

        let publisher = StreamPublisher {
            session_id,
            manager: Arc::downgrade(self),
        };
        (session_id, publisher, stop)
    }

    /// Snapshot of one session.
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<StreamingSession> {
        self.sessions.get(session_id).map(|entry| entry.snapshot())
    }

    /// Snapshot of every live session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StreamingSession> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Signal a session to shut down. The owning execution unit observes
    /// the signal and drives the actual teardown. Returns false for an
    /// unknown session.
    pub fn request_stop(&self, session_id: &SessionId) -> bool {
        match self.sessions.get(session_id) {
            Some(entry) => {
                let mut info = entry
                    .info
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                info.status = SessionStatus::Stopping;
                drop(info);
                entry.stop.cancel();
                debug!(%session_id, "session stop requested");
                true
            },
            None => false,
        }
    }

    /// Publish the final `STREAMING_ENDED` response on every channel and
    /// remove the session. Called by the owning execution unit as the last
    /// step of teardown, so removal is synchronized with unit termination.
    ///
    /// The final response rides the same per-channel queues as the data
    /// frames, so each channel sees it after everything already enqueued.
    pub(crate) async fn finish(&self, session_id: SessionId, reason: &str) {
        let Some(entry) = self
            .sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        let session = entry.snapshot();
        let mut ended = Response::streaming_ended(session.request_id.clone(), session_id, reason);
        ended.handler_type = Some(session.request_type.clone());
        ended.result = serde_json::json!({
            "session_id": session_id.to_string(),
            "messages_published": session.messages_published,
        });

        let senders: Vec<_> = {
            let mut guard = entry
                .channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for (channel, tx) in senders {
            if tx.send(ended.clone()).await.is_err() {
                warn!(%session_id, channel = %channel, "final response skipped");
            }
            // Sender dropped here; the delivery task drains and exits.
        }
        {
            let mut info = entry
                .info
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            info.status = SessionStatus::Ended;
        }
        let tasks: Vec<_> = {
            let mut guard = entry
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        drop(entry);
        for task in tasks {
            let _ = task.await;
        }
        // Removal last: once the session is gone, the final response has
        // already reached every channel.
        self.sessions.remove(&session_id);
        info!(%session_id, reason, "streaming session removed");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

/// The callback injected into a streaming handler.
///
/// Holds only the session id and a weak manager reference; the manager
/// owns the session object exclusively.
#[derive(Clone)]
pub struct StreamPublisher {
    session_id: SessionId,
    manager: Weak<SessionManager>,
}

impl StreamPublisher {
    /// The owning session.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether shutdown has been requested for the session.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.manager
            .upgrade()
            .and_then(|manager| {
                manager
                    .sessions
                    .get(&self.session_id)
                    .map(|entry| entry.stop.is_cancelled())
            })
            .unwrap_or(true)
    }

    /// Wait until shutdown is requested for the session.
    pub async fn stopped(&self) {
        let token = self.manager.upgrade().and_then(|manager| {
            manager
                .sessions
                .get(&self.session_id)
                .map(|entry| entry.stop.clone())
        });
        match token {
            Some(token) => token.cancelled().await,
            None => {},
        }
    }

    /// Enqueue a response for fan-out to every session channel.
    ///
    /// The response is stamped `STREAMING_DATA` with the session id and
    /// the next sequence number. Returns the sequence number.
    ///
    /// # Errors
    ///
    /// [`GatewayError::HandlerFailure`] once the session is gone; handlers
    /// treat that as the signal to return.
    pub async fn publish(&self, mut response: Response) -> GatewayResult<u64> {
        let Some(manager) = self.manager.upgrade() else {
            return Err(GatewayError::HandlerFailure(
                "session manager shut down".to_owned(),
            ));
        };
        let Some(entry) = manager
            .sessions
            .get(&self.session_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return Err(GatewayError::HandlerFailure(format!(
                "streaming session {} is closed",
                self.session_id
            )));
        };

        let sequence = entry.sequence.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        response.status = ResponseStatus::StreamingData;
        response.session_id = Some(self.session_id);
        response.sequence = Some(sequence);
        response.timestamp = Utc::now();
        entry.published.fetch_add(1, Ordering::Relaxed);

        for (channel, tx) in entry.senders() {
            // Independent per-channel queues: a saturated channel is
            // skipped for this response, the others still receive it.
            match tx.try_send(response.clone()) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %self.session_id, channel = %channel, sequence, "channel queue full, response skipped");
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {},
            }
        }
        Ok(sequence)
    }
}

impl std::fmt::Debug for StreamPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPublisher")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
