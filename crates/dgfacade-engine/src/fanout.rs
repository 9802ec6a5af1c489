//! Multi-channel fan-out of streaming responses.
//!
//! Each produced response is delivered once per channel in the session's
//! set. A channel missing or failing at delivery time is logged and
//! skipped; it never aborts delivery to other channels and never fails
//! the session.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dgfacade_core::{
    GatewayError, GatewayResult, MessageEnvelope, Response, ResponseChannel, SessionId,
};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::accessor::ChannelAccessor;

/// One frame on its way to the WebSocket layer.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    /// Gateway destination (`/<prefix>/<session_id>`).
    pub destination: String,
    /// The streamed response.
    pub response: Response,
}

/// Delivery surface for the WebSocket gateway, which lives outside the
/// core. The in-process [`BroadcastGate`] is the default wiring; an
/// external transport subscribes to it.
#[async_trait]
pub trait StreamGate: Send + Sync {
    /// Deliver one response to a gateway destination.
    async fn deliver(&self, destination: &str, response: &Response) -> GatewayResult<()>;
}

/// In-process stream gate over a broadcast channel.
#[derive(Debug)]
pub struct BroadcastGate {
    sender: broadcast::Sender<StreamFrame>,
}

impl BroadcastGate {
    /// Create a gate with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every frame passing the gate.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamFrame> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl StreamGate for BroadcastGate {
    async fn deliver(&self, destination: &str, response: &Response) -> GatewayResult<()> {
        let frame = StreamFrame {
            destination: destination.to_owned(),
            response: response.clone(),
        };
        // No receivers is fine; the frame simply has no audience yet.
        let _ = self.sender.send(frame);
        Ok(())
    }
}

/// Bounded per-session buffers backing the REST pull endpoint.
#[derive(Debug)]
pub struct RestBuffer {
    capacity: usize,
    sessions: DashMap<SessionId, std::sync::Mutex<VecDeque<Response>>>,
}

impl RestBuffer {
    /// Create a buffer store with the given per-session capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: DashMap::new(),
        }
    }

    /// Append a response, evicting the oldest past capacity.
    pub fn push(&self, session_id: SessionId, response: Response) {
        let entry = self
            .sessions
            .entry(session_id)
            .or_insert_with(|| std::sync::Mutex::new(VecDeque::new()));
        let mut buffer = entry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buffer.push_back(response);
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
    }

    /// Drain the buffered responses for a session.
    #[must_use]
    pub fn drain(&self, session_id: &SessionId) -> Vec<Response> {
        self.sessions
            .get(session_id)
            .map(|entry| {
                entry
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .drain(..)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop a session's buffer entirely.
    pub fn remove(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }
}

/// Routes one response to one channel of a session.
pub struct FanoutPublisher {
    accessor: Arc<ChannelAccessor>,
    gate: Option<Arc<dyn StreamGate>>,
    rest: Arc<RestBuffer>,
    stream_prefix: String,
    output_channels: HashMap<ResponseChannel, String>,
}

impl FanoutPublisher {
    /// Create a fan-out publisher.
    #[must_use]
    pub fn new(
        accessor: Arc<ChannelAccessor>,
        gate: Option<Arc<dyn StreamGate>>,
        rest: Arc<RestBuffer>,
        stream_prefix: impl Into<String>,
        output_channels: HashMap<ResponseChannel, String>,
    ) -> Self {
        Self {
            accessor,
            gate,
            rest,
            stream_prefix: stream_prefix.into(),
            output_channels,
        }
    }

    /// The REST pull buffers.
    #[must_use]
    pub fn rest_buffer(&self) -> &Arc<RestBuffer> {
        &self.rest
    }

    /// The WebSocket destination prefix.
    #[must_use]
    pub fn stream_prefix(&self) -> &str {
        &self.stream_prefix
    }

    /// Deliver one response on one channel. Failures are logged and
    /// reported as `false`; they never propagate.
    pub async fn deliver(
        &self,
        channel: ResponseChannel,
        session_id: SessionId,
        response_topic: Option<&str>,
        response: &Response,
    ) -> bool {
        match self.try_deliver(channel, session_id, response_topic, response).await {
            Ok(()) => {
                trace!(%session_id, channel = %channel, "fan-out delivered");
                true
            },
            Err(err) => {
                // Skipped channel; the session and the other channels
                // continue.
                warn!(%session_id, channel = %channel, error = %err, "fan-out channel skipped");
                false
            },
        }
    }

    async fn try_deliver(
        &self,
        channel: ResponseChannel,
        session_id: SessionId,
        response_topic: Option<&str>,
        response: &Response,
    ) -> GatewayResult<()> {
        match channel {
            ResponseChannel::Websocket => {
                let Some(gate) = &self.gate else {
                    return Err(GatewayError::ConfigError(
                        "no websocket gate installed".to_owned(),
                    ));
                };
                let destination = format!("/{}/{}", self.stream_prefix, session_id);
                gate.deliver(&destination, response).await
            },
            ResponseChannel::Rest => {
                self.rest.push(session_id, response.clone());
                Ok(())
            },
            broker_channel => {
                let Some(channel_id) = self.output_channels.get(&broker_channel) else {
                    return Err(GatewayError::ConfigError(format!(
                        "no output channel mapped for {broker_channel}"
                    )));
                };
                let Some(topic) = response_topic else {
                    return Err(GatewayError::InvalidRequest(
                        "session has no response_topic".to_owned(),
                    ));
                };
                let publisher = self.accessor.publisher(channel_id).await?;
                let envelope = MessageEnvelope::new(topic, serde_json::to_string(response)?)
                    .with_header("session_id", session_id.to_string())
                    .with_header(
                        "sequence",
                        response
                            .sequence
                            .map(|s| s.to_string())
                            .unwrap_or_default(),
                    );
                publisher.publish(topic, &envelope).await?;
                Ok(())
            },
        }
    }
}

impl std::fmt::Debug for FanoutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutPublisher")
            .field("stream_prefix", &self.stream_prefix)
            .field("output_channels", &self.output_channels)
            .finish_non_exhaustive()
    }
}
