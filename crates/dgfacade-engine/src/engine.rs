//! The supervised per-request execution unit.
//!
//! Task-per-request: each submission spawns one tokio task owning its
//! handler instance, its ring state handle, and a per-execution
//! cancellation scope. The TTL timer and the stop path signal the same
//! scope; the execution future is raced against it. A panic or failure in
//! handler code transitions the state and completes the future with an
//! error response; it never touches other executions or the engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dgfacade_config::handler::HandlerConfig;
use dgfacade_core::{
    GatewayError, GatewayResult, Request, RequestId, Response, ResponseStatus,
};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::handler::Handler;
use crate::state::{HandlerPhase, HandlerState, StateHandle, update_state};

/// A response that resolves when its execution unit completes (or, for
/// streaming, when the session acknowledgement is ready).
pub struct ResponseFuture {
    inner: ResponseFutureInner,
}

enum ResponseFutureInner {
    Ready(Option<Response>),
    Pending {
        rx: oneshot::Receiver<Response>,
        request_id: RequestId,
    },
}

impl ResponseFuture {
    /// A future that is already complete (forwarded responses).
    #[must_use]
    pub fn ready(response: Response) -> Self {
        Self {
            inner: ResponseFutureInner::Ready(Some(response)),
        }
    }

    fn pending(rx: oneshot::Receiver<Response>, request_id: RequestId) -> Self {
        Self {
            inner: ResponseFutureInner::Pending { rx, request_id },
        }
    }
}

impl Future for ResponseFuture {
    type Output = Response;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            ResponseFutureInner::Ready(slot) => match slot.take() {
                Some(response) => Poll::Ready(response),
                None => Poll::Pending,
            },
            ResponseFutureInner::Pending { rx, request_id } => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(response)) => Poll::Ready(response),
                Poll::Ready(Err(_)) => Poll::Ready(
                    GatewayError::HandlerFailure("execution unit dropped its response".to_owned())
                        .to_response(request_id.clone()),
                ),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture").finish_non_exhaustive()
    }
}

/// Metadata stamped onto every outbound response.
struct Stamp {
    handler_id: String,
    handler_type: String,
}

impl Stamp {
    fn apply(&self, mut response: Response, execute_started: Instant) -> Response {
        response.handler_id = Some(self.handler_id.clone());
        response.handler_type = Some(self.handler_type.clone());
        response.execution_time_ms = Some(
            u64::try_from(execute_started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        response
    }
}

/// The execution engine.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    ctx: Arc<EngineContext>,
}

impl ExecutionEngine {
    /// Create an engine over a wired context.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// The engine context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Executions currently in flight.
    #[must_use]
    pub fn active_count(&self) -> u64 {
        self.ctx.active_count()
    }

    /// Convert a validated request into a supervised execution.
    ///
    /// Allocates the ring entry, resolves the handler class, and spawns
    /// the execution unit. The returned future completes exactly once.
    ///
    /// # Errors
    ///
    /// [`GatewayError::HandlerNotFound`] when the code unit cannot be
    /// resolved (the ring entry is the only state allocated);
    /// [`GatewayError::ConfigError`] for `is_python` entries without an
    /// installed bridge.
    pub fn submit(
        &self,
        mut request: Request,
        config: HandlerConfig,
    ) -> GatewayResult<ResponseFuture> {
        self.ctx.total.fetch_add(1, Ordering::SeqCst);
        let request_id = request.ensure_request_id().clone();
        let state = self
            .ctx
            .ring
            .push(HandlerState::new(request_id.clone(), &request.request_type));

        let handler = if config.is_python {
            match &self.ctx.foreign_bridge {
                Some(bridge) => bridge.instantiate(&config),
                None => Err(GatewayError::ConfigError(format!(
                    "handler {} requires the foreign worker bridge, which is not installed",
                    config.handler_class
                ))),
            }
        } else {
            self.ctx.catalog.instantiate(&config.handler_class)
        };
        let handler = match handler {
            Ok(handler) => handler,
            Err(err) => {
                update_state(&state, |s| {
                    s.phase = HandlerPhase::Failed;
                    s.completed_at = Some(chrono::Utc::now());
                    s.success = Some(false);
                    s.error_message = Some(err.to_string());
                });
                return Err(err);
            },
        };

        let (tx, rx) = oneshot::channel();
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(run_execution(ctx, handler, request, config, state, tx));
        Ok(ResponseFuture::pending(rx, request_id))
    }
}

/// Describes a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}

enum ExecOutcome {
    Finished(std::thread::Result<GatewayResult<Response>>),
    TimedOut,
    Stopped,
}

#[allow(clippy::too_many_lines)]
async fn run_execution(
    ctx: Arc<EngineContext>,
    mut handler: Box<dyn Handler>,
    mut request: Request,
    config: HandlerConfig,
    state: StateHandle,
    tx: oneshot::Sender<Response>,
) {
    ctx.active.fetch_add(1, Ordering::SeqCst);
    let request_id = request
        .request_id
        .clone()
        .unwrap_or_else(RequestId::generate);
    let stamp = Stamp {
        handler_id: format!("{}-{}", config.handler_class, Uuid::new_v4()),
        handler_type: request.request_type.clone(),
    };

    // The TTL countdown starts with construction. Precedence: request
    // override, catalogue entry, handler default, engine default.
    let ttl_minutes = request
        .ttl_minutes
        .or(config.ttl_minutes)
        .or_else(|| handler.default_ttl_minutes())
        .unwrap_or(dgfacade_config::DEFAULT_TTL_MINUTES);
    let ttl = Duration::from_secs(ttl_minutes.saturating_mul(60));
    let grace = Duration::from_secs(ctx.settings.engine.grace_period_seconds);
    let execute_started = Instant::now();
    let construction_deadline = tokio::time::sleep(ttl);
    tokio::pin!(construction_deadline);

    update_state(&state, |s| s.phase = HandlerPhase::Constructing);
    handler.set_channel_accessor(Arc::clone(&ctx.accessor));

    let constructed = tokio::select! {
        result = std::panic::AssertUnwindSafe(handler.construct(&config.config)).catch_unwind() => Some(result),
        () = &mut construction_deadline => None,
    };
    match constructed {
        Some(Ok(Ok(()))) => update_state(&state, |s| s.phase = HandlerPhase::Started),
        None => {
            // TTL fired during construction.
            finish_failed(
                &ctx,
                &state,
                &stamp,
                tx,
                execute_started,
                GatewayError::TtlExceeded { ttl_minutes },
                HandlerPhase::TimedOut,
                None,
            );
            run_cleanup(&mut handler).await;
            ctx.active.fetch_sub(1, Ordering::SeqCst);
            return;
        },
        Some(Ok(Err(err))) => {
            finish_failed(
                &ctx,
                &state,
                &stamp,
                tx,
                execute_started,
                GatewayError::HandlerFailure(format!("construct failed: {err}")),
                HandlerPhase::Failed,
                None,
            );
            run_cleanup(&mut handler).await;
            ctx.active.fetch_sub(1, Ordering::SeqCst);
            return;
        },
        Some(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            finish_failed(
                &ctx,
                &state,
                &stamp,
                tx,
                execute_started,
                GatewayError::HandlerFailure(format!("construct panicked: {message}")),
                HandlerPhase::Failed,
                Some(message),
            );
            run_cleanup(&mut handler).await;
            ctx.active.fetch_sub(1, Ordering::SeqCst);
            return;
        },
    }

    // Remaining TTL after construction.
    let remaining = ttl.saturating_sub(execute_started.elapsed());
    request.execution_started_at = Some(chrono::Utc::now());

    let streaming = request.streaming || handler.is_streaming();
    if streaming {
        run_streaming(
            ctx.clone(),
            &mut handler,
            &request,
            &state,
            &stamp,
            tx,
            execute_started,
            remaining,
            grace,
            ttl_minutes,
        )
        .await;
    } else {
        run_oneshot(
            ctx.clone(),
            &mut handler,
            &request,
            &state,
            &stamp,
            tx,
            execute_started,
            remaining,
            grace,
            ttl_minutes,
        )
        .await;
    }

    run_cleanup(&mut handler).await;
    update_state(&state, |s| {
        if s.completed_at.is_none() {
            s.completed_at = Some(chrono::Utc::now());
        }
    });
    ctx.active.fetch_sub(1, Ordering::SeqCst);
}

#[allow(clippy::too_many_arguments)]
async fn run_oneshot(
    ctx: Arc<EngineContext>,
    handler: &mut Box<dyn Handler>,
    request: &Request,
    state: &StateHandle,
    stamp: &Stamp,
    tx: oneshot::Sender<Response>,
    execute_started: Instant,
    remaining_ttl: Duration,
    grace: Duration,
    ttl_minutes: u64,
) {
    update_state(state, |s| s.phase = HandlerPhase::Executing);
    let cancel = ctx.shutdown.child_token();
    let request_id = request
        .request_id
        .clone()
        .unwrap_or_else(RequestId::generate);

    let exec = std::panic::AssertUnwindSafe(handler.execute(request)).catch_unwind();
    tokio::pin!(exec);

    let outcome = tokio::select! {
        result = &mut exec => ExecOutcome::Finished(result),
        () = tokio::time::sleep(remaining_ttl) => ExecOutcome::TimedOut,
        () = cancel.cancelled() => ExecOutcome::Stopped,
    };

    match outcome {
        ExecOutcome::Finished(Ok(Ok(response))) => {
            let response = stamp.apply(response, execute_started);
            update_state(state, |s| {
                s.phase = HandlerPhase::Stopped;
                s.completed_at = Some(chrono::Utc::now());
                s.success = Some(response.status == ResponseStatus::Success);
                s.response_snapshot = serde_json::to_value(&response).ok();
            });
            let _ = tx.send(response);
        },
        ExecOutcome::Finished(Ok(Err(err))) => {
            finish_failed(
                &ctx,
                state,
                stamp,
                tx,
                execute_started,
                err,
                HandlerPhase::Failed,
                None,
            );
        },
        ExecOutcome::Finished(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            error!(request_id = %request_id, panic = %message, "handler panicked");
            finish_failed(
                &ctx,
                state,
                stamp,
                tx,
                execute_started,
                GatewayError::HandlerFailure(message.clone()),
                HandlerPhase::Failed,
                Some(message),
            );
        },
        interrupted @ (ExecOutcome::TimedOut | ExecOutcome::Stopped) => {
            let timed_out = matches!(interrupted, ExecOutcome::TimedOut);
            update_state(state, |s| s.phase = HandlerPhase::Stopping);
            // Cooperative cancellation: signal, answer the caller, then
            // give the handler a bounded grace to return. Whatever it
            // returns afterwards is discarded.
            handler.stop().await;
            let err = if timed_out {
                GatewayError::TtlExceeded { ttl_minutes }
            } else {
                GatewayError::HandlerFailure("execution stopped".to_owned())
            };
            let phase = if timed_out {
                HandlerPhase::TimedOut
            } else {
                HandlerPhase::Stopped
            };
            finish_failed(&ctx, state, stamp, tx, execute_started, err, phase, None);
            tokio::select! {
                result = &mut exec => {
                    debug!(request_id = %request_id, late = result.is_ok(), "late handler return discarded");
                },
                () = tokio::time::sleep(grace) => {
                    warn!(request_id = %request_id, "handler did not honour stop within grace, tearing down");
                },
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_streaming(
    ctx: Arc<EngineContext>,
    handler: &mut Box<dyn Handler>,
    request: &Request,
    state: &StateHandle,
    stamp: &Stamp,
    tx: oneshot::Sender<Response>,
    execute_started: Instant,
    remaining_ttl: Duration,
    grace: Duration,
    ttl_minutes: u64,
) {
    let request_id = request
        .request_id
        .clone()
        .unwrap_or_else(RequestId::generate);
    let channels = request
        .response_channels
        .clone()
        .filter(|set| !set.is_empty())
        .or_else(|| handler.default_response_channels())
        .unwrap_or_default();
    if channels.is_empty() {
        finish_failed(
            &ctx,
            state,
            stamp,
            tx,
            execute_started,
            GatewayError::InvalidRequest(
                "streaming request requires at least one response channel".to_owned(),
            ),
            HandlerPhase::Failed,
            None,
        );
        return;
    }

    let (session_id, publisher, stop_token) =
        ctx.sessions.create(request, channels.clone(), ttl_minutes);
    update_state(state, |s| s.phase = HandlerPhase::Streaming);

    // Acknowledge the caller immediately; data flows through the session.
    let session = ctx.sessions.get(&session_id);
    let mut ack = Response::streaming_started(request_id.clone(), session_id);
    ack.result = serde_json::json!({
        "session_id": session_id.to_string(),
        "channels": channels,
        "expires_at": session.as_ref().map(|s| s.expires_at),
    });
    let ack = stamp.apply(ack, execute_started);
    update_state(state, |s| {
        s.response_snapshot = serde_json::to_value(&ack).ok();
    });
    let _ = tx.send(ack);

    let exec =
        std::panic::AssertUnwindSafe(handler.execute_streaming(request, publisher)).catch_unwind();
    tokio::pin!(exec);

    let outcome = tokio::select! {
        result = &mut exec => ExecOutcome::Finished(result),
        () = tokio::time::sleep(remaining_ttl) => ExecOutcome::TimedOut,
        () = stop_token.cancelled() => ExecOutcome::Stopped,
        () = ctx.shutdown.cancelled() => ExecOutcome::Stopped,
    };

    let reason = match outcome {
        ExecOutcome::Finished(Ok(Ok(response))) => {
            update_state(state, |s| {
                s.phase = HandlerPhase::Stopped;
                s.success = Some(true);
                s.response_snapshot = serde_json::to_value(stamp.apply(response, execute_started)).ok();
            });
            "completed".to_owned()
        },
        ExecOutcome::Finished(Ok(Err(err))) => {
            update_state(state, |s| {
                s.phase = HandlerPhase::Failed;
                s.success = Some(false);
                s.error_message = Some(err.to_string());
            });
            format!("failed: {err}")
        },
        ExecOutcome::Finished(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            error!(%session_id, panic = %message, "streaming handler panicked");
            update_state(state, |s| {
                s.phase = HandlerPhase::Failed;
                s.success = Some(false);
                s.error_message = Some(message.clone());
                s.exception_stack = Some(message.clone());
            });
            format!("failed: {message}")
        },
        interrupted @ (ExecOutcome::TimedOut | ExecOutcome::Stopped) => {
            let timed_out = matches!(interrupted, ExecOutcome::TimedOut);
            update_state(state, |s| s.phase = HandlerPhase::Stopping);
            // Shutdown order: signal the session, give execute_streaming a
            // bounded grace to drain, then stop().
            stop_token.cancel();
            tokio::select! {
                _ = &mut exec => {},
                () = tokio::time::sleep(grace) => {
                    warn!(%session_id, "streaming handler did not return within grace");
                },
            }
            handler.stop().await;
            update_state(state, |s| {
                s.phase = if timed_out {
                    HandlerPhase::TimedOut
                } else {
                    HandlerPhase::Stopped
                };
                s.success = Some(!timed_out);
            });
            if timed_out {
                "ttl expired".to_owned()
            } else {
                "stopped".to_owned()
            }
        },
    };

    ctx.sessions.finish(session_id, &reason).await;
}

#[allow(clippy::borrowed_box)]
async fn run_cleanup(handler: &mut Box<dyn Handler>) {
    if let Err(payload) = std::panic::AssertUnwindSafe(handler.cleanup())
        .catch_unwind()
        .await
    {
        warn!(panic = %panic_message(&payload), "cleanup panicked");
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_failed(
    _ctx: &Arc<EngineContext>,
    state: &StateHandle,
    stamp: &Stamp,
    tx: oneshot::Sender<Response>,
    execute_started: Instant,
    err: GatewayError,
    phase: HandlerPhase,
    exception_stack: Option<String>,
) {
    let request_id = {
        let guard = state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.request_id.clone()
    };
    let response = stamp.apply(err.to_response(request_id), execute_started);
    update_state(state, |s| {
        s.phase = phase;
        s.completed_at = Some(chrono::Utc::now());
        s.success = Some(false);
        s.error_message = Some(err.to_string());
        if exception_stack.is_some() {
            s.exception_stack = exception_stack.clone();
        }
        s.response_snapshot = serde_json::to_value(&response).ok();
    });
    let _ = tx.send(response);
}
