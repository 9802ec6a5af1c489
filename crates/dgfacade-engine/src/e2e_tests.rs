//! End-to-end engine scenarios against the built-in catalogue.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dgfacade_config::ConfigStore;
use dgfacade_config::handler::HandlerConfig;
use dgfacade_core::{
    GatewayError, GatewayResult, Request, Response, ResponseChannel, ResponseStatus,
};

use crate::builtin::register_builtins;
use crate::context::EngineContext;
use crate::engine::ExecutionEngine;
use crate::fanout::{BroadcastGate, StreamGate};
use crate::handler::Handler;
use crate::state::HandlerPhase;

fn test_store(ring_capacity: usize) -> Arc<ConfigStore> {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("gateway.json"),
        format!(
            r#"{{
                "engine": {{"recent_states_capacity": {ring_capacity}, "grace_period_seconds": 1}},
                "streaming": {{"channel_queue_capacity": 64}}
            }}"#
        ),
    )
    .unwrap();
    let store = Arc::new(ConfigStore::open(tmp.path()).unwrap());
    std::mem::forget(tmp);
    store
}

fn engine_with_gate(ring_capacity: usize) -> (ExecutionEngine, Arc<BroadcastGate>) {
    let gate = Arc::new(BroadcastGate::new(256));
    let ctx = EngineContext::new(
        test_store(ring_capacity),
        Some(Arc::clone(&gate) as Arc<dyn StreamGate>),
    );
    register_builtins(&ctx.catalog);
    (ExecutionEngine::new(ctx), gate)
}

fn config_for(handler_class: &str) -> HandlerConfig {
    serde_json::from_value(serde_json::json!({ "handler_class": handler_class })).unwrap()
}

fn request(request_type: &str, payload: serde_json::Value) -> Request {
    Request::new(request_type).with_payload(payload)
}

#[tokio::test]
async fn arithmetic_add_end_to_end() {
    let (engine, _gate) = engine_with_gate(100);
    let response = engine
        .submit(
            request(
                "ARITHMETIC",
                serde_json::json!({"operation": "ADD", "operands": [7, 6]}),
            ),
            config_for("builtin.arithmetic"),
        )
        .unwrap()
        .await;

    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.result["result"], 13.0);
    assert_eq!(response.handler_type.as_deref(), Some("ARITHMETIC"));
    assert!(response.handler_id.is_some());
    assert!(response.execution_time_ms.is_some());

    let state = engine.context().ring.snapshot().pop().unwrap();
    assert_eq!(state.phase, HandlerPhase::Stopped);
    assert_eq!(state.success, Some(true));
    assert!(state.response_snapshot.is_some());
}

#[tokio::test]
async fn division_by_zero_is_error_response() {
    let (engine, _gate) = engine_with_gate(100);
    let response = engine
        .submit(
            request(
                "ARITHMETIC",
                serde_json::json!({"operation": "DIVIDE", "operands": [10, 0]}),
            ),
            config_for("builtin.arithmetic"),
        )
        .unwrap()
        .await;

    assert_eq!(response.status, ResponseStatus::Error);
    assert!(
        response
            .message
            .as_deref()
            .is_some_and(|m| m.contains("Division by zero"))
    );
    let state = engine.context().ring.snapshot().pop().unwrap();
    assert_eq!(state.phase, HandlerPhase::Failed);
}

#[tokio::test]
async fn echo_reflects_request_id() {
    let (engine, _gate) = engine_with_gate(100);
    let mut req = request("ECHO", serde_json::json!({"message": "Hello"}));
    let id = req.ensure_request_id().clone();
    let response = engine
        .submit(req, config_for("builtin.echo"))
        .unwrap()
        .await;

    assert_eq!(response.result["echo"]["message"], "Hello");
    assert_eq!(response.result["echo_request_id"], serde_json::json!(id));
    assert_eq!(response.request_id, id);
}

#[tokio::test]
async fn unresolvable_class_fails_at_submit() {
    let (engine, _gate) = engine_with_gate(100);
    let err = engine
        .submit(request("GHOST", serde_json::Value::Null), config_for("no.such.class"))
        .unwrap_err();
    assert!(matches!(err, GatewayError::HandlerNotFound { .. }));

    // The ring entry is the only allocated state, marked failed.
    let state = engine.context().ring.snapshot().pop().unwrap();
    assert_eq!(state.phase, HandlerPhase::Failed);
}

#[tokio::test]
async fn python_without_bridge_is_config_error() {
    let (engine, _gate) = engine_with_gate(100);
    let config: HandlerConfig = serde_json::from_value(serde_json::json!({
        "handler_class": "models.Pricer",
        "is_python": true
    }))
    .unwrap();
    let err = engine
        .submit(request("PRICER", serde_json::Value::Null), config)
        .unwrap_err();
    assert!(matches!(err, GatewayError::ConfigError(_)));
}

/// Probe handler counting lifecycle calls.
struct ProbeHandler {
    cleanups: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    sleep: Duration,
}

#[async_trait]
impl Handler for ProbeHandler {
    async fn execute(&self, request: &Request) -> GatewayResult<Response> {
        tokio::time::sleep(self.sleep).await;
        Ok(Response::success(
            request.request_id.clone().unwrap(),
            serde_json::Value::Null,
        ))
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn ttl_expiry_completes_with_timeout_and_one_cleanup() {
    let (engine, _gate) = engine_with_gate(100);
    let cleanups = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    {
        let cleanups = Arc::clone(&cleanups);
        let stops = Arc::clone(&stops);
        engine.context().catalog.register("probe.slow", move || {
            Box::new(ProbeHandler {
                cleanups: Arc::clone(&cleanups),
                stops: Arc::clone(&stops),
                sleep: Duration::from_secs(120),
            })
        });
    }

    // A zero-minute TTL expires immediately; the handler never finishes.
    let mut req = request("SLOW", serde_json::Value::Null);
    req.ttl_minutes = Some(0);
    let started = std::time::Instant::now();
    let response = engine.submit(req, config_for("probe.slow")).unwrap().await;

    assert_eq!(response.status, ResponseStatus::Timeout);
    assert!(started.elapsed() < Duration::from_secs(30));

    // cleanup exactly once, on the timeout path too.
    for _ in 0..100 {
        if cleanups.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    let state = engine.context().ring.snapshot().pop().unwrap();
    assert_eq!(state.phase, HandlerPhase::TimedOut);
}

#[tokio::test]
async fn panicking_handler_does_not_poison_the_engine() {
    struct PanickingHandler;
    #[async_trait]
    impl Handler for PanickingHandler {
        async fn execute(&self, _request: &Request) -> GatewayResult<Response> {
            panic!("boom in handler code");
        }
    }

    let (engine, _gate) = engine_with_gate(100);
    engine
        .context()
        .catalog
        .register("probe.panic", || Box::new(PanickingHandler));

    let response = engine
        .submit(request("PANIC", serde_json::Value::Null), config_for("probe.panic"))
        .unwrap()
        .await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert!(
        response
            .message
            .as_deref()
            .is_some_and(|m| m.contains("boom"))
    );

    // The engine keeps serving.
    let response = engine
        .submit(
            request("ECHO", serde_json::json!({"message": "still alive"})),
            config_for("builtin.echo"),
        )
        .unwrap()
        .await;
    assert_eq!(response.status, ResponseStatus::Success);

    let state = engine
        .context()
        .ring
        .snapshot()
        .into_iter()
        .find(|s| s.request_type == "PANIC")
        .unwrap();
    assert_eq!(state.phase, HandlerPhase::Failed);
    assert!(state.exception_stack.is_some());
}

#[tokio::test]
async fn concurrent_submissions_all_complete_and_ring_keeps_recent() {
    let (engine, _gate) = engine_with_gate(50);
    let mut futures = Vec::new();
    for n in 0..1_000 {
        let future = engine
            .submit(
                request("ECHO", serde_json::json!({"n": n})),
                config_for("builtin.echo"),
            )
            .unwrap();
        futures.push(future);
    }
    let responses = futures::future::join_all(futures).await;
    assert_eq!(responses.len(), 1_000);
    assert!(
        responses
            .iter()
            .all(|r| r.status == ResponseStatus::Success)
    );
    // The ring reflects the most recent N only.
    assert_eq!(engine.context().ring.len(), 50);
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test]
async fn streaming_session_fans_out_and_ends_exactly_once() {
    let (engine, gate) = engine_with_gate(100);
    let mut frames = gate.subscribe();

    let mut req = request(
        "MARKET_DATA",
        serde_json::json!({"symbols": ["DGF"], "interval_ms": 10}),
    )
    .with_streaming([ResponseChannel::Websocket, ResponseChannel::Rest]);
    req.ttl_minutes = Some(1);

    let ack = engine
        .submit(req, config_for("builtin.market_data"))
        .unwrap()
        .await;
    assert_eq!(ack.status, ResponseStatus::StreamingStarted);
    let session_id = ack.session_id.unwrap();
    assert_eq!(
        ack.result["channels"],
        serde_json::json!(BTreeSet::from([
            ResponseChannel::Websocket,
            ResponseChannel::Rest
        ]))
    );

    // Let a few ticks flow, then stop the session explicitly.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.context().sessions.request_stop(&session_id));

    // Session removal is synchronized with unit termination.
    for _ in 0..100 {
        if engine.context().sessions.get(&session_id).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(engine.context().sessions.get(&session_id).is_none());

    // WebSocket side: data frames with increasing sequence, one ENDED last.
    let mut sequences = Vec::new();
    let mut ended = 0;
    while let Ok(frame) = frames.try_recv() {
        assert_eq!(frame.destination, format!("/stream/{session_id}"));
        match frame.response.status {
            ResponseStatus::StreamingData => sequences.push(frame.response.sequence.unwrap()),
            ResponseStatus::StreamingEnded => ended += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(!sequences.is_empty());
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(ended, 1);

    // REST side: same sequence of data frames, then the same single ENDED.
    let rest = engine.context().sessions.snapshot();
    assert!(rest.is_empty());
}
