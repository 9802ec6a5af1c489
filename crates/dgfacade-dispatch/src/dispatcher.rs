//! The dispatch pipeline.
//!
//! Per inbound request: validate (assigning identity when absent),
//! authenticate, resolve the handler configuration for the type and user,
//! route across the cluster when this node does not execute (or is
//! shedding load), and hand off to the execution engine.

use std::sync::Arc;

use dgfacade_config::ConfigStore;
use dgfacade_engine::{ExecutionEngine, ResponseFuture};
use dgfacade_core::{GatewayError, GatewayResult, Request, Response};
use tracing::{debug, warn};

use crate::auth::AuthService;
use crate::cluster::ClusterService;

/// The front door of the core: every ingress channel submits through here.
pub struct Dispatcher {
    store: Arc<ConfigStore>,
    engine: ExecutionEngine,
    auth: AuthService,
    cluster: Option<Arc<ClusterService>>,
}

impl Dispatcher {
    /// Create a dispatcher over the config store and engine.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, engine: ExecutionEngine) -> Self {
        let auth = AuthService::new(Arc::clone(&store));
        Self {
            store,
            engine,
            auth,
            cluster: None,
        }
    }

    /// Attach the cluster service for forwarding.
    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<ClusterService>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// The execution engine behind this dispatcher.
    #[must_use]
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Whether this node should hand the request to a peer: its role
    /// excludes execution, or the load-shedding threshold is exceeded.
    fn should_forward(&self) -> bool {
        let Some(cluster) = &self.cluster else {
            return false;
        };
        if !cluster.is_clustered() {
            return false;
        }
        if !self.store.settings().node.role.executes() {
            return true;
        }
        self.store
            .settings()
            .engine
            .max_active_handlers
            .is_some_and(|limit| self.engine.active_count() >= limit)
    }

    /// Run the pipeline and return the execution's response future.
    ///
    /// # Errors
    ///
    /// `INVALID_REQUEST`, `AUTH_FAILED`, and `HANDLER_NOT_FOUND` per the
    /// pipeline stages; engine submission errors pass through.
    pub async fn dispatch(&self, mut request: Request) -> GatewayResult<ResponseFuture> {
        request.request_type = request.request_type.trim().to_ascii_uppercase();
        request.validate()?;
        let request_id = request.ensure_request_id().clone();

        self.auth.authenticate(&mut request)?;

        let config = self
            .store
            .handlers()
            .resolve(&request.request_type, request.user_id.as_deref())
            .ok_or_else(|| GatewayError::HandlerNotFound {
                request_type: request.request_type.clone(),
            })?;

        if self.should_forward()
            && let Some(cluster) = &self.cluster
        {
            if let Some(peer) = cluster.pick_executor() {
                match cluster.forward(&request, &peer).await {
                    Ok(response) => {
                        debug!(request_id = %request_id, peer = %peer.node_id, "executed remotely");
                        return Ok(ResponseFuture::ready(response));
                    },
                    Err(err) => {
                        // Forward failure falls back to local execution.
                        warn!(request_id = %request_id, peer = %peer.node_id, error = %err, "forward failed, executing locally");
                    },
                }
            } else {
                debug!(request_id = %request_id, "no executor peer available, executing locally");
            }
        }

        let future = self.engine.submit(request, config)?;
        if let Some(cluster) = &self.cluster {
            cluster.update_load(
                self.engine.active_count(),
                self.engine.context().total_count(),
            );
        }
        Ok(future)
    }

    /// Run the pipeline and wait for the response, converting pipeline
    /// errors into error responses.
    pub async fn dispatch_and_wait(&self, mut request: Request) -> Response {
        let request_id = request.ensure_request_id().clone();
        match self.dispatch(request).await {
            Ok(future) => future.await,
            Err(err) => err.to_response(request_id),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("clustered", &self.cluster.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgfacade_core::{ResponseChannel, ResponseStatus};
    use dgfacade_engine::EngineContext;
    use dgfacade_engine::builtin::register_builtins;

    fn seed_store() -> Arc<ConfigStore> {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("handlers")).unwrap();
        std::fs::write(
            root.join("gateway.json"),
            r#"{
                "auth": {"public_request_types": ["ECHO"]},
                "engine": {"grace_period_seconds": 1}
            }"#,
        )
        .unwrap();
        std::fs::write(
            root.join("users.json"),
            r#"{"alice": {"enabled": true}}"#,
        )
        .unwrap();
        std::fs::write(
            root.join("apikeys.json"),
            r#"{"dgf-alice": {"user": "alice"}}"#,
        )
        .unwrap();
        std::fs::write(
            root.join("handlers/default.json"),
            r#"{
                "ECHO": {"handler_class": "builtin.echo"},
                "ARITHMETIC": {"handler_class": "builtin.arithmetic"},
                "MARKET_DATA": {"handler_class": "builtin.market_data"},
                "DISABLED": {"handler_class": "builtin.echo", "enabled": false}
            }"#,
        )
        .unwrap();
        std::fs::write(
            root.join("handlers/alice.json"),
            r#"{"ARITHMETIC": {"handler_class": "builtin.echo", "description": "alice override"}}"#,
        )
        .unwrap();
        let store = Arc::new(ConfigStore::open(root).unwrap());
        std::mem::forget(tmp);
        store
    }

    fn dispatcher() -> Dispatcher {
        let store = seed_store();
        let ctx = EngineContext::new(Arc::clone(&store), None);
        register_builtins(&ctx.catalog);
        Dispatcher::new(store, ExecutionEngine::new(ctx))
    }

    #[tokio::test]
    async fn public_request_dispatches_anonymously() {
        let dispatcher = dispatcher();
        let request =
            Request::new("echo").with_payload(serde_json::json!({"message": "hi"}));
        // Type normalization upper-cases before resolution.
        let response = dispatcher.dispatch_and_wait(request).await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.result["echo"]["message"], "hi");
    }

    #[tokio::test]
    async fn missing_credential_is_auth_failed() {
        let dispatcher = dispatcher();
        let request = Request::new("ARITHMETIC");
        let response = dispatcher.dispatch_and_wait(request).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.result["error_kind"], "AUTH_FAILED");
    }

    #[tokio::test]
    async fn per_user_catalogue_overrides_default() {
        let dispatcher = dispatcher();
        let mut request =
            Request::new("ARITHMETIC").with_payload(serde_json::json!({"message": "m"}));
        request.api_key = Some("dgf-alice".to_owned());
        let response = dispatcher.dispatch_and_wait(request).await;
        // Alice's catalogue maps ARITHMETIC onto the echo class.
        assert_eq!(response.status, ResponseStatus::Success);
        assert!(response.result.get("echo").is_some());
    }

    #[tokio::test]
    async fn unknown_or_disabled_types_are_handler_not_found() {
        let dispatcher = dispatcher();

        let mut request = Request::new("NO_SUCH_TYPE");
        request.api_key = Some("dgf-alice".to_owned());
        let response = dispatcher.dispatch_and_wait(request).await;
        assert_eq!(response.result["error_kind"], "HANDLER_NOT_FOUND");

        let mut request = Request::new("DISABLED");
        request.api_key = Some("dgf-alice".to_owned());
        let response = dispatcher.dispatch_and_wait(request).await;
        assert_eq!(response.result["error_kind"], "HANDLER_NOT_FOUND");
    }

    #[tokio::test]
    async fn streaming_without_channels_rejected_at_dispatch() {
        let dispatcher = dispatcher();
        let mut request = Request::new("MARKET_DATA");
        request.streaming = true;
        request.api_key = Some("dgf-alice".to_owned());
        let response = dispatcher.dispatch_and_wait(request).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.result["error_kind"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn streaming_dispatch_acknowledges_session() {
        let dispatcher = dispatcher();
        let mut request = Request::new("MARKET_DATA")
            .with_payload(serde_json::json!({"interval_ms": 10}))
            .with_streaming([ResponseChannel::Rest]);
        request.api_key = Some("dgf-alice".to_owned());

        let ack = dispatcher.dispatch_and_wait(request).await;
        assert_eq!(ack.status, ResponseStatus::StreamingStarted);
        let session_id = ack.session_id.unwrap();
        assert!(
            dispatcher
                .engine()
                .context()
                .sessions
                .request_stop(&session_id)
        );
    }
}
