//! The uniform handler contract and the class catalog.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dgfacade_core::{GatewayError, GatewayResult, Request, Response, ResponseChannel};
use tracing::debug;

use crate::accessor::ChannelAccessor;
use crate::adapter::{DynamicAdapter, Foreign};
use crate::session::StreamPublisher;

/// A code unit that processes one request and produces one (or, for
/// streaming, many) responses.
///
/// One-shot handlers override [`execute`](Self::execute); long-lived
/// streaming handlers override [`execute_streaming`](Self::execute_streaming)
/// and report `is_streaming`. `stop` is the cooperative cancellation
/// signal: it is invoked from a different task than the execute call and
/// must be idempotent. `cleanup` runs exactly once on every exit path.
#[async_trait]
pub trait Handler: Send + Sync {
    /// One-time setup with the catalogue entry's `config` map.
    async fn construct(
        &mut self,
        config: &serde_json::Map<String, serde_json::Value>,
    ) -> GatewayResult<()> {
        let _ = config;
        Ok(())
    }

    /// Process one request to completion.
    async fn execute(&self, request: &Request) -> GatewayResult<Response> {
        let _ = request;
        Err(GatewayError::HandlerFailure(
            "handler does not implement execute".to_owned(),
        ))
    }

    /// Run a streaming session, publishing incremental responses through
    /// the injected publisher, and return the final response.
    async fn execute_streaming(
        &self,
        request: &Request,
        publisher: StreamPublisher,
    ) -> GatewayResult<Response> {
        let _ = (request, publisher);
        Err(GatewayError::HandlerFailure(
            "handler does not implement execute_streaming".to_owned(),
        ))
    }

    /// Cooperative cancellation signal; idempotent.
    async fn stop(&self) {}

    /// Resource release; idempotent, always invoked.
    async fn cleanup(&mut self) {}

    /// Whether this handler runs streaming sessions.
    fn is_streaming(&self) -> bool {
        false
    }

    /// Handler-declared TTL default, below the config entry's.
    fn default_ttl_minutes(&self) -> Option<u64> {
        None
    }

    /// Handler-declared response channels for streaming requests that
    /// name none.
    fn default_response_channels(&self) -> Option<BTreeSet<ResponseChannel>> {
        None
    }

    /// Dependency injection point for channel access.
    fn set_channel_accessor(&mut self, accessor: Arc<ChannelAccessor>) {
        let _ = accessor;
    }
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Handler")
    }
}

type NativeFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;
type ForeignFactory = Arc<dyn Fn() -> Box<dyn Foreign> + Send + Sync>;

#[derive(Clone)]
enum HandlerFactory {
    Native(NativeFactory),
    Foreign(ForeignFactory),
}

/// Registry of handler classes, keyed by the `handler_class` identifier
/// from the handler catalogues.
#[derive(Default)]
pub struct HandlerCatalog {
    factories: DashMap<String, HandlerFactory>,
}

impl HandlerCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native handler class.
    pub fn register<F>(&self, handler_class: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
    {
        let handler_class = handler_class.into();
        debug!(handler_class = %handler_class, "handler class registered");
        self.factories
            .insert(handler_class, HandlerFactory::Native(Arc::new(factory)));
    }

    /// Register a foreign object class; instances are adapted through the
    /// [`DynamicAdapter`] at instantiation time.
    pub fn register_foreign<F>(&self, handler_class: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Foreign> + Send + Sync + 'static,
    {
        let handler_class = handler_class.into();
        debug!(handler_class = %handler_class, "foreign handler class registered");
        self.factories
            .insert(handler_class, HandlerFactory::Foreign(Arc::new(factory)));
    }

    /// Whether a class is registered.
    #[must_use]
    pub fn contains(&self, handler_class: &str) -> bool {
        self.factories.contains_key(handler_class)
    }

    /// Registered class names.
    #[must_use]
    pub fn classes(&self) -> Vec<String> {
        self.factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove every registered class (used by catalogue hot-reload).
    pub fn clear(&self) {
        self.factories.clear();
    }

    /// Instantiate a handler for a class.
    ///
    /// Foreign classes bind through the dynamic adapter here, failing fast
    /// when no execute-style method is discovered.
    ///
    /// # Errors
    ///
    /// [`GatewayError::HandlerNotFound`] for unregistered classes;
    /// adaptation failures surface as [`GatewayError::HandlerFailure`].
    pub fn instantiate(&self, handler_class: &str) -> GatewayResult<Box<dyn Handler>> {
        let factory = self
            .factories
            .get(handler_class)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::HandlerNotFound {
                request_type: handler_class.to_owned(),
            })?;
        match factory {
            HandlerFactory::Native(build) => Ok(build()),
            HandlerFactory::Foreign(build) => {
                let adapted = DynamicAdapter::bind(build())?;
                Ok(Box::new(adapted))
            },
        }
    }
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("classes", &self.factories.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn execute(&self, request: &Request) -> GatewayResult<Response> {
            Ok(Response::success(
                request.request_id.clone().unwrap_or_else(|| "?".into()),
                serde_json::Value::Null,
            ))
        }
    }

    #[tokio::test]
    async fn instantiate_registered_class() {
        let catalog = HandlerCatalog::new();
        catalog.register("noop", || Box::new(NoopHandler));
        assert!(catalog.contains("noop"));

        let handler = catalog.instantiate("noop").unwrap();
        let mut request = Request::new("NOOP");
        request.ensure_request_id();
        let response = handler.execute(&request).await.unwrap();
        assert_eq!(response.status, dgfacade_core::ResponseStatus::Success);
    }

    #[test]
    fn unknown_class_is_handler_not_found() {
        let catalog = HandlerCatalog::new();
        let err = catalog.instantiate("ghost").unwrap_err();
        assert!(matches!(err, GatewayError::HandlerNotFound { .. }));
    }
}
