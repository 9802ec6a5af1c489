//! Structural adaptation of foreign objects to the handler contract.
//!
//! A foreign object is a plain bag of named methods over JSON values. The
//! adapter introspects the method table once at bind time, binds the first
//! match per lifecycle operation, and fails fast when no execute-style
//! method exists. No runtime reflection: after binding, calls go straight
//! through the resolved names.

use async_trait::async_trait;
use dgfacade_core::{GatewayError, GatewayResult, Request, Response};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::handler::Handler;

/// Discovery order for the execute operation; first match wins.
const EXECUTE_NAMES: &[&str] = &["execute", "handle", "process", "run"];
/// Discovery order for construction.
const CONSTRUCT_NAMES: &[&str] = &["construct", "init", "initialize", "setup"];
/// Discovery order for cooperative stop.
const STOP_NAMES: &[&str] = &["stop", "cancel", "abort", "shutdown"];
/// Discovery order for cleanup.
const CLEANUP_NAMES: &[&str] = &["cleanup", "close", "destroy", "dispose"];

/// A failure raised by foreign code, carrying the foreign type name.
#[derive(Debug, Error)]
#[error("{class}: {message}")]
pub struct ForeignError {
    /// The foreign exception class name.
    pub class: String,
    /// The failure message.
    pub message: String,
}

impl ForeignError {
    /// Create a foreign failure.
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

/// A foreign code object that does not implement the native contract.
pub trait Foreign: Send + Sync {
    /// The foreign type name, reported in error responses.
    fn class_name(&self) -> &str;

    /// The object's method table; introspected once at bind time.
    fn methods(&self) -> Vec<&'static str>;

    /// Invoke a named method with a JSON argument.
    fn call(&self, method: &str, argument: Value) -> Result<Value, ForeignError>;
}

fn discover(methods: &[&'static str], candidates: &[&'static str]) -> Option<&'static str> {
    candidates
        .iter()
        .find(|name| methods.contains(name))
        .copied()
}

/// Adapts a bound foreign object into a conforming [`Handler`].
pub struct DynamicAdapter {
    object: Box<dyn Foreign>,
    execute: &'static str,
    construct: Option<&'static str>,
    stop: Option<&'static str>,
    cleanup: Option<&'static str>,
}

impl std::fmt::Debug for DynamicAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicAdapter")
            .field("class_name", &self.object.class_name())
            .field("execute", &self.execute)
            .field("construct", &self.construct)
            .field("stop", &self.stop)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl DynamicAdapter {
    /// Introspect the foreign object and bind its lifecycle methods.
    ///
    /// # Errors
    ///
    /// [`GatewayError::HandlerFailure`] when no execute-style method is
    /// found; adaptation fails at instantiation, before any state exists.
    pub fn bind(object: Box<dyn Foreign>) -> GatewayResult<Self> {
        let methods = object.methods();
        let Some(execute) = discover(&methods, EXECUTE_NAMES) else {
            return Err(GatewayError::HandlerFailure(format!(
                "foreign object {} exposes no execute-style method (tried {:?})",
                object.class_name(),
                EXECUTE_NAMES
            )));
        };
        let adapter = Self {
            execute,
            construct: discover(&methods, CONSTRUCT_NAMES),
            stop: discover(&methods, STOP_NAMES),
            cleanup: discover(&methods, CLEANUP_NAMES),
            object,
        };
        debug!(
            class = %adapter.object.class_name(),
            execute = adapter.execute,
            construct = ?adapter.construct,
            stop = ?adapter.stop,
            cleanup = ?adapter.cleanup,
            "foreign object bound"
        );
        Ok(adapter)
    }

    /// Wrap a foreign return value into a response.
    ///
    /// A value that already parses as a response passes through; a map
    /// becomes the `result`; any other value becomes `{result: value}`.
    fn wrap_result(request: &Request, value: Value) -> Response {
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(dgfacade_core::RequestId::generate);
        if let Ok(response) = serde_json::from_value::<Response>(value.clone()) {
            return response;
        }
        match value {
            Value::Object(map) => Response::success(request_id, Value::Object(map)),
            other => Response::success(request_id, serde_json::json!({ "result": other })),
        }
    }
}

#[async_trait]
impl Handler for DynamicAdapter {
    async fn construct(
        &mut self,
        config: &serde_json::Map<String, Value>,
    ) -> GatewayResult<()> {
        if let Some(method) = self.construct {
            self.object
                .call(method, Value::Object(config.clone()))
                .map_err(|err| GatewayError::HandlerFailure(err.to_string()))?;
        }
        Ok(())
    }

    async fn execute(&self, request: &Request) -> GatewayResult<Response> {
        let argument = serde_json::to_value(request)?;
        match self.object.call(self.execute, argument) {
            Ok(value) => Ok(Self::wrap_result(request, value)),
            Err(err) => Err(GatewayError::HandlerFailure(err.to_string())),
        }
    }

    async fn stop(&self) {
        if let Some(method) = self.stop
            && let Err(err) = self.object.call(method, Value::Null)
        {
            // Stop failures are swallowed; the execution unit proceeds to
            // teardown regardless.
            warn!(class = %self.object.class_name(), error = %err, "foreign stop failed");
        }
    }

    async fn cleanup(&mut self) {
        if let Some(method) = self.cleanup
            && let Err(err) = self.object.call(method, Value::Null)
        {
            warn!(class = %self.object.class_name(), error = %err, "foreign cleanup failed");
        }
    }
}
