//! Bridges ingesters onto the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use dgfacade_core::{GatewayResult, Request, Response};
use dgfacade_dispatch::Dispatcher;
use dgfacade_ingest::RequestSink;

/// [`RequestSink`] over the dispatch pipeline.
pub struct DispatcherSink {
    dispatcher: Arc<Dispatcher>,
}

impl DispatcherSink {
    /// Wrap a dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl RequestSink for DispatcherSink {
    async fn submit(&self, request: Request) -> GatewayResult<Response> {
        let future = self.dispatcher.dispatch(request).await?;
        Ok(future.await)
    }
}
