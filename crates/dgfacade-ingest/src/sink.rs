//! The ingester-facing submission boundary.

use async_trait::async_trait;
use dgfacade_core::{GatewayResult, Request, Response};

/// Accepts synthesized requests for dispatch.
///
/// The gateway implements this over the dispatcher; tests substitute a
/// recording mock.
#[async_trait]
pub trait RequestSink: Send + Sync {
    /// Dispatch one request and await its response.
    async fn submit(&self, request: Request) -> GatewayResult<Response>;
}
