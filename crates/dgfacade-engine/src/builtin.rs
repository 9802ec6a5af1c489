//! Built-in handler catalogue.
//!
//! These ship with the gateway and back the default request types:
//! `ARITHMETIC`, `ECHO`, `SLEEP` (cancellation-aware delay), and the
//! streaming `MARKET_DATA` tick generator.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use dgfacade_core::{
    GatewayError, GatewayResult, Request, RequestId, Response, ResponseChannel,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::handler::{Handler, HandlerCatalog};
use crate::session::StreamPublisher;

/// Register every built-in class on a catalog.
pub fn register_builtins(catalog: &HandlerCatalog) {
    catalog.register("builtin.arithmetic", || Box::new(ArithmeticHandler));
    catalog.register("builtin.echo", || Box::new(EchoHandler));
    catalog.register("builtin.sleep", || Box::new(SleepHandler::new()));
    catalog.register("builtin.market_data", || {
        Box::new(MarketDataHandler::new())
    });
}

fn request_id(request: &Request) -> RequestId {
    request
        .request_id
        .clone()
        .unwrap_or_else(RequestId::generate)
}

/// Binary arithmetic over a list of operands.
pub struct ArithmeticHandler;

impl ArithmeticHandler {
    fn operands(payload: &Value) -> GatewayResult<Vec<f64>> {
        let operands: Vec<f64> = payload
            .get("operands")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        if operands.len() < 2 {
            return Err(GatewayError::InvalidRequest(
                "operation requires at least two numeric operands".to_owned(),
            ));
        }
        Ok(operands)
    }

    fn apply(operation: &str, operands: &[f64]) -> GatewayResult<f64> {
        let mut iter = operands.iter().copied();
        let first = iter.next().unwrap_or(0.0);
        match operation {
            "ADD" => Ok(iter.fold(first, |acc, n| acc + n)),
            "SUBTRACT" => Ok(iter.fold(first, |acc, n| acc - n)),
            "MULTIPLY" => Ok(iter.fold(first, |acc, n| acc * n)),
            "DIVIDE" => iter.try_fold(first, |acc, n| {
                if n == 0.0 {
                    Err(GatewayError::HandlerFailure("Division by zero".to_owned()))
                } else {
                    Ok(acc / n)
                }
            }),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown operation {other}"
            ))),
        }
    }
}

#[async_trait]
impl Handler for ArithmeticHandler {
    async fn execute(&self, request: &Request) -> GatewayResult<Response> {
        let operation = request
            .payload
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("ADD")
            .to_ascii_uppercase();
        let operands = Self::operands(&request.payload)?;
        let result = Self::apply(&operation, &operands)?;
        Ok(Response::success(
            request_id(request),
            serde_json::json!({
                "operation": operation,
                "operands": operands,
                "result": result,
            }),
        ))
    }
}

/// Echoes the request payload back.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn execute(&self, request: &Request) -> GatewayResult<Response> {
        let id = request_id(request);
        Ok(Response::success(
            id.clone(),
            serde_json::json!({
                "echo": request.payload,
                "echo_request_id": id,
            }),
        ))
    }
}

/// Sleeps for `duration_ms`, honouring cooperative cancellation.
pub struct SleepHandler {
    stop: CancellationToken,
}

impl SleepHandler {
    /// Fresh handler with its own stop flag.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
        }
    }
}

impl Default for SleepHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for SleepHandler {
    async fn execute(&self, request: &Request) -> GatewayResult<Response> {
        let duration_ms = request
            .payload
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(1_000);
        let slept = tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(duration_ms)) => duration_ms,
            () = self.stop.cancelled() => 0,
        };
        Ok(Response::success(
            request_id(request),
            serde_json::json!({ "slept_ms": slept, "interrupted": slept == 0 }),
        ))
    }

    async fn stop(&self) {
        self.stop.cancel();
    }
}

/// Streams synthetic market ticks until stopped.
pub struct MarketDataHandler {
    base_price: f64,
    volatility: f64,
}

impl MarketDataHandler {
    /// Fresh handler with default pricing parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_price: 100.0,
            volatility: 0.5,
        }
    }
}

impl Default for MarketDataHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for MarketDataHandler {
    async fn construct(
        &mut self,
        config: &serde_json::Map<String, Value>,
    ) -> GatewayResult<()> {
        if let Some(base) = config.get("base_price").and_then(Value::as_f64) {
            self.base_price = base;
        }
        if let Some(volatility) = config.get("volatility").and_then(Value::as_f64) {
            self.volatility = volatility;
        }
        Ok(())
    }

    async fn execute_streaming(
        &self,
        request: &Request,
        publisher: StreamPublisher,
    ) -> GatewayResult<Response> {
        let symbols: Vec<String> = request
            .payload
            .get("symbols")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_else(|| vec!["DGF".to_owned()]);
        let interval = Duration::from_millis(
            request
                .payload
                .get("interval_ms")
                .and_then(Value::as_u64)
                .unwrap_or(1_000),
        );

        let id = request_id(request);
        let mut prices: Vec<f64> = symbols.iter().map(|_| self.base_price).collect();
        let mut ticks: u64 = 0;
        loop {
            for (symbol, price) in symbols.iter().zip(prices.iter_mut()) {
                *price += (fastrand::f64() - 0.5) * self.volatility;
                let tick = Response::success(
                    id.clone(),
                    serde_json::json!({ "symbol": symbol, "price": *price }),
                );
                if publisher.publish(tick).await.is_err() {
                    // Session gone; wind down.
                    debug!(symbol = %symbol, "session closed, ending stream");
                    return Ok(Response::success(
                        id,
                        serde_json::json!({ "ticks_published": ticks }),
                    ));
                }
                ticks = ticks.saturating_add(1);
            }
            tokio::select! {
                () = publisher.stopped() => {
                    return Ok(Response::success(
                        id,
                        serde_json::json!({ "ticks_published": ticks }),
                    ));
                },
                () = tokio::time::sleep(interval) => {},
            }
        }
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn default_ttl_minutes(&self) -> Option<u64> {
        Some(60)
    }

    fn default_response_channels(&self) -> Option<BTreeSet<ResponseChannel>> {
        Some([ResponseChannel::Websocket].into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(payload: Value) -> Request {
        let mut request = Request::new("TEST").with_payload(payload);
        request.ensure_request_id();
        request
    }

    #[tokio::test]
    async fn arithmetic_add() {
        let handler = ArithmeticHandler;
        let response = handler
            .execute(&request_with(serde_json::json!({
                "operation": "ADD",
                "operands": [7, 6]
            })))
            .await
            .unwrap();
        assert_eq!(response.result["result"], 13.0);
    }

    #[tokio::test]
    async fn arithmetic_division_by_zero() {
        let handler = ArithmeticHandler;
        let err = handler
            .execute(&request_with(serde_json::json!({
                "operation": "DIVIDE",
                "operands": [10, 0]
            })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Division by zero"));
    }

    #[tokio::test]
    async fn arithmetic_needs_two_operands() {
        let handler = ArithmeticHandler;
        let err = handler
            .execute(&request_with(serde_json::json!({
                "operation": "ADD",
                "operands": [1]
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn echo_reflects_payload_and_id() {
        let handler = EchoHandler;
        let request = request_with(serde_json::json!({"message": "Hello"}));
        let response = handler.execute(&request).await.unwrap();
        assert_eq!(response.result["echo"]["message"], "Hello");
        assert_eq!(
            response.result["echo_request_id"],
            serde_json::json!(request.request_id.clone().unwrap())
        );
    }

    #[tokio::test]
    async fn sleep_honours_stop() {
        let handler = SleepHandler::new();
        let request = request_with(serde_json::json!({"duration_ms": 60_000}));

        let stop = handler.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.cancel();
        });

        let started = std::time::Instant::now();
        let response = handler.execute(&request).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(response.result["interrupted"], true);
    }
}
