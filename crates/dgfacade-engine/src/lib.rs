#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! The DGFacade execution engine.
//!
//! Converts validated requests into responses under a supervised,
//! TTL-bounded, task-per-request model:
//!
//! - [`handler`] - the uniform handler contract and the class catalog
//! - [`adapter`] - structural adaptation of foreign objects
//! - [`engine`] - the per-request execution unit (TTL, cancellation,
//!   supervision, state capture)
//! - [`session`] - streaming session bookkeeping
//! - [`fanout`] - multi-channel fan-out of streaming responses
//! - [`accessor`] - handler-facing lazily-cached channel pub/sub
//! - [`builtin`] - the built-in handler catalogue

pub mod accessor;
pub mod adapter;
pub mod builtin;
pub mod context;
pub mod engine;
pub mod fanout;
pub mod handler;
pub mod session;
pub mod state;

#[cfg(test)]
mod e2e_tests;

pub use accessor::ChannelAccessor;
pub use adapter::{DynamicAdapter, Foreign, ForeignError};
pub use context::{EngineContext, ForeignWorkerBridge};
pub use engine::{ExecutionEngine, ResponseFuture};
pub use fanout::{BroadcastGate, FanoutPublisher, RestBuffer, StreamFrame, StreamGate};
pub use handler::{Handler, HandlerCatalog};
pub use session::{SessionManager, SessionStatus, StreamPublisher, StreamingSession};
pub use state::{HandlerPhase, HandlerState, StateRing};
