#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! DGFacade Core - Foundation types for the DGFacade request gateway.
//!
//! This crate provides:
//! - The request / response envelopes moving through the gateway
//! - The canonical broker message envelope
//! - Response channel and request source enumerations
//! - The gateway error taxonomy
//! - Identifier newtypes used throughout the system

pub mod channel;
pub mod cluster;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod request;
pub mod response;

pub use channel::ResponseChannel;
pub use cluster::{NodeRole, NodeState, NodeStatus};
pub use envelope::MessageEnvelope;
pub use error::{GatewayError, GatewayResult};
pub use ids::{NodeId, RequestId, SessionId};
pub use request::{Request, RequestSource};
pub use response::{Response, ResponseStatus};
