#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! The DGFacade dispatch pipeline: request validation, authentication,
//! per-user handler resolution, optional cluster forwarding, and hand-off
//! to the execution engine.

pub mod auth;
pub mod cluster;
pub mod dispatcher;

pub use auth::AuthService;
pub use cluster::{ClusterService, ForwardEnvelope};
pub use dispatcher::Dispatcher;
