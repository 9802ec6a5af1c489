#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Ingesters: scoped adapters that consume from broker subscribers,
//! synthesize requests, and submit them to the dispatch pipeline.
//!
//! Ingesters talk to the dispatcher through the narrow [`RequestSink`]
//! trait, wired by the gateway binary at startup.

pub mod ingester;
pub mod manager;
pub mod sink;

pub use ingester::{Ingester, IngesterStatsSnapshot};
pub use manager::IngesterManager;
pub use sink::RequestSink;
