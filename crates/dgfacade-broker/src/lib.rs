#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Broker adapters for the DGFacade request gateway.
//!
//! Every broker protocol is split into a narrow transport (connect, send,
//! poll) and a shared supervisor that owns the common contract: the
//! connection state machine, reconnection with jittered exponential
//! backoff, publish/flush semantics, the bounded subscriber queue, and the
//! backpressure policy. Composition over inheritance: one transport struct
//! per protocol, one supervisor for all of them.
//!
//! | Protocol | Transport | Availability |
//! |----------|-----------|--------------|
//! | Kafka / Confluent Kafka | `rdkafka` | `kafka` feature |
//! | ActiveMQ | STOMP 1.2 over TCP | always |
//! | RabbitMQ | `lapin` | `amqp` feature |
//! | Filesystem | directory polling | always |
//! | SQL | `rusqlite` | always |

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod backoff;
pub mod error;
pub mod factory;
pub mod filesystem;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod publisher;
pub mod sql;
pub mod ssl;
pub mod state;
pub mod stats;
pub mod stomp;
pub mod subscriber;

pub use backoff::Backoff;
pub use error::{BrokerError, BrokerResult};
pub use factory::{BrokerKind, apply_confluent_profile, create_publisher, create_subscriber};
pub use publisher::{BrokerPublisher, PublisherTransport};
pub use state::ConnectionState;
pub use stats::{PublisherStatsSnapshot, SubscriberStatsSnapshot};
pub use subscriber::{BrokerSubscriber, Delivery, Listener, SubscriberTransport};
