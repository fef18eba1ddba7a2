//! # Shared Bus - In-Process Message Broker
//!
//! A broker with the same shape as the production AMQP deployment, kept in
//! process memory so the queue transport can run in tests and in
//! single-process installations.
//!
//! ## Semantics
//!
//! - **Durable named queues:** a queue outlives every connection that
//!   declared it; messages wait in the queue until a consumer takes them.
//! - **Idempotent declaration:** declaring an existing queue is a no-op.
//! - **Confirmed publish:** `publish()` returns only once the message is
//!   enqueued, and fails if the connection or queue is gone.
//! - **Competing consumers:** each message is delivered to exactly one
//!   consumer of its queue.
//!
//! ```text
//! ┌──────────────┐  publish("agent.requests")   ┌──────────────────────┐
//! │ Gateway conn │ ───────────────────────────→ │ queue agent.requests │ ─→ agent consumer
//! │              │ ←─────────────────────────── │ queue gateway.results│ ←─ agent publish
//! └──────────────┘      consume()               └──────────────────────┘
//! ```
//!
//! ## Fault injection
//!
//! - [`InMemoryBroker::drop_connections`] closes every live connection, which
//!   ends their consumer streams (an unexpected connection loss).
//! - [`InMemoryBroker::set_available`] makes new connections fail (an outage).

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod message;
pub mod publisher;
pub mod subscriber;

pub use message::{BusError, QueuedMessage};
pub use publisher::{BrokerConnection, InMemoryBroker};
pub use subscriber::QueueConsumer;

/// Name used in logs for this broker implementation.
pub const BROKER_NAME: &str = "in-memory";
