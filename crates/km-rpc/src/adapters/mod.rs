//! Adapters for the agent RPC layer.
//!
//! Infrastructure implementations of the outbound ports: the two transports,
//! their serving-side responders and the broker bindings.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory_broker;
pub mod queue;
pub mod socket;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory_broker::InMemoryConnector;
pub use queue::{QueueResponder, QueueTransport, ResponderHandle};
pub use socket::{SocketResponder, SocketResponderHandle, SocketTransport, AGENT_TOPIC};
