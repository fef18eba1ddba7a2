//! WebSocket binding between the gateway and cluster agents.
//!
//! Agents listen on `ws://<host>:<agent_port>/ws`; each message carries one
//! JSON frame.

mod responder;
mod transport;

pub use responder::{SocketResponder, SocketResponderHandle};
pub use transport::{SocketTransport, AGENT_TOPIC};
