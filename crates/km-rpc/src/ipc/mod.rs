//! Request/response plumbing on top of a transport.
//!
//! - `client`: callers issue requests and wait for the matching reply
//! - `dispatcher`: every inbound frame is routed to a waiter or a handler
//! - `responder`: the serving side turns requests into replies

pub mod client;
pub mod dispatcher;
pub mod responder;

pub use client::RpcClient;
pub use dispatcher::{DispatchOutcome, InboundDispatcher, FALLBACK_TOPIC};
pub use responder::answer_request;
