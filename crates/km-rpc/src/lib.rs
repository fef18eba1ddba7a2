// Allow missing docs for internal items in development
#![allow(missing_docs)]

//! KM RPC - request/response correlation over asynchronous agent transports.
//!
//! Kube-Manager services talk to agents that are only reachable through a
//! message queue (onboarding agents) or a long-lived WebSocket (cluster
//! agents). This crate turns those one-way, multiplexed links into
//! timeout-bounded calls that each get exactly their own reply.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          AGENT RPC (km-rpc)                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   caller ──► RpcClient ──register──► CorrelationRegistry            │
//! │                 │                          ▲                        │
//! │                 │ send(frame)              │ resolve(id, outcome)   │
//! │                 ▼                          │                        │
//! │        ┌─────────────────┐        ┌────────┴──────────┐             │
//! │        │    Transport    │──raw──►│ InboundDispatcher │──► events   │
//! │        │  queue / socket │        └───────────────────┘             │
//! │        └────────┬────────┘                                          │
//! └─────────────────┼───────────────────────────────────────────────────┘
//!                   │
//!       broker queues  or  ws://<host>:<agent_port>/ws
//!                   │
//!        QueueResponder / SocketResponder (agent side)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use km_rpc::{Backend, RpcConfig, RpcService, PeerId};
//!
//! let mut service = RpcService::new(RpcConfig::default(), Backend::Socket(directory))?;
//! service.start()?;
//! let pods = service.client().call_default(&PeerId::from("agent-1"), json!({"cmd": "pods"})).await?;
//! ```
//!
//! # Guarantees
//!
//! - A reply reaches only the caller whose correlation id it carries
//! - Every call ends with a value or a typed error, never hangs past its
//!   timeout
//! - Connection loss fails the calls it carried with `TransportLost`
//! - No pending entry outlives its deadline

#![warn(clippy::all)]
#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod adapters;
pub mod auth;
pub mod domain;
pub mod ipc;
pub mod ports;
pub mod service;

// Re-exports for public API
pub use adapters::{
    InMemoryConnector, QueueResponder, QueueTransport, SocketResponder, SocketTransport,
};
pub use auth::BearerTokenAuthorizer;
pub use domain::config::{ConfigError, ReconnectPolicy, RpcConfig};
pub use domain::error::{ApiError, ApiResult, RpcError, UpstreamError};
pub use domain::types::*;
pub use domain::{
    ConnectionState, CorrelationId, CorrelationRegistry, Frame, FrameKind, PeerId,
    TransportEvent,
};
pub use ipc::{DispatchOutcome, InboundDispatcher, RpcClient};
pub use ports::{
    BrokerConnector, CallAuthorizer, EventHandler, InboundEvent, PeerDirectory, PeerEndpoint,
    RequestHandler, StaticPeerDirectory, Transport, TransportError,
};
pub use service::{Backend, RpcService, ServiceError, TransportHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
