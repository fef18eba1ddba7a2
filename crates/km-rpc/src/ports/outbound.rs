//! Outbound ports (driven side).
//!
//! The client and dispatcher only see these traits. Transports, broker
//! bindings and directories plug in behind them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::correlation::PeerId;
use crate::domain::error::FrameError;
use crate::domain::frame::Frame;
use crate::domain::state::{ConnectionState, TransportEvent};

/// Uniform "send frame / lifecycle" interface over one transport backend.
///
/// Inbound frames do not come back through this trait; every transport
/// pushes them into the `InboundDispatcher` it was built with.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs and metrics (`queue`, `socket`).
    fn name(&self) -> &'static str;

    /// State of the connection used to reach `peer`.
    fn state(&self, peer: &PeerId) -> ConnectionState;

    /// Make sure a frame to `peer` can be sent right now. Transports that
    /// connect lazily may try to connect here.
    async fn ensure_ready(&self, peer: &PeerId) -> Result<(), TransportError>;

    /// Address peers should send replies to, if the transport has one.
    fn reply_address(&self) -> Option<String>;

    /// Send one frame to `frame.peer`.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close every connection. Pending requests are cancelled.
    async fn close(&self);

    /// Lifecycle notifications.
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("peer {0} not connected")]
    PeerNotConnected(PeerId),

    #[error("no address known for peer {0}")]
    UnknownPeer(PeerId),

    #[error("transport unavailable after {attempts} reconnect attempts")]
    Unavailable { attempts: u32 },

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// The destination cannot be reached at all, as opposed to a single
    /// send going wrong on a live connection.
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::PeerNotConnected(_)
                | Self::UnknownPeer(_)
                | Self::Unavailable { .. }
                | Self::ConnectTimeout(_)
                | Self::Connect(_)
                | Self::Closed
        )
    }
}

// =============================================================================
// Broker port (message-queue transport)
// =============================================================================

/// One message published to or delivered from a broker queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl BrokerMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            correlation_id: None,
            reply_to: None,
        }
    }
}

/// Broker errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker connection closed")]
    ConnectionClosed,

    #[error("queue operation failed: {0}")]
    Queue(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish not confirmed by broker")]
    NotConfirmed,
}

/// Stream of deliveries from one queue. Ends when the session closes.
pub type DeliveryStream = BoxStream<'static, Result<BrokerMessage, BrokerError>>;

/// Opens broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// One broker connection with a channel in confirm mode.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a persistent message and wait for the broker confirm.
    async fn publish(&self, queue: &str, message: BrokerMessage) -> Result<(), BrokerError>;

    /// Start consuming a declared queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    /// Close the session. Delivery streams end.
    async fn close(&self);
}

// =============================================================================
// Peer directory (socket transport)
// =============================================================================

/// Where an agent can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub host: String,
    /// Overrides the configured agent port.
    pub port: Option<u16>,
}

impl PeerEndpoint {
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }

    pub fn with_port(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }
}

/// Resolves a peer id to its endpoint (agent id to cluster host).
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn lookup(&self, peer: &PeerId) -> Option<PeerEndpoint>;
}

/// In-memory directory.
#[derive(Default)]
pub struct StaticPeerDirectory {
    entries: RwLock<HashMap<PeerId, PeerEndpoint>>,
}

impl StaticPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: impl Into<PeerId>, endpoint: PeerEndpoint) {
        self.entries.write().insert(peer.into(), endpoint);
    }

    pub fn remove(&self, peer: &PeerId) -> Option<PeerEndpoint> {
        self.entries.write().remove(peer)
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn lookup(&self, peer: &PeerId) -> Option<PeerEndpoint> {
        self.entries.read().get(peer).cloned()
    }
}

// =============================================================================
// Authorization
// =============================================================================

/// Authorization errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("invalid credential")]
    Invalid,

    #[error("not allowed to call {0}")]
    Forbidden(PeerId),
}

/// Validates the credential presented for a call.
pub trait CallAuthorizer: Send + Sync {
    fn authorize(&self, credential: &str, destination: &PeerId) -> Result<(), AuthError>;
}

// =============================================================================
// Test doubles
// =============================================================================
