//! Inbound ports (driving side).
//!
//! Handlers the dispatcher and responders call with frames that arrive from
//! peers.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::correlation::{CorrelationId, PeerId};
use crate::domain::frame::{Frame, FrameKind};
use crate::domain::types::RemoteError;

/// A frame that was not a reply to one of our requests.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub source: PeerId,
    pub topic: String,
    pub kind: FrameKind,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    pub body: Value,
}

impl InboundEvent {
    /// Build from a decoded frame; `default_topic` applies when the frame
    /// names none.
    pub fn from_frame(source: PeerId, default_topic: &str, frame: Frame) -> Self {
        Self {
            source,
            topic: frame.topic.unwrap_or_else(|| default_topic.to_string()),
            kind: frame.kind,
            correlation_id: frame.correlation_id,
            reply_to: frame.reply_to,
            body: frame.body,
        }
    }
}

/// Why an event handler did not take an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("handler queue full")]
    Full,

    #[error("handler closed")]
    Closed,
}

/// Receives unsolicited pushes. Runs on the connection's reader task, so it
/// must return quickly and never block.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: InboundEvent) -> Result<(), HandlerError>;
}

/// Forwards events into a bounded channel.
pub struct ChannelEventHandler {
    tx: mpsc::Sender<InboundEvent>,
}

impl ChannelEventHandler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelEventHandler {
    fn handle(&self, event: InboundEvent) -> Result<(), HandlerError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HandlerError::Full,
            mpsc::error::TrySendError::Closed(_) => HandlerError::Closed,
        })
    }
}

/// Serves `request` frames on the responding side.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: InboundEvent) -> Result<Value, RemoteError>;
}
