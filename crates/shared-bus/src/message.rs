//! # Broker Messages
//!
//! Message envelope and error types shared by publishers and consumers.

use std::time::SystemTime;
use thiserror::Error;

/// Errors returned by broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The broker refuses new connections.
    #[error("broker unavailable")]
    Unavailable,

    /// The connection used for the operation has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Publish or consume against a queue nobody declared.
    #[error("queue not declared: {0}")]
    QueueNotFound(String),
}

/// A message sitting in (or delivered from) a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Opaque payload.
    pub body: Vec<u8>,
    /// AMQP-style correlation id property.
    pub correlation_id: Option<String>,
    /// AMQP-style reply-to property.
    pub reply_to: Option<String>,
    /// Delivery mode 2 in AMQP terms.
    pub persistent: bool,
    /// Wall-clock time the broker accepted the message.
    pub published_at: SystemTime,
}

impl QueuedMessage {
    /// Create a persistent message with no properties set.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            correlation_id: None,
            reply_to: None,
            persistent: true,
            published_at: SystemTime::now(),
        }
    }

    /// Set the correlation id property.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reply-to property.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}
