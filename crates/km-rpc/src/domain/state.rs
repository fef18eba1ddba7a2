//! Connection lifecycle as seen by the owner of a transport.

use std::fmt;
use std::time::Duration;

use crate::domain::correlation::PeerId;

/// State of one connection. Only the owning transport changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Lifecycle notification published by a transport.
///
/// `peer` is `None` for transports with a single shared connection (the
/// message-queue broker session).
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected {
        peer: Option<PeerId>,
    },
    Disconnected {
        peer: Option<PeerId>,
        reason: String,
        /// Pending requests cancelled with the connection.
        cancelled: usize,
    },
    Reconnecting {
        peer: Option<PeerId>,
        attempt: u32,
        delay: Duration,
    },
    /// Reconnection attempts are exhausted. No further attempts are made
    /// until the owner asks for one.
    Unavailable {
        peer: Option<PeerId>,
        attempts: u32,
    },
}

impl TransportEvent {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Reconnecting { .. } => "reconnect_attempt",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}
