//! Error types with JSON-RPC 2.0 style codes.
//!
//! `RpcError` is what callers of the client see. `UpstreamError` and
//! `ApiError` are what the owning service shows its own clients, so that a
//! dead agent can be told apart from a slow one.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::correlation::{CorrelationId, PeerId};
use crate::domain::types::RemoteError;

/// Standard JSON-RPC 2.0 error codes
pub mod codes {
    // JSON-RPC 2.0 standard errors (-32700 to -32600)
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Server errors (-32000 to -32099)
    pub const SERVER_ERROR: i32 = -32000;
    pub const RESOURCE_NOT_FOUND: i32 = -32001;
    pub const RESOURCE_UNAVAILABLE: i32 = -32002;
    pub const REQUEST_REJECTED: i32 = -32003;
    pub const TIMEOUT: i32 = -32006;
    pub const CONNECTION_LOST: i32 = -32007;
    pub const UNAUTHORIZED: i32 = -32010;
}

/// Caller-facing error of one RPC call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// No reply before the deadline.
    #[error("no reply from {peer} within {timeout_ms}ms")]
    Timeout { peer: PeerId, timeout_ms: u64 },

    /// The connection carrying the request closed before a reply arrived.
    #[error("connection to {peer} lost while awaiting reply")]
    TransportLost { peer: PeerId },

    /// The request could not be handed to the transport.
    #[error("failed to send request to {peer}: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    /// The transport cannot reach the destination right now.
    #[error("transport unavailable for {peer}: {reason}")]
    TransportUnavailable { peer: PeerId, reason: String },

    /// A request with this id is already pending.
    #[error("correlation id already pending: {0}")]
    DuplicateId(CorrelationId),

    /// The peer answered with an error frame.
    #[error("{peer} rejected the request: {error}")]
    Remote { peer: PeerId, error: RemoteError },

    /// A typed call could not encode the request or decode the reply.
    #[error("could not decode reply from {peer}: {reason}")]
    Decode { peer: PeerId, reason: String },

    /// The credential presented for the call was refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl RpcError {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::TransportLost { .. } => "transport_lost",
            Self::SendFailed { .. } => "send_failed",
            Self::TransportUnavailable { .. } => "unavailable",
            Self::DuplicateId(_) => "duplicate_id",
            Self::Remote { .. } => "remote_error",
            Self::Decode { .. } => "decode_error",
            Self::Unauthorized(_) => "unauthorized",
        }
    }

    /// Translate into the classification shown to upstream clients.
    pub fn upstream(&self) -> UpstreamError {
        match self {
            Self::Timeout { peer, .. } => UpstreamError::AgentTimedOut(peer.clone()),
            Self::TransportUnavailable { peer, .. } | Self::SendFailed { peer, .. } => {
                UpstreamError::AgentUnreachable(peer.clone())
            }
            Self::TransportLost { peer } => UpstreamError::AgentConnectionLost(peer.clone()),
            Self::Remote { peer, error } => UpstreamError::AgentRejected {
                peer: peer.clone(),
                error: error.clone(),
            },
            Self::Decode { peer, reason } => UpstreamError::BadAgentReply {
                peer: peer.clone(),
                reason: reason.clone(),
            },
            Self::Unauthorized(reason) => UpstreamError::Unauthorized(reason.clone()),
            Self::DuplicateId(id) => UpstreamError::Internal(format!("duplicate request id {id}")),
        }
    }
}

/// Failure classes as presented to clients of the owning service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamError {
    #[error("agent {0} did not answer in time")]
    AgentTimedOut(PeerId),

    #[error("agent {0} is not reachable")]
    AgentUnreachable(PeerId),

    #[error("connection to agent {0} was lost")]
    AgentConnectionLost(PeerId),

    #[error("agent {peer} rejected the command: {error}")]
    AgentRejected { peer: PeerId, error: RemoteError },

    #[error("agent {peer} sent an unreadable reply: {reason}")]
    BadAgentReply { peer: PeerId, reason: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Registry-level errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("correlation id already pending: {0}")]
    DuplicateId(CorrelationId),
}

impl From<RegistryError> for RpcError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateId(id) => RpcError::DuplicateId(id),
        }
    }
}

/// Frame encoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("undecodable frame: {0}")]
    Decode(String),

    #[error("unencodable frame: {0}")]
    Encode(String),
}

/// Error with JSON-RPC code, as returned to the owning service's clients
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    /// JSON-RPC error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Optional additional data
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create error with additional data
    pub fn with_data(code: i32, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Internal error
    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(
            codes::INTERNAL_ERROR,
            format!("Internal error: {}", details.into()),
        )
    }

    /// Peer unreachable
    pub fn resource_unavailable(details: impl Into<String>) -> Self {
        Self::new(
            codes::RESOURCE_UNAVAILABLE,
            format!("Resource unavailable: {}", details.into()),
        )
    }

    /// Request timeout
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::new(
            codes::TIMEOUT,
            format!("Request timeout: {}", operation.into()),
        )
    }

    /// Unauthorized - missing or invalid auth
    pub fn unauthorized(details: impl Into<String>) -> Self {
        Self::new(
            codes::UNAUTHORIZED,
            format!("Unauthorized: {}", details.into()),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let len = if self.data.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("ApiError", len)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(ref data) = self.data {
            state.serialize_field("data", data)?;
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for ApiError {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ErrorHelper {
            code: i32,
            message: String,
            data: Option<serde_json::Value>,
        }

        let helper = ErrorHelper::deserialize(deserializer)?;
        Ok(ApiError {
            code: helper.code,
            message: helper.message,
            data: helper.data,
        })
    }
}

impl From<UpstreamError> for ApiError {
    fn from(e: UpstreamError) -> Self {
        let message = e.to_string();
        match e {
            UpstreamError::AgentTimedOut(peer) => {
                Self::with_data(codes::TIMEOUT, message, serde_json::json!({ "agent": peer }))
            }
            UpstreamError::AgentUnreachable(peer) => Self::with_data(
                codes::RESOURCE_UNAVAILABLE,
                message,
                serde_json::json!({ "agent": peer }),
            ),
            UpstreamError::AgentConnectionLost(peer) => Self::with_data(
                codes::CONNECTION_LOST,
                message,
                serde_json::json!({ "agent": peer }),
            ),
            UpstreamError::AgentRejected { peer, error } => Self::with_data(
                codes::REQUEST_REJECTED,
                message,
                serde_json::json!({ "agent": peer, "code": error.code, "data": error.data }),
            ),
            UpstreamError::BadAgentReply { peer, .. } => Self::with_data(
                codes::SERVER_ERROR,
                message,
                serde_json::json!({ "agent": peer }),
            ),
            UpstreamError::Unauthorized(reason) => Self::unauthorized(reason),
            UpstreamError::Internal(reason) => Self::internal(reason),
        }
    }
}

impl From<RpcError> for ApiError {
    fn from(e: RpcError) -> Self {
        e.upstream().into()
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;
