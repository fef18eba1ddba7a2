//! Outcome types shared by the registry, the dispatcher and the client.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::error::codes;

/// Error reported by a peer in an `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RemoteError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Handler failed in a way the peer does not classify further.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// The request body was not understood by the handler.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    /// Build from an error frame body. Bodies that do not carry
    /// `{code, message}` are kept whole in `data`.
    pub fn from_body(body: &serde_json::Value) -> Self {
        match serde_json::from_value::<RemoteError>(body.clone()) {
            Ok(err) => err,
            Err(_) => {
                let message = match body {
                    serde_json::Value::String(s) => s.clone(),
                    _ => "peer returned an error".to_string(),
                };
                Self::new(codes::SERVER_ERROR, message).with_data(body.clone())
            }
        }
    }
}

/// Why a pending request was cancelled rather than answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The connection carrying the request closed.
    ConnectionLost,
    /// A newer connection to the same peer replaced the one carrying the
    /// request.
    Superseded,
    /// The owner is shutting down.
    Shutdown,
    /// The registration was withdrawn before anyone waited on it.
    Discarded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionLost => "connection lost",
            Self::Superseded => "connection superseded",
            Self::Shutdown => "shutdown",
            Self::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// Final result of one pending request. Produced exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(RemoteError),
    Timeout,
    Cancelled(CancelReason),
}

impl Outcome {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "remote_error",
            Self::Timeout => "timeout",
            Self::Cancelled(_) => "cancelled",
        }
    }
}
