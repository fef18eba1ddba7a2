//! Wire frame.
//!
//! One JSON object per transport message:
//!
//! ```json
//! {"correlation_id":"0190…","kind":"request","destination_or_source":"agent-1",
//!  "topic":"pods","reply_to":"gateway.results","body":{"cmd":"get_pods"}}
//! ```
//!
//! `peer`, `destination` and `source` are accepted in place of
//! `destination_or_source`. A correlation id that is not a UUID is read as
//! absent.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::correlation::{CorrelationId, PeerId};
use crate::domain::error::FrameError;
use crate::domain::types::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Request,
    Response,
    Error,
    Event,
}

impl FrameKind {
    /// Response and error frames answer a request.
    pub fn is_reply(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, deserialize_with = "lenient_correlation_id")]
    pub correlation_id: Option<CorrelationId>,
    pub kind: FrameKind,
    #[serde(
        default,
        rename = "destination_or_source",
        alias = "peer",
        alias = "destination",
        alias = "source"
    )]
    pub peer: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl Frame {
    pub fn request(id: CorrelationId, destination: PeerId, body: Value) -> Self {
        Self {
            correlation_id: Some(id),
            kind: FrameKind::Request,
            peer: destination,
            topic: None,
            reply_to: None,
            body,
        }
    }

    pub fn response(id: CorrelationId, source: PeerId, body: Value) -> Self {
        Self {
            correlation_id: Some(id),
            kind: FrameKind::Response,
            peer: source,
            topic: None,
            reply_to: None,
            body,
        }
    }

    pub fn error(id: CorrelationId, source: PeerId, error: &RemoteError) -> Self {
        let body = serde_json::to_value(error).unwrap_or(Value::Null);
        Self {
            correlation_id: Some(id),
            kind: FrameKind::Error,
            peer: source,
            topic: None,
            reply_to: None,
            body,
        }
    }

    /// Unsolicited push.
    pub fn event(source: PeerId, topic: impl Into<String>, body: Value) -> Self {
        Self {
            correlation_id: None,
            kind: FrameKind::Event,
            peer: source,
            topic: Some(topic.into()),
            reply_to: None,
            body,
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(raw).map_err(|e| FrameError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(self).map_err(|e| FrameError::Encode(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|e| FrameError::Encode(e.to_string()))
    }

    /// The error carried by an `error` frame.
    pub fn remote_error(&self) -> RemoteError {
        RemoteError::from_body(&self.body)
    }
}

fn lenient_correlation_id<'de, D>(deserializer: D) -> Result<Option<CorrelationId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => CorrelationId::parse_lenient(&s),
        _ => None,
    })
}
