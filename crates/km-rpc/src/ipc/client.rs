//! RPC Client - synchronous-looking calls over an asynchronous transport.

use km_telemetry::{
    log_call_event, metric_inc, HistogramTimer, CALLS_TOTAL, CALL_DURATION, PENDING_REQUESTS,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::domain::correlation::{CorrelationId, PeerId};
use crate::domain::error::RpcError;
use crate::domain::frame::Frame;
use crate::domain::pending::CorrelationRegistry;
use crate::domain::types::Outcome;
use crate::ports::outbound::{CallAuthorizer, Transport};

/// Issues requests over one transport and waits for their replies.
///
/// Cheap to share: every concurrent caller gets its own correlation id and
/// only ever sees its own reply.
pub struct RpcClient {
    registry: Arc<CorrelationRegistry>,
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
    authorizer: Option<Arc<dyn CallAuthorizer>>,
}

impl RpcClient {
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        transport: Arc<dyn Transport>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            default_timeout,
            authorizer: None,
        }
    }

    /// Authorizer consulted by `call_authorized`.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn CallAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Send `payload` to `destination` and wait at most `timeout` for the
    /// reply.
    pub async fn call(
        &self,
        destination: &PeerId,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let timer = HistogramTimer::new(&CALL_DURATION);
        let result = self.execute(destination, payload, timeout).await;
        let label = match &result {
            Ok(_) => "success",
            Err(e) => e.label(),
        };
        metric_inc!(CALLS_TOTAL, &[label]);
        PENDING_REQUESTS.set(self.registry.pending_count() as i64);
        if let Err(e) = &result {
            warn!(
                peer = %destination,
                error = %e,
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "Call failed"
            );
        }
        result
    }

    /// `call` with the configured default timeout.
    pub async fn call_default(
        &self,
        destination: &PeerId,
        payload: Value,
    ) -> Result<Value, RpcError> {
        self.call(destination, payload, self.default_timeout).await
    }

    /// `call` with serde encoding of the request and decoding of the reply.
    pub async fn call_typed<Req, Resp>(
        &self,
        destination: &PeerId,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(|e| RpcError::SendFailed {
            peer: destination.clone(),
            reason: format!("request not serializable: {e}"),
        })?;
        let reply = self.call(destination, payload, timeout).await?;
        serde_json::from_value(reply).map_err(|e| RpcError::Decode {
            peer: destination.clone(),
            reason: e.to_string(),
        })
    }

    /// `call` after checking `credential` with the configured authorizer.
    /// Without an authorizer every credential is refused.
    pub async fn call_authorized(
        &self,
        credential: &str,
        destination: &PeerId,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let verdict = match &self.authorizer {
            Some(authorizer) => authorizer
                .authorize(credential, destination)
                .map_err(|e| RpcError::Unauthorized(e.to_string())),
            None => Err(RpcError::Unauthorized("no authorizer configured".into())),
        };
        if let Err(e) = verdict {
            metric_inc!(CALLS_TOTAL, &[e.label()]);
            warn!(peer = %destination, error = %e, "Call refused");
            return Err(e);
        }
        self.call(destination, payload, timeout).await
    }

    /// Requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    async fn execute(
        &self,
        destination: &PeerId,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if let Err(e) = self.transport.ensure_ready(destination).await {
            return Err(RpcError::TransportUnavailable {
                peer: destination.clone(),
                reason: e.to_string(),
            });
        }

        let id = CorrelationId::new();
        // Registered before sending so a fast reply always finds its waiter
        let waiter = self
            .registry
            .register(id, destination.clone(), Instant::now() + timeout)?;

        let frame = Frame::request(id, destination.clone(), payload)
            .with_reply_to(self.transport.reply_address());

        if let Err(e) = self.transport.send(frame).await {
            self.registry.discard(&id);
            let reason = e.to_string();
            return Err(if e.is_not_connected() {
                RpcError::TransportUnavailable {
                    peer: destination.clone(),
                    reason,
                }
            } else {
                RpcError::SendFailed {
                    peer: destination.clone(),
                    reason,
                }
            });
        }
        log_call_event!(
            debug,
            "Request sent",
            id,
            destination,
            transport = self.transport.name()
        );

        match waiter.wait().await {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(error) => Err(RpcError::Remote {
                peer: destination.clone(),
                error,
            }),
            Outcome::Timeout => Err(RpcError::Timeout {
                peer: destination.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Outcome::Cancelled(_) => Err(RpcError::TransportLost {
                peer: destination.clone(),
            }),
        }
    }
}
