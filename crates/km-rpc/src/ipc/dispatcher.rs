//! Inbound Dispatcher - routes every received frame exactly once.
//!
//! A frame either resolves a pending request, is dropped as a late reply,
//! or is handed to the event handler for its topic. Nothing a peer sends can
//! make `dispatch` fail.

use km_telemetry::{metric_inc, INBOUND_FRAMES};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::correlation::{CorrelationId, PeerId};
use crate::domain::frame::{Frame, FrameKind};
use crate::domain::pending::{CorrelationRegistry, ResolveStatus};
use crate::domain::types::Outcome;
use crate::ports::inbound::{EventHandler, InboundEvent};

/// Topic of the handler that receives events no other handler claims.
pub const FALLBACK_TOPIC: &str = "*";

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to the waiting caller.
    Resolved(CorrelationId),
    /// Reply for an id nobody waits for (timed out, duplicate, unknown).
    LateReply(CorrelationId),
    /// Accepted by an event handler.
    Event { topic: String },
    /// A handler exists but refused the event (full or closed).
    Dropped { topic: String },
    /// No handler for the topic and no fallback.
    Unhandled { topic: String },
    /// Could not be decoded.
    Malformed,
}

impl DispatchOutcome {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resolved(_) => "resolved",
            Self::LateReply(_) => "late_reply",
            Self::Event { .. } => "event",
            Self::Dropped { .. } => "dropped",
            Self::Unhandled { .. } => "unhandled",
            Self::Malformed => "malformed",
        }
    }
}

pub struct InboundDispatcher {
    registry: Arc<CorrelationRegistry>,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl InboundDispatcher {
    pub fn new(registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Register the handler for `topic`, replacing any previous one.
    pub fn register_handler(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        let topic = topic.into();
        debug!(topic = %topic, "Event handler registered");
        self.handlers.write().insert(topic, handler)
    }

    /// Register the handler for events no topic handler claims.
    pub fn set_fallback(&self, handler: Arc<dyn EventHandler>) -> Option<Arc<dyn EventHandler>> {
        self.register_handler(FALLBACK_TOPIC, handler)
    }

    pub fn remove_handler(&self, topic: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.write().remove(topic)
    }

    /// Route one raw transport message from `source`.
    ///
    /// `default_topic` names events whose frame carries no topic (for the
    /// socket transport, the connection's route).
    pub fn dispatch(&self, source: &PeerId, default_topic: &str, raw: &[u8]) -> DispatchOutcome {
        let outcome = match Frame::decode(raw) {
            Ok(frame) => self.route(source, default_topic, frame),
            Err(e) => {
                warn!(
                    peer = %source,
                    error = %e,
                    bytes = raw.len(),
                    "Discarding malformed frame"
                );
                DispatchOutcome::Malformed
            }
        };
        metric_inc!(INBOUND_FRAMES, &[outcome.label()]);
        outcome
    }

    /// Route an already decoded frame.
    pub fn dispatch_frame(
        &self,
        source: &PeerId,
        default_topic: &str,
        frame: Frame,
    ) -> DispatchOutcome {
        let outcome = self.route(source, default_topic, frame);
        metric_inc!(INBOUND_FRAMES, &[outcome.label()]);
        outcome
    }

    fn route(&self, source: &PeerId, default_topic: &str, frame: Frame) -> DispatchOutcome {
        if let Some(id) = frame.correlation_id {
            let answers_us = frame.kind.is_reply()
                || (frame.kind == FrameKind::Event && self.registry.is_pending(&id));
            if answers_us {
                return self.resolve(source, id, frame);
            }
        }
        self.deliver_event(InboundEvent::from_frame(source.clone(), default_topic, frame))
    }

    fn resolve(&self, source: &PeerId, id: CorrelationId, frame: Frame) -> DispatchOutcome {
        let outcome = match frame.kind {
            FrameKind::Error => Outcome::Failure(frame.remote_error()),
            _ => Outcome::Success(frame.body),
        };

        match self.registry.resolve(&id, outcome) {
            ResolveStatus::Resolved => DispatchOutcome::Resolved(id),
            ResolveStatus::Unknown | ResolveStatus::Abandoned => {
                info!(
                    correlation_id = %id,
                    peer = %source,
                    "Late or duplicate reply discarded"
                );
                DispatchOutcome::LateReply(id)
            }
        }
    }

    fn deliver_event(&self, event: InboundEvent) -> DispatchOutcome {
        let handler = {
            let handlers = self.handlers.read();
            handlers
                .get(&event.topic)
                .or_else(|| handlers.get(FALLBACK_TOPIC))
                .cloned()
        };
        let topic = event.topic.clone();

        let Some(handler) = handler else {
            debug!(topic = %topic, peer = %event.source, "No handler for inbound event");
            return DispatchOutcome::Unhandled { topic };
        };

        let source = event.source.clone();
        match handler.handle(event) {
            Ok(()) => DispatchOutcome::Event { topic },
            Err(e) => {
                warn!(topic = %topic, peer = %source, error = %e, "Event handler refused event");
                DispatchOutcome::Dropped { topic }
            }
        }
    }
}
