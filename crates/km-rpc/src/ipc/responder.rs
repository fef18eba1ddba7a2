//! Serving side of a request/reply exchange.
//!
//! Both responders (queue and socket) turn a `request` frame into exactly
//! one `response` or `error` frame carrying the same correlation id.

use tracing::{debug, warn};

use crate::domain::correlation::PeerId;
use crate::domain::frame::{Frame, FrameKind};
use crate::domain::types::RemoteError;
use crate::ports::inbound::{InboundEvent, RequestHandler};

/// Run `handler` for one request frame received from `source` and build the
/// reply sent back as `local`.
///
/// Returns `None` for frames that cannot be answered: anything that is not a
/// request, or a request without a correlation id.
pub async fn answer_request(
    handler: &dyn RequestHandler,
    local: &PeerId,
    source: PeerId,
    frame: Frame,
) -> Option<Frame> {
    if frame.kind != FrameKind::Request {
        debug!(peer = %source, kind = ?frame.kind, "Ignoring non-request frame");
        return None;
    }
    let Some(id) = frame.correlation_id else {
        warn!(peer = %source, "Request without correlation id dropped");
        return None;
    };

    let request = InboundEvent::from_frame(source, "request", frame);
    let reply = match handler.handle(request).await {
        Ok(body) => Frame::response(id, local.clone(), body),
        Err(error) => {
            debug!(correlation_id = %id, code = error.code, "Request answered with error");
            Frame::error(id, local.clone(), &error)
        }
    };
    Some(reply)
}

/// Reply for a request whose body could not be handled at all.
pub fn reject(frame: &Frame, local: &PeerId, error: RemoteError) -> Option<Frame> {
    frame
        .correlation_id
        .filter(|_| frame.kind == FrameKind::Request)
        .map(|id| Frame::error(id, local.clone(), &error))
}
