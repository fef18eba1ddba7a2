//! Serving side of the queue binding: consume a request queue, answer each
//! request on the queue named by its `reply_to`.

use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::correlation::PeerId;
use crate::domain::frame::Frame;
use crate::ipc::responder::answer_request;
use crate::ports::inbound::RequestHandler;
use crate::ports::outbound::{BrokerConnector, BrokerError, BrokerMessage, BrokerSession};

/// Generic message-queue request/reply handler.
pub struct QueueResponder {
    connector: Arc<dyn BrokerConnector>,
    queue: String,
    local: PeerId,
    handler: Arc<dyn RequestHandler>,
}

/// Running responder. Dropping it leaves the task running until the session
/// closes; call `stop` to end it.
pub struct ResponderHandle {
    session: Arc<dyn BrokerSession>,
    task: JoinHandle<()>,
}

impl ResponderHandle {
    pub async fn stop(self) {
        self.session.close().await;
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl QueueResponder {
    /// Serve `queue`, replying as `local`.
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        queue: impl Into<String>,
        local: PeerId,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            connector,
            queue: queue.into(),
            local,
            handler,
        }
    }

    /// Connect, declare the request queue and start answering.
    pub async fn start(self) -> Result<ResponderHandle, BrokerError> {
        let session = self.connector.connect().await?;
        session.declare_queue(&self.queue).await?;
        let mut requests = session.consume(&self.queue).await?;
        info!(queue = %self.queue, peer = %self.local, "Queue responder started");

        let replies = Arc::new(ReplyPublisher {
            session: Arc::clone(&session),
            declared: tokio::sync::Mutex::new(HashSet::new()),
        });
        let responder = Arc::new(self);
        let task = tokio::spawn(async move {
            while let Some(delivery) = requests.next().await {
                match delivery {
                    Ok(message) => {
                        let responder = Arc::clone(&responder);
                        let replies = Arc::clone(&replies);
                        tokio::spawn(async move { responder.serve(message, &replies).await });
                    }
                    Err(e) => {
                        warn!(queue = %responder.queue, error = %e, "Request stream failed");
                        break;
                    }
                }
            }
            debug!(queue = %responder.queue, "Queue responder stopped");
        });

        Ok(ResponderHandle { session, task })
    }

    async fn serve(&self, message: BrokerMessage, replies: &ReplyPublisher) {
        let frame = match Frame::decode(&message.body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Discarding malformed request");
                return;
            }
        };
        let Some(reply_to) = frame.reply_to.clone().or(message.reply_to) else {
            warn!(
                queue = %self.queue,
                correlation_id = ?frame.correlation_id,
                "Request without reply address dropped"
            );
            return;
        };

        let source = PeerId::new(reply_to.clone());
        let Some(reply) = answer_request(self.handler.as_ref(), &self.local, source, frame).await
        else {
            return;
        };
        if let Err(e) = replies.publish(&reply_to, &reply).await {
            warn!(
                queue = %reply_to,
                correlation_id = ?reply.correlation_id,
                error = %e,
                "Reply publish failed"
            );
        }
    }
}

struct ReplyPublisher {
    session: Arc<dyn BrokerSession>,
    declared: tokio::sync::Mutex<HashSet<String>>,
}

impl ReplyPublisher {
    async fn publish(&self, queue: &str, reply: &Frame) -> Result<(), BrokerError> {
        let body = reply
            .encode()
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        let message = BrokerMessage {
            body,
            correlation_id: reply.correlation_id.map(|id| id.to_string()),
            reply_to: None,
        };

        let mut declared = self.declared.lock().await;
        if !declared.contains(queue) {
            self.session.declare_queue(queue).await?;
            declared.insert(queue.to_string());
        }
        self.session.publish(queue, message).await
    }
}
