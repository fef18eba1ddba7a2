//! # Queue Consumer
//!
//! The consuming side of the broker.

use crate::message::QueuedMessage;
use crate::publisher::Queue;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A consumer attached to one queue through one connection.
///
/// Ends (returns `None`) once its connection is closed.
pub struct QueueConsumer {
    queue: Arc<Queue>,
    closed: watch::Receiver<bool>,
}

impl QueueConsumer {
    pub(crate) fn new(queue: Arc<Queue>, closed: watch::Receiver<bool>) -> Self {
        Self { queue, closed }
    }

    /// Name of the consumed queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue.name
    }

    /// Receive the next message.
    ///
    /// # Returns
    ///
    /// - `Some(message)` - The next message taken from the queue
    /// - `None` - The connection was closed
    pub async fn recv(&mut self) -> Option<QueuedMessage> {
        if *self.closed.borrow() {
            return None;
        }

        let queue = Arc::clone(&self.queue);
        let closed = &mut self.closed;
        tokio::select! {
            biased;
            () = wait_closed(closed) => {
                debug!(queue = %queue.name, "Consumer stopped, connection closed");
                None
            }
            msg = async { queue.receiver.lock().await.recv().await } => {
                if msg.is_some() {
                    queue.depth.fetch_sub(1, Ordering::SeqCst);
                }
                msg
            }
        }
    }

    /// Convert into a boxed stream for use with stream combinators.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, QueuedMessage> {
        stream::unfold(self, |mut consumer| async move {
            consumer.recv().await.map(|msg| (msg, consumer))
        })
        .boxed()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}
