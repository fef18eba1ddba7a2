//! Broker port backed by the in-process `shared-bus` broker.

use async_trait::async_trait;
use futures::StreamExt;
use shared_bus::{BrokerConnection, BusError, InMemoryBroker, QueuedMessage};
use std::sync::Arc;

use crate::ports::outbound::{
    BrokerConnector, BrokerError, BrokerMessage, BrokerSession, DeliveryStream,
};

impl From<BusError> for BrokerError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Unavailable => BrokerError::Unavailable(err.to_string()),
            BusError::ConnectionClosed => BrokerError::ConnectionClosed,
            BusError::QueueNotFound(queue) => BrokerError::Queue(format!("not declared: {queue}")),
        }
    }
}

/// Opens sessions on a shared in-memory broker.
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let connection = self.broker.connect()?;
        Ok(Arc::new(InMemorySession { connection }))
    }
}

struct InMemorySession {
    connection: BrokerConnection,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        Ok(self.connection.declare_queue(queue)?)
    }

    async fn publish(&self, queue: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        let mut queued = QueuedMessage::new(message.body);
        queued.correlation_id = message.correlation_id;
        queued.reply_to = message.reply_to;
        Ok(self.connection.publish(queue, queued).await?)
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self.connection.consume(queue)?;
        Ok(consumer
            .into_stream()
            .map(|msg| {
                Ok(BrokerMessage {
                    body: msg.body,
                    correlation_id: msg.correlation_id,
                    reply_to: msg.reply_to,
                })
            })
            .boxed())
    }

    async fn close(&self) {
        self.connection.close();
    }
}
