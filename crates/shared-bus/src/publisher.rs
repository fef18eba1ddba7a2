//! # Broker and Connections
//!
//! The publishing side of the broker: connection lifecycle, queue
//! declaration and confirmed publish.

use crate::message::{BusError, QueuedMessage};
use crate::subscriber::QueueConsumer;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A durable named queue.
///
/// The receiver sits behind an async mutex so that several consumers can
/// compete for messages while each message is handed to exactly one of them.
pub(crate) struct Queue {
    pub(crate) name: String,
    sender: mpsc::UnboundedSender<QueuedMessage>,
    pub(crate) receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    pub(crate) depth: AtomicUsize,
}

impl Queue {
    fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            depth: AtomicUsize::new(0),
        }
    }
}

/// In-memory broker.
///
/// Queues live on the broker, not on connections, so messages published
/// while no consumer is attached are kept until one arrives.
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    /// Close signals for every live connection.
    connections: Mutex<Vec<Arc<watch::Sender<bool>>>>,
    available: AtomicBool,
    messages_published: AtomicU64,
    connections_opened: AtomicU64,
}

impl InMemoryBroker {
    /// Create a new, available broker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: RwLock::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
        })
    }

    /// Open a connection.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] while the broker is marked unavailable.
    pub fn connect(self: &Arc<Self>) -> Result<BrokerConnection, BusError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable);
        }

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        {
            let mut connections = self.connections.lock();
            connections.retain(|c| !*c.borrow());
            connections.push(Arc::clone(&closed));
        }
        let id = self.connections_opened.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(connection = id, "Broker connection opened");

        Ok(BrokerConnection {
            id,
            broker: Arc::clone(self),
            closed,
        })
    }

    /// Close every live connection. Their consumer streams end.
    pub fn drop_connections(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        let count = connections.len();
        for closed in connections {
            closed.send_replace(true);
        }
        warn!(connections = count, "Broker dropped all connections");
    }

    /// Mark the broker (un)available. Going unavailable also drops every
    /// live connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            info!("Broker available");
        } else {
            self.drop_connections();
        }
    }

    /// Whether new connections are accepted.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of messages waiting in a queue, if it exists.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.queues
            .read()
            .get(queue)
            .map(|q| q.depth.load(Ordering::SeqCst))
    }

    /// Whether a queue has been declared.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.read().contains_key(queue)
    }

    /// Total messages accepted since creation.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Number of connections that are currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| !*c.borrow())
            .count()
    }

    fn declare(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = self.queues.read().get(name) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write();
        Arc::clone(
            queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Queue::new(name))),
        )
    }

    fn lookup(&self, name: &str) -> Result<Arc<Queue>, BusError> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::QueueNotFound(name.to_string()))
    }
}

/// A connection to the broker.
///
/// All operations fail with [`BusError::ConnectionClosed`] once the
/// connection has been closed, either locally or by the broker.
pub struct BrokerConnection {
    id: u64,
    broker: Arc<InMemoryBroker>,
    closed: Arc<watch::Sender<bool>>,
}

impl BrokerConnection {
    /// Connection number, unique per broker.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Declare a durable queue. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionClosed`] on a closed connection.
    pub fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        let _ = self.broker.declare(name);
        debug!(connection = self.id, queue = name, "Queue declared");
        Ok(())
    }

    /// Publish a message to a declared queue and wait for the broker to
    /// confirm it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionClosed`] on a closed connection and
    /// [`BusError::QueueNotFound`] for an undeclared queue.
    pub async fn publish(&self, queue: &str, message: QueuedMessage) -> Result<(), BusError> {
        self.ensure_open()?;
        let target = self.broker.lookup(queue)?;

        target.depth.fetch_add(1, Ordering::SeqCst);
        if target.sender.send(message).is_err() {
            target.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::QueueNotFound(queue.to_string()));
        }
        self.broker.messages_published.fetch_add(1, Ordering::Relaxed);

        // Give consumers on the current-thread runtime a chance to run
        // before the confirm is reported.
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Start consuming a declared queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionClosed`] on a closed connection and
    /// [`BusError::QueueNotFound`] for an undeclared queue.
    pub fn consume(&self, queue: &str) -> Result<QueueConsumer, BusError> {
        self.ensure_open()?;
        let target = self.broker.lookup(queue)?;
        debug!(connection = self.id, queue, "Consumer attached");
        Ok(QueueConsumer::new(target, self.closed.subscribe()))
    }

    /// Close the connection. Consumers opened on it stop.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(connection = self.id, "Broker connection closed");
        }
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
