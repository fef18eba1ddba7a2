//! Message-queue transport.
//!
//! One broker session carries every request. Replies arrive on a single
//! durable result queue and are fed to the dispatcher by the supervisor task,
//! which also owns reconnection.

use async_trait::async_trait;
use futures::StreamExt;
use km_telemetry::{log_peer_event, metric_inc, TRANSPORT_EVENTS};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::config::QueueConfig;
use crate::domain::correlation::PeerId;
use crate::domain::frame::Frame;
use crate::domain::state::{ConnectionState, TransportEvent};
use crate::domain::types::CancelReason;
use crate::ipc::dispatcher::InboundDispatcher;
use crate::ports::outbound::{
    BrokerConnector, BrokerError, BrokerMessage, BrokerSession, DeliveryStream, Transport,
    TransportError,
};

const TRANSPORT_NAME: &str = "queue";

impl From<BrokerError> for TransportError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(_) | BrokerError::ConnectionClosed => {
                TransportError::NotConnected
            }
            other => TransportError::Send(other.to_string()),
        }
    }
}

/// A live broker session plus the queues declared on it. The async mutex
/// serialises publishes on the session's channel.
struct Link {
    session: Arc<dyn BrokerSession>,
    declared: tokio::sync::Mutex<HashSet<String>>,
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    dispatcher: Arc<InboundDispatcher>,
    config: QueueConfig,
    connect_timeout: Duration,
    link: RwLock<Option<Arc<Link>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
}

/// Transport over a message broker (`BrokerConnector` port).
pub struct QueueTransport {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl QueueTransport {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        dispatcher: Arc<InboundDispatcher>,
        config: QueueConfig,
        connect_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                dispatcher,
                config,
                connect_timeout,
                link: RwLock::new(None),
                state,
                events,
                reconnect: Notify::new(),
                shutdown,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Spawn the supervisor task. It connects, consumes the result queue and
    /// reconnects per the configured policy until `close`.
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(tokio::spawn(async move { inner.supervise().await }));
    }

    /// Wait until the session is connected, at most `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.inner.state.subscribe();
        let connected = state.wait_for(|s| *s == ConnectionState::Connected);
        let outcome = match tokio::time::timeout(timeout, connected).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        };
        outcome
    }

    /// Ask a waiting supervisor to try again. Used with the manual policy and
    /// after backoff is exhausted. Ignored unless the session is down, so a
    /// request made while connected cannot trigger a later reconnect.
    pub fn reconnect(&self) {
        if self.supervisor.lock().is_none()
            || self.connection_state() != ConnectionState::Disconnected
        {
            debug!(transport = TRANSPORT_NAME, "Reconnect ignored, session not down");
            return;
        }
        self.inner.reconnect.notify_one();
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn result_queue(&self) -> &str {
        &self.inner.config.result_queue
    }
}

impl Inner {
    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state.send_replace(ConnectionState::Connecting);

            match self.open().await {
                Ok(deliveries) => {
                    attempt = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    self.emit(TransportEvent::Connected { peer: None });
                    info!(
                        transport = TRANSPORT_NAME,
                        result_queue = %self.config.result_queue,
                        "Broker session established"
                    );

                    let reason = self.pump(deliveries, &mut shutdown).await;
                    if *shutdown.borrow() {
                        break;
                    }
                    self.lose_link(&reason).await;
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    warn!(transport = TRANSPORT_NAME, error = %e, attempt, "Broker connect failed");
                }
            }

            match self.config.reconnect.delay_for(attempt) {
                Some(delay) => {
                    attempt += 1;
                    self.emit(TransportEvent::Reconnecting {
                        peer: None,
                        attempt,
                        delay,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    if !self.config.reconnect.is_manual() {
                        warn!(
                            transport = TRANSPORT_NAME,
                            attempts = attempt,
                            "Reconnect attempts exhausted, broker unavailable"
                        );
                        self.emit(TransportEvent::Unavailable {
                            peer: None,
                            attempts: attempt,
                        });
                    }
                    tokio::select! {
                        _ = self.reconnect.notified() => {
                            debug!(transport = TRANSPORT_NAME, "Reconnect requested");
                            attempt = 0;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        debug!(transport = TRANSPORT_NAME, "Supervisor stopped");
    }

    /// Connect, declare the queues and start consuming results.
    async fn open(&self) -> Result<DeliveryStream, BrokerError> {
        let session = tokio::time::timeout(self.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                BrokerError::Unavailable(format!("connect timed out after {:?}", self.connect_timeout))
            })??;

        let mut declared = HashSet::new();
        session.declare_queue(&self.config.result_queue).await?;
        declared.insert(self.config.result_queue.clone());
        for queue in &self.config.request_queues {
            session.declare_queue(queue).await?;
            declared.insert(queue.clone());
        }
        let deliveries = session.consume(&self.config.result_queue).await?;

        *self.link.write() = Some(Arc::new(Link {
            session,
            declared: tokio::sync::Mutex::new(declared),
        }));
        Ok(deliveries)
    }

    /// Feed result-queue deliveries to the dispatcher until the stream ends.
    /// Returns why it ended.
    async fn pump(
        &self,
        mut deliveries: DeliveryStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> String {
        let source = PeerId::new(self.config.result_queue.clone());
        loop {
            tokio::select! {
                delivery = deliveries.next() => match delivery {
                    Some(Ok(message)) => {
                        self.dispatcher
                            .dispatch(&source, &self.config.result_queue, &message.body);
                    }
                    Some(Err(e)) => return e.to_string(),
                    None => return "result stream ended".to_string(),
                },
                _ = shutdown.changed() => return "shutdown".to_string(),
            }
        }
    }

    /// The session is gone: cancel everything that rode on it.
    async fn lose_link(&self, reason: &str) {
        self.state.send_replace(ConnectionState::Disconnected);
        let link = self.link.write().take();
        if let Some(link) = link {
            link.session.close().await;
        }
        let cancelled = self
            .dispatcher
            .registry()
            .cancel_all(CancelReason::ConnectionLost);
        warn!(
            transport = TRANSPORT_NAME,
            reason,
            cancelled,
            "Broker session lost"
        );
        self.emit(TransportEvent::Disconnected {
            peer: None,
            reason: reason.to_string(),
            cancelled,
        });
    }

    fn emit(&self, event: TransportEvent) {
        metric_inc!(TRANSPORT_EVENTS, &[TRANSPORT_NAME, event.label()]);
        let _ = self.events.send(event);
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.read().clone()
    }
}

#[async_trait]
impl Transport for QueueTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn state(&self, _peer: &PeerId) -> ConnectionState {
        self.connection_state()
    }

    async fn ensure_ready(&self, _peer: &PeerId) -> Result<(), TransportError> {
        match self.connection_state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn reply_address(&self) -> Option<String> {
        Some(self.inner.config.result_queue.clone())
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let link = self.inner.current_link().ok_or(TransportError::NotConnected)?;
        let queue = frame.peer.as_str().to_string();
        let message = BrokerMessage {
            body: frame.encode()?,
            correlation_id: frame.correlation_id.map(|id| id.to_string()),
            reply_to: frame.reply_to.clone(),
        };

        let mut declared = link.declared.lock().await;
        if !declared.contains(&queue) {
            link.session.declare_queue(&queue).await?;
            declared.insert(queue.clone());
        }
        link.session.publish(&queue, message).await?;
        log_peer_event!(debug, TRANSPORT_NAME, "Frame published", frame.peer, kind = ?frame.kind);
        Ok(())
    }

    async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        let link = self.inner.link.write().take();
        if let Some(link) = link {
            link.session.close().await;
        }
        let cancelled = self
            .inner
            .dispatcher
            .registry()
            .cancel_all(CancelReason::Shutdown);
        info!(transport = TRANSPORT_NAME, cancelled, "Transport closed");
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for QueueTransport {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}
