//! WebSocket transport: one long-lived connection per agent.
//!
//! The gateway dials `scheme://host:agent_port/path` for each agent. A reader
//! task per connection feeds the dispatcher and keeps the link alive with
//! pings; writes to a connection are serialised by its sink mutex.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use km_telemetry::{log_peer_event, metric_inc, TRANSPORT_EVENTS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::domain::config::SocketConfig;
use crate::domain::correlation::PeerId;
use crate::domain::frame::Frame;
use crate::domain::state::{ConnectionState, TransportEvent};
use crate::domain::types::CancelReason;
use crate::ipc::dispatcher::InboundDispatcher;
use crate::ports::outbound::{PeerDirectory, Transport, TransportError};

const TRANSPORT_NAME: &str = "socket";

/// Default topic for events pushed over an agent connection.
pub const AGENT_TOPIC: &str = "agent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Live connection to one agent. `generation` tells a reader whether the
/// registry entry it would remove is still its own.
struct PeerLink {
    generation: u64,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    directory: Arc<dyn PeerDirectory>,
    dispatcher: Arc<InboundDispatcher>,
    config: SocketConfig,
    connect_timeout: Duration,
    peers: DashMap<PeerId, Arc<PeerLink>>,
    connecting: DashSet<PeerId>,
    /// One dial at a time per peer
    dials: DashMap<PeerId, Arc<tokio::sync::Mutex<()>>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
    reconnect_tx: mpsc::UnboundedSender<PeerId>,
    shutdown: watch::Sender<bool>,
}

/// Transport over per-agent WebSocket connections.
pub struct SocketTransport {
    inner: Arc<Inner>,
    reconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerId>>>,
    reconnector: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        dispatcher: Arc<InboundDispatcher>,
        config: SocketConfig,
        connect_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                directory,
                dispatcher,
                config,
                connect_timeout,
                peers: DashMap::new(),
                connecting: DashSet::new(),
                dials: DashMap::new(),
                next_generation: AtomicU64::new(1),
                events,
                reconnect_tx,
                shutdown,
            }),
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            reconnector: Mutex::new(None),
        }
    }

    /// Spawn the task that reconnects dropped agents when the policy is
    /// backoff. Without it dropped connections stay down until `connect`.
    pub fn start(&self) {
        let Some(mut requests) = self.reconnect_rx.lock().take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut shutdown = inner.shutdown.subscribe();
            loop {
                tokio::select! {
                    peer = requests.recv() => match peer {
                        Some(peer) => {
                            tokio::spawn(Arc::clone(&inner).reconnect_with_backoff(peer));
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.reconnector.lock() = Some(task);
    }

    /// Open (or replace) the connection to `peer`.
    pub async fn connect(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.inner.connect_peer(peer, true).await
    }

    /// Close the connection to `peer`. Its pending requests fail with
    /// `TransportLost`.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        let Some((_, link)) = self.inner.peers.remove(peer) else {
            return false;
        };
        self.inner
            .retire(peer, link, CancelReason::ConnectionLost, "disconnected by owner")
            .await;
        true
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.peers.contains_key(peer)
    }
}

impl Inner {
    /// Dial `peer`. Dials to the same peer are serialised; unless `replace`
    /// is set, a caller that finds a live connection once its turn comes
    /// keeps it instead of dialing again.
    async fn connect_peer(
        self: &Arc<Self>,
        peer: &PeerId,
        replace: bool,
    ) -> Result<(), TransportError> {
        let gate = Arc::clone(self.dials.entry(peer.clone()).or_default().value());
        let _dialing = gate.lock().await;
        if !replace && self.peers.contains_key(peer) {
            return Ok(());
        }

        let endpoint = self
            .directory
            .lookup(peer)
            .await
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        let url = format!(
            "{}://{}:{}{}",
            self.config.scheme,
            endpoint.host,
            endpoint.port.unwrap_or(self.config.agent_port),
            self.config.path
        );

        self.connecting.insert(peer.clone());
        let connected = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await;
        self.connecting.remove(peer);

        let (stream, _) = match connected {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                log_peer_event!(warn, TRANSPORT_NAME, "Agent connect failed", peer, url = %url, error = %e);
                return Err(TransportError::Connect(e.to_string()));
            }
            Err(_) => {
                log_peer_event!(warn, TRANSPORT_NAME, "Agent connect timed out", peer, url = %url);
                return Err(TransportError::ConnectTimeout(self.connect_timeout));
            }
        };

        // The previous entry is gone before the new one is visible
        if let Some((_, old)) = self.peers.remove(peer) {
            self.retire(peer, old, CancelReason::Superseded, "superseded by new connection")
                .await;
        }

        let (sink, source) = stream.split();
        let link = Arc::new(PeerLink {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            sink: tokio::sync::Mutex::new(sink),
            reader: Mutex::new(None),
        });
        self.peers.insert(peer.clone(), Arc::clone(&link));

        let reader = tokio::spawn(Arc::clone(self).read_loop(
            peer.clone(),
            Arc::clone(&link),
            source,
        ));
        *link.reader.lock() = Some(reader);

        log_peer_event!(info, TRANSPORT_NAME, "Agent connected", peer, url = %url, generation = link.generation);
        self.emit(TransportEvent::Connected {
            peer: Some(peer.clone()),
        });
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        peer: PeerId,
        link: Arc<PeerLink>,
        mut source: SplitStream<WsStream>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut keepalive = tokio::time::interval(self.config.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        keepalive.tick().await;

        let reason = loop {
            tokio::select! {
                message = source.next() => match message {
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                        let data = message.into_data();
                        if data.len() > self.config.max_message_size {
                            warn!(
                                peer = %peer,
                                bytes = data.len(),
                                limit = self.config.max_message_size,
                                "Oversized message discarded"
                            );
                            continue;
                        }
                        self.dispatcher.dispatch(&peer, AGENT_TOPIC, &data);
                    }
                    // tungstenite queues the pong for a ping itself
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break "closed by agent".to_string(),
                    Some(Err(e)) => break e.to_string(),
                },
                _ = keepalive.tick() => {
                    let sent = link.sink.lock().await.send(Message::Ping(Vec::new().into())).await;
                    if let Err(e) = sent {
                        break format!("keepalive failed: {e}");
                    }
                }
                _ = shutdown.changed() => return,
            }
        };

        // A newer connection may already own the entry
        let removed = self
            .peers
            .remove_if(&peer, |_, current| current.generation == link.generation)
            .is_some();
        if !removed {
            debug!(peer = %peer, generation = link.generation, "Stale reader exited");
            return;
        }

        let cancelled = self
            .dispatcher
            .registry()
            .cancel_destination(&peer, CancelReason::ConnectionLost);
        log_peer_event!(warn, TRANSPORT_NAME, "Agent connection lost", peer, reason = %reason, cancelled);
        self.emit(TransportEvent::Disconnected {
            peer: Some(peer.clone()),
            reason,
            cancelled,
        });

        if !self.config.reconnect.is_manual() {
            let _ = self.reconnect_tx.send(peer);
        }
    }

    async fn reconnect_with_backoff(self: Arc<Self>, peer: PeerId) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        while let Some(delay) = self.config.reconnect.delay_for(attempt) {
            attempt += 1;
            self.emit(TransportEvent::Reconnecting {
                peer: Some(peer.clone()),
                attempt,
                delay,
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            if self.peers.contains_key(&peer) {
                return;
            }
            match self.connect_peer(&peer, false).await {
                Ok(()) => return,
                Err(e) => debug!(peer = %peer, attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        log_peer_event!(warn, TRANSPORT_NAME, "Reconnect attempts exhausted", peer, attempts = attempt);
        self.emit(TransportEvent::Unavailable {
            peer: Some(peer),
            attempts: attempt,
        });
    }

    /// Tear down a connection that is no longer in the registry.
    async fn retire(&self, peer: &PeerId, link: Arc<PeerLink>, reason: CancelReason, why: &str) {
        let reader = link.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        let _ = link.sink.lock().await.close().await;

        let cancelled = self.dispatcher.registry().cancel_destination(peer, reason);
        log_peer_event!(info, TRANSPORT_NAME, "Agent connection closed", peer, reason = why, cancelled);
        self.emit(TransportEvent::Disconnected {
            peer: Some(peer.clone()),
            reason: why.to_string(),
            cancelled,
        });
    }

    fn emit(&self, event: TransportEvent) {
        metric_inc!(TRANSPORT_EVENTS, &[TRANSPORT_NAME, event.label()]);
        let _ = self.events.send(event);
    }

    fn link(&self, peer: &PeerId) -> Option<Arc<PeerLink>> {
        self.peers.get(peer).map(|entry| Arc::clone(entry.value()))
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn state(&self, peer: &PeerId) -> ConnectionState {
        if self.inner.peers.contains_key(peer) {
            ConnectionState::Connected
        } else if self.inner.connecting.contains(peer) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn ensure_ready(&self, peer: &PeerId) -> Result<(), TransportError> {
        if self.inner.peers.contains_key(peer) {
            return Ok(());
        }
        if self.inner.config.lazy_connect {
            return self.inner.connect_peer(peer, false).await;
        }
        Err(TransportError::PeerNotConnected(peer.clone()))
    }

    fn reply_address(&self) -> Option<String> {
        None
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let link = self
            .inner
            .link(&frame.peer)
            .ok_or_else(|| TransportError::PeerNotConnected(frame.peer.clone()))?;
        let text = frame.to_text()?;

        link.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        log_peer_event!(debug, TRANSPORT_NAME, "Frame sent", frame.peer, kind = ?frame.kind);
        Ok(())
    }

    async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let reconnector = self.reconnector.lock().take();
        if let Some(task) = reconnector {
            task.abort();
        }

        for peer in self.connected_peers() {
            if let Some((_, link)) = self.inner.peers.remove(&peer) {
                self.inner
                    .retire(&peer, link, CancelReason::Shutdown, "transport closed")
                    .await;
            }
        }
        info!(transport = TRANSPORT_NAME, "Transport closed");
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}
