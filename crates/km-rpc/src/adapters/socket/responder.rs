//! Agent side of the WebSocket binding.
//!
//! Accepts gateway connections, answers `request` frames concurrently (so
//! replies may leave out of order) and pushes unsolicited `event` frames.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::domain::correlation::PeerId;
use crate::domain::frame::{Frame, FrameKind};
use crate::ipc::responder::answer_request;
use crate::ports::inbound::RequestHandler;

/// One accepted gateway connection.
struct Gateway {
    outbound: mpsc::UnboundedSender<Message>,
    kill: Arc<Notify>,
}

/// Serves requests from gateways over WebSocket.
pub struct SocketResponder {
    local: PeerId,
    handler: Arc<dyn RequestHandler>,
}

/// A bound, running responder.
pub struct SocketResponderHandle {
    local: PeerId,
    local_addr: SocketAddr,
    gateways: Arc<DashMap<u64, Gateway>>,
    acceptor: JoinHandle<()>,
}

impl SocketResponder {
    /// Answer requests as `local`.
    pub fn new(local: PeerId, handler: Arc<dyn RequestHandler>) -> Self {
        Self { local, handler }
    }

    /// Bind and start accepting connections.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> io::Result<SocketResponderHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, peer = %self.local, "Socket responder listening");

        let gateways: Arc<DashMap<u64, Gateway>> = Arc::new(DashMap::new());
        let responder = Arc::new(self);
        let acceptor = {
            let gateways = Arc::clone(&gateways);
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                let mut next_id: u64 = 0;
                loop {
                    let (stream, remote) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    next_id += 1;
                    let id = next_id;
                    tokio::spawn(Arc::clone(&responder).serve_connection(
                        id,
                        stream,
                        remote,
                        Arc::clone(&gateways),
                    ));
                }
            })
        };

        Ok(SocketResponderHandle {
            local: responder.local.clone(),
            local_addr,
            gateways,
            acceptor,
        })
    }

    async fn serve_connection(
        self: Arc<Self>,
        id: u64,
        stream: TcpStream,
        remote: SocketAddr,
        gateways: Arc<DashMap<u64, Gateway>>,
    ) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(remote = %remote, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let (mut sink, mut source) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let kill = Arc::new(Notify::new());
        gateways.insert(
            id,
            Gateway {
                outbound: outbound.clone(),
                kill: Arc::clone(&kill),
            },
        );
        debug!(remote = %remote, connection = id, "Gateway connected");

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let source_peer = PeerId::new(remote.to_string());
        loop {
            tokio::select! {
                message = source.next() => match message {
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                        let frame = match Frame::decode(&message.into_data()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(remote = %remote, error = %e, "Discarding malformed frame");
                                continue;
                            }
                        };
                        if frame.kind != FrameKind::Request {
                            debug!(remote = %remote, kind = ?frame.kind, "Ignoring non-request frame");
                            continue;
                        }
                        let responder = Arc::clone(&self);
                        let outbound = outbound.clone();
                        let source_peer = source_peer.clone();
                        tokio::spawn(async move {
                            let reply = answer_request(
                                responder.handler.as_ref(),
                                &responder.local,
                                source_peer,
                                frame,
                            )
                            .await;
                            if let Some(text) = reply.and_then(|r| r.to_text().ok()) {
                                let _ = outbound.send(Message::Text(text.into()));
                            }
                        });
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(remote = %remote, error = %e, "Gateway read failed");
                        break;
                    }
                },
                _ = kill.notified() => {
                    debug!(remote = %remote, connection = id, "Connection dropped");
                    break;
                }
            }
        }

        gateways.remove(&id);
        writer.abort();
        debug!(remote = %remote, connection = id, "Gateway disconnected");
    }
}

impl SocketResponderHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.gateways.len()
    }

    /// Push an event to every connected gateway. Returns how many took it.
    pub fn push_event(&self, topic: &str, body: Value) -> usize {
        let Ok(text) = Frame::event(self.local.clone(), topic, body).to_text() else {
            return 0;
        };
        self.gateways
            .iter()
            .filter(|gateway| {
                gateway
                    .outbound
                    .send(Message::Text(text.clone().into()))
                    .is_ok()
            })
            .count()
    }

    /// Cut every connection without a close handshake, as a crashed agent
    /// would.
    pub fn drop_connections(&self) {
        for gateway in self.gateways.iter() {
            gateway.kill.notify_one();
        }
    }

    /// Stop accepting and close every connection.
    pub async fn shutdown(self) {
        self.acceptor.abort();
        self.drop_connections();
        let _ = self.acceptor.await;
    }
}
