//! Agent RPC service - wires registry, dispatcher, transport and client.
//!
//! The owning microservice builds one `RpcService` per transport, calls
//! `start`, and hands `client()` to whatever issues agent commands.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::adapters::queue::QueueTransport;
use crate::adapters::socket::SocketTransport;
use crate::domain::config::{ConfigError, RpcConfig};
use crate::domain::pending::CorrelationRegistry;
use crate::domain::types::CancelReason;
use crate::ipc::client::RpcClient;
use crate::ipc::dispatcher::InboundDispatcher;
use crate::ports::inbound::{ChannelEventHandler, InboundEvent};
use crate::ports::outbound::{BrokerConnector, CallAuthorizer, PeerDirectory, Transport};

/// Service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("service already started")]
    AlreadyStarted,
}

/// Where the service's transport reaches its peers.
pub enum Backend {
    /// Message queue broker.
    Queue(Arc<dyn BrokerConnector>),
    /// Per-agent WebSockets, addresses from the directory.
    Socket(Arc<dyn PeerDirectory>),
}

/// The concrete transport, for operations outside the `Transport` port.
#[derive(Clone)]
pub enum TransportHandle {
    Queue(Arc<QueueTransport>),
    Socket(Arc<SocketTransport>),
}

impl TransportHandle {
    fn as_transport(&self) -> Arc<dyn Transport> {
        match self {
            Self::Queue(t) => t.clone(),
            Self::Socket(t) => t.clone(),
        }
    }
}

/// One correlation layer over one transport.
pub struct RpcService {
    config: RpcConfig,
    registry: Arc<CorrelationRegistry>,
    dispatcher: Arc<InboundDispatcher>,
    transport: TransportHandle,
    client: Arc<RpcClient>,
    sweeper: Option<JoinHandle<()>>,
}

impl RpcService {
    /// Create a new service. Nothing runs until `start`.
    pub fn new(config: RpcConfig, backend: Backend) -> Result<Self, ServiceError> {
        config.validate()?;

        let registry = CorrelationRegistry::new();
        let dispatcher = Arc::new(InboundDispatcher::new(Arc::clone(&registry)));

        let transport = match backend {
            Backend::Queue(connector) => TransportHandle::Queue(Arc::new(QueueTransport::new(
                connector,
                Arc::clone(&dispatcher),
                config.queue.clone(),
                config.timeouts.connect,
            ))),
            Backend::Socket(directory) => {
                TransportHandle::Socket(Arc::new(SocketTransport::new(
                    directory,
                    Arc::clone(&dispatcher),
                    config.socket.clone(),
                    config.timeouts.connect,
                )))
            }
        };

        let client = Arc::new(RpcClient::new(
            Arc::clone(&registry),
            transport.as_transport(),
            config.timeouts.default_call,
        ));

        Ok(Self {
            config,
            registry,
            dispatcher,
            transport,
            client,
            sweeper: None,
        })
    }

    /// Require `authorizer` to approve every `call_authorized`.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn CallAuthorizer>) -> Self {
        self.client = Arc::new(
            RpcClient::new(
                Arc::clone(&self.registry),
                self.transport.as_transport(),
                self.config.timeouts.default_call,
            )
            .with_authorizer(authorizer),
        );
        self
    }

    /// Start the deadline sweep and the transport's background tasks.
    pub fn start(&mut self) -> Result<(), ServiceError> {
        if self.sweeper.is_some() {
            return Err(ServiceError::AlreadyStarted);
        }
        self.sweeper = Some(
            self.registry
                .spawn_sweeper(self.config.registry.sweep_interval),
        );
        match &self.transport {
            TransportHandle::Queue(t) => t.start(),
            TransportHandle::Socket(t) => t.start(),
        }
        info!(
            transport = self.client.transport().name(),
            default_timeout_ms = self.config.timeouts.default_call.as_millis() as u64,
            "Agent RPC service started"
        );
        Ok(())
    }

    /// Route events for `topic` into a bounded channel sized by
    /// `dispatcher.event_buffer`.
    pub fn subscribe(&self, topic: impl Into<String>) -> mpsc::Receiver<InboundEvent> {
        let (handler, rx) = ChannelEventHandler::new(self.config.dispatcher.event_buffer);
        self.dispatcher.register_handler(topic, Arc::new(handler));
        rx
    }

    /// Close the transport and cancel whatever is still pending.
    pub async fn shutdown(&mut self) {
        self.client.transport().close().await;
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        let cancelled = self.registry.cancel_all(CancelReason::Shutdown);
        info!(cancelled, "Agent RPC service stopped");
    }

    pub fn client(&self) -> Arc<RpcClient> {
        Arc::clone(&self.client)
    }

    pub fn dispatcher(&self) -> Arc<InboundDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn registry(&self) -> Arc<CorrelationRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }
}
