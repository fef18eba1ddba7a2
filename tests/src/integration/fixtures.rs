//! Agents and wiring shared by the integration flows.

use async_trait::async_trait;
use km_rpc::ports::outbound::{PeerEndpoint, StaticPeerDirectory};
use km_rpc::{
    Backend, InMemoryConnector, InboundEvent, PeerId, RemoteError, RequestHandler, RpcConfig,
    RpcService, SocketResponder,
};
use km_rpc::adapters::SocketResponderHandle;
use serde_json::{json, Value};
use shared_bus::InMemoryBroker;
use std::sync::Arc;
use std::time::Duration;

/// Agent that understands a handful of commands:
///
/// - `{"cmd": "echo", "value": v}` answers `v`
/// - `{"cmd": "sleep", "ms": n, "value": v}` answers `v` after `n` ms
/// - `{"cmd": "fail"}` answers with an error frame
pub struct CommandAgent;

#[async_trait]
impl RequestHandler for CommandAgent {
    async fn handle(&self, request: InboundEvent) -> Result<Value, RemoteError> {
        let body = request.body;
        match body.get("cmd").and_then(Value::as_str) {
            Some("echo") => Ok(body.get("value").cloned().unwrap_or(Value::Null)),
            Some("sleep") => {
                let ms = body.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(body.get("value").cloned().unwrap_or(Value::Null))
            }
            Some("fail") => Err(RemoteError::new(-32001, "command failed")),
            other => Err(RemoteError::invalid_params(format!("unknown command {other:?}"))),
        }
    }
}

pub fn echo(value: Value) -> Value {
    json!({"cmd": "echo", "value": value})
}

pub fn sleep(ms: u64, value: Value) -> Value {
    json!({"cmd": "sleep", "ms": ms, "value": value})
}

/// Configuration with short timers so flows finish quickly.
pub fn fast_config() -> RpcConfig {
    let mut config = RpcConfig::default();
    config.timeouts.default_call = Duration::from_secs(5);
    config.timeouts.connect = Duration::from_secs(2);
    config.registry.sweep_interval = Duration::from_millis(50);
    config
}

/// Started queue-backed service on `broker`.
pub async fn queue_service(broker: &Arc<InMemoryBroker>, config: RpcConfig) -> RpcService {
    let mut service = RpcService::new(
        config,
        Backend::Queue(Arc::new(InMemoryConnector::new(Arc::clone(broker)))),
    )
    .expect("valid config");
    service.start().expect("start");
    if let km_rpc::TransportHandle::Queue(queue) = service.transport() {
        queue
            .wait_connected(Duration::from_secs(2))
            .await
            .expect("broker connection");
    }
    service
}

/// Started socket-backed service resolving agents through `directory`.
pub fn socket_service(directory: Arc<StaticPeerDirectory>, config: RpcConfig) -> RpcService {
    let mut service = RpcService::new(config, Backend::Socket(directory)).expect("valid config");
    service.start().expect("start");
    service
}

/// Spawn a loopback agent and publish its address in `directory`.
pub async fn spawn_agent(directory: &StaticPeerDirectory, agent: &PeerId) -> SocketResponderHandle {
    let handle = SocketResponder::new(agent.clone(), Arc::new(CommandAgent))
        .bind("127.0.0.1:0")
        .await
        .expect("bind agent");
    directory.insert(
        agent.clone(),
        PeerEndpoint::with_port("127.0.0.1", handle.local_addr().port()),
    );
    handle
}
