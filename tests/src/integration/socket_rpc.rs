//! # Socket RPC Flows
//!
//! Gateway-side `SocketTransport` against real agents listening on loopback.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;
    use futures::{SinkExt, StreamExt};
    use km_rpc::ports::outbound::{PeerEndpoint, StaticPeerDirectory};
    use km_rpc::{Frame, PeerId, RpcError, TransportEvent, TransportHandle};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    use crate::integration::fixtures::{echo, fast_config, sleep, socket_service, spawn_agent};

    fn agent(n: u8) -> PeerId {
        PeerId::from(format!("agent-{n}").as_str())
    }

    async fn connect(service: &km_rpc::RpcService, peer: &PeerId) {
        let TransportHandle::Socket(socket) = service.transport() else {
            unreachable!()
        };
        socket.connect(peer).await.unwrap();
    }

    // =============================================================================
    // REPLIES
    // =============================================================================

    #[tokio::test]
    async fn test_fast_reply() {
        let directory = Arc::new(StaticPeerDirectory::new());
        let agent_1 = spawn_agent(&directory, &agent(1)).await;
        let mut service = socket_service(Arc::clone(&directory), fast_config());
        connect(&service, &agent(1)).await;

        let reply = service
            .client()
            .call(&agent(1), echo(json!({"nodes": 3})), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(reply, json!({"nodes": 3}));
        service.shutdown().await;
        agent_1.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_fast() {
        let directory = Arc::new(StaticPeerDirectory::new());
        let mut config = fast_config();
        config.socket.lazy_connect = true;
        let mut service = socket_service(directory, config);

        let started = tokio::time::Instant::now();
        let result = service
            .client()
            .call(&agent(9), json!({}), Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(RpcError::TransportUnavailable { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(service.registry().pending_count(), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_agent_fails_fast() {
        // Known address, nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let directory = Arc::new(StaticPeerDirectory::new());
        directory.insert(agent(1), PeerEndpoint::with_port("127.0.0.1", port));
        let mut config = fast_config();
        config.socket.lazy_connect = true;
        let mut service = socket_service(directory, config);

        let result = service
            .client()
            .call(&agent(1), json!({}), Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(RpcError::TransportUnavailable { .. })));
        assert_eq!(service.registry().pending_count(), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_replies_out_of_order_on_one_connection() {
        let directory = Arc::new(StaticPeerDirectory::new());
        let agent_1 = spawn_agent(&directory, &agent(1)).await;
        let mut service = socket_service(Arc::clone(&directory), fast_config());
        connect(&service, &agent(1)).await;
        let client = service.client();

        let calls = (0..10u64).map(|i| {
            let client = Arc::clone(&client);
            // Later calls answer sooner
            async move {
                client
                    .call(&agent(1), sleep((10 - i) * 15, json!(i)), Duration::from_secs(5))
                    .await
            }
        });
        let replies = join_all(calls).await;

        for (i, reply) in replies.into_iter().enumerate() {
            assert_eq!(reply.unwrap(), json!(i));
        }
        service.shutdown().await;
        agent_1.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_between_pending_calls() {
        // Raw agent: reads two requests, answers the second, sends garbage,
        // answers the first
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let raw_agent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut frames = Vec::new();
            while frames.len() < 2 {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    frames.push(Frame::decode(text.as_bytes()).unwrap());
                }
            }
            let reply = |frame: &Frame| {
                Frame::response(frame.correlation_id.unwrap(), agent(1), frame.body.clone())
                    .to_text()
                    .unwrap()
            };
            ws.send(Message::Text(reply(&frames[1]).into())).await.unwrap();
            ws.send(Message::Text("{\"kind\":".to_string().into()))
                .await
                .unwrap();
            ws.send(Message::Text(reply(&frames[0]).into())).await.unwrap();
            // Hold the connection until the gateway hangs up
            while ws.next().await.is_some() {}
        });

        let directory = Arc::new(StaticPeerDirectory::new());
        directory.insert(agent(1), PeerEndpoint::with_port("127.0.0.1", port));
        let mut service = socket_service(directory, fast_config());
        connect(&service, &agent(1)).await;
        let client = service.client();

        let agent_1 = agent(1);
        let (first, second) = tokio::join!(
            client.call(&agent_1, json!("first"), Duration::from_secs(5)),
            client.call(&agent_1, json!("second"), Duration::from_secs(5)),
        );

        assert_eq!(first.unwrap(), json!("first"));
        assert_eq!(second.unwrap(), json!("second"));
        service.shutdown().await;
        raw_agent.await.unwrap();
    }

    // =============================================================================
    // CONNECTION LOSS
    // =============================================================================

    #[tokio::test]
    async fn test_agent_crash_fails_only_its_calls() {
        let directory = Arc::new(StaticPeerDirectory::new());
        let agent_1 = spawn_agent(&directory, &agent(1)).await;
        let agent_2 = spawn_agent(&directory, &agent(2)).await;
        let mut service = socket_service(Arc::clone(&directory), fast_config());
        connect(&service, &agent(1)).await;
        connect(&service, &agent(2)).await;
        let client = service.client();
        let mut events = client.transport().subscribe_events();

        let doomed = (0..3).map(|i| {
            let client = Arc::clone(&client);
            async move {
                client
                    .call(&agent(1), sleep(10_000, json!(i)), Duration::from_secs(30))
                    .await
            }
        });
        let agent_2_id = agent(2);
        let survivor = client.call(&agent_2_id, sleep(300, json!("ok")), Duration::from_secs(5));
        let crash = async {
            while service.registry().pending_for(&agent(1)) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            agent_1.drop_connections();
        };
        let (doomed, survivor, ()) = tokio::join!(join_all(doomed), survivor, crash);

        for result in doomed {
            assert_eq!(result, Err(RpcError::TransportLost { peer: agent(1) }));
        }
        assert_eq!(survivor.unwrap(), json!("ok"));
        assert_eq!(service.registry().pending_count(), 0);

        let cancelled = loop {
            if let TransportEvent::Disconnected {
                peer: Some(peer),
                cancelled,
                ..
            } = events.recv().await.unwrap()
            {
                assert_eq!(peer, agent(1));
                break cancelled;
            }
        };
        assert_eq!(cancelled, 3);

        service.shutdown().await;
        agent_1.shutdown().await;
        agent_2.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_on_live_connection() {
        let directory = Arc::new(StaticPeerDirectory::new());
        let agent_1 = spawn_agent(&directory, &agent(1)).await;
        let mut service = socket_service(Arc::clone(&directory), fast_config());
        connect(&service, &agent(1)).await;
        let client = service.client();

        let result = client
            .call(&agent(1), sleep(1_000, json!("late")), Duration::from_millis(100))
            .await;
        assert_eq!(
            result,
            Err(RpcError::Timeout {
                peer: agent(1),
                timeout_ms: 100
            })
        );
        assert_eq!(service.registry().pending_count(), 0);

        // The connection is still good for the next call
        assert_eq!(
            client
                .call(&agent(1), echo(json!(2)), Duration::from_secs(5))
                .await
                .unwrap(),
            json!(2)
        );
        service.shutdown().await;
        agent_1.shutdown().await;
    }

    // =============================================================================
    // EVENTS
    // =============================================================================

    #[tokio::test]
    async fn test_agent_events_reach_subscribers() {
        let directory = Arc::new(StaticPeerDirectory::new());
        let agent_1 = spawn_agent(&directory, &agent(1)).await;
        let mut service = socket_service(Arc::clone(&directory), fast_config());
        let mut pods = service.subscribe("pods");
        connect(&service, &agent(1)).await;

        while agent_1.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(agent_1.push_event("pods", json!({"running": 12})), 1);

        let event = pods.recv().await.unwrap();
        assert_eq!(event.source, agent(1));
        assert_eq!(event.topic, "pods");
        assert_eq!(event.body, json!({"running": 12}));
        service.shutdown().await;
        agent_1.shutdown().await;
    }
}
