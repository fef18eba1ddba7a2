//! # Queue RPC Flows
//!
//! Gateway-side `QueueTransport` talking to agent-side `QueueResponder`s
//! through the in-process broker.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;
    use km_rpc::{
        Frame, InMemoryConnector, PeerId, QueueResponder, RpcError, TransportEvent,
        TransportHandle,
    };
    use rand::Rng;
    use serde_json::json;
    use shared_bus::{InMemoryBroker, QueuedMessage};

    use crate::integration::fixtures::{echo, fast_config, queue_service, sleep, CommandAgent};

    fn onboarding() -> PeerId {
        PeerId::from("onboarding")
    }

    async fn responder(broker: &Arc<InMemoryBroker>) -> km_rpc::adapters::ResponderHandle {
        QueueResponder::new(
            Arc::new(InMemoryConnector::new(Arc::clone(broker))),
            "onboarding",
            PeerId::from("onboarding-agent"),
            Arc::new(CommandAgent),
        )
        .start()
        .await
        .unwrap()
    }

    // =============================================================================
    // REPLIES
    // =============================================================================

    #[tokio::test]
    async fn test_fast_reply() {
        let broker = InMemoryBroker::new();
        let agent = responder(&broker).await;
        let mut service = queue_service(&broker, fast_config()).await;

        let reply = service
            .client()
            .call(&onboarding(), echo(json!("ready")), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(reply, json!("ready"));
        assert_eq!(service.registry().pending_count(), 0);
        service.shutdown().await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_replies_out_of_order() {
        let broker = InMemoryBroker::new();
        let agent = responder(&broker).await;
        let mut service = queue_service(&broker, fast_config()).await;
        let client = service.client();

        let agent_queue = onboarding();
        let slow = client.call(&agent_queue, sleep(200, json!("A")), Duration::from_secs(5));
        let fast = client.call(&agent_queue, sleep(0, json!("B")), Duration::from_secs(5));
        let (a, b) = tokio::join!(slow, fast);

        assert_eq!(a.unwrap(), json!("A"));
        assert_eq!(b.unwrap(), json!("B"));
        service.shutdown().await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_their_own_replies() {
        let broker = InMemoryBroker::new();
        let agent = responder(&broker).await;
        let mut service = queue_service(&broker, fast_config()).await;
        let client = service.client();

        let values: Vec<u64> = {
            let mut rng = rand::thread_rng();
            (0..50).map(|_| rng.gen_range(0..1_000_000)).collect()
        };
        let calls = values.iter().map(|v| {
            let client = Arc::clone(&client);
            let delay = v % 20;
            async move {
                client
                    .call(&onboarding(), sleep(delay, json!(v)), Duration::from_secs(5))
                    .await
            }
        });
        let replies = join_all(calls).await;

        for (value, reply) in values.iter().zip(replies) {
            assert_eq!(reply.unwrap(), json!(value));
        }
        assert_eq!(service.registry().pending_count(), 0);
        service.shutdown().await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_remote_error() {
        let broker = InMemoryBroker::new();
        let agent = responder(&broker).await;
        let mut service = queue_service(&broker, fast_config()).await;

        let result = service
            .client()
            .call(&onboarding(), json!({"cmd": "fail"}), Duration::from_secs(5))
            .await;

        match result {
            Err(RpcError::Remote { peer, error }) => {
                assert_eq!(peer, onboarding());
                assert_eq!(error.code, -32001);
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        service.shutdown().await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_between_pending_calls() {
        let broker = InMemoryBroker::new();
        let mut service = queue_service(&broker, fast_config()).await;
        let client = service.client();
        let result_queue = service.config().queue.result_queue.clone();

        // Hand-driven agent: collect both requests, then answer B, garbage, A
        let agent = broker.connect().unwrap();
        agent.declare_queue("onboarding").unwrap();
        let mut requests = agent.consume("onboarding").unwrap();
        let agent_task = tokio::spawn(async move {
            let mut frames = Vec::new();
            while frames.len() < 2 {
                let message = requests.recv().await.unwrap();
                frames.push(Frame::decode(&message.body).unwrap());
            }
            let reply = |frame: &Frame| {
                Frame::response(frame.correlation_id.unwrap(), onboarding(), frame.body.clone())
                    .encode()
                    .unwrap()
            };
            agent
                .publish(&result_queue, QueuedMessage::new(reply(&frames[1])))
                .await
                .unwrap();
            agent
                .publish(&result_queue, QueuedMessage::new(b"{not a frame".to_vec()))
                .await
                .unwrap();
            agent
                .publish(&result_queue, QueuedMessage::new(reply(&frames[0])))
                .await
                .unwrap();
        });

        let agent_queue = onboarding();
        let first = client.call(&agent_queue, json!("first"), Duration::from_secs(5));
        let second = async {
            while service.registry().pending_count() == 0 {
                tokio::task::yield_now().await;
            }
            client
                .call(&agent_queue, json!("second"), Duration::from_secs(5))
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), json!("first"));
        assert_eq!(second.unwrap(), json!("second"));
        agent_task.await.unwrap();
        service.shutdown().await;
    }

    // =============================================================================
    // TIMEOUTS
    // =============================================================================

    #[tokio::test]
    async fn test_timeout_leaves_no_entry_and_late_reply_is_dropped() {
        let broker = InMemoryBroker::new();
        let mut service = queue_service(&broker, fast_config()).await;
        let result_queue = service.config().queue.result_queue.clone();

        // Nobody consumes "silent"
        let result = service
            .client()
            .call(&PeerId::from("silent"), json!({}), Duration::from_millis(100))
            .await;
        assert_eq!(
            result,
            Err(RpcError::Timeout {
                peer: PeerId::from("silent"),
                timeout_ms: 100
            })
        );
        assert_eq!(service.registry().pending_count(), 0);

        // The agent wakes up and answers anyway
        let agent = broker.connect().unwrap();
        let mut requests = agent.consume("silent").unwrap();
        let stale = Frame::decode(&requests.recv().await.unwrap().body).unwrap();
        let late = Frame::response(stale.correlation_id.unwrap(), PeerId::from("silent"), json!(1));
        agent
            .publish(&result_queue, QueuedMessage::new(late.encode().unwrap()))
            .await
            .unwrap();

        let stats = service.registry();
        for _ in 0..100 {
            if stats.stats().total_late_replies.load(std::sync::atomic::Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            stats
                .stats()
                .total_late_replies
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(service.registry().pending_count(), 0);
        service.shutdown().await;
    }

    // =============================================================================
    // CONNECTION LOSS
    // =============================================================================

    #[tokio::test]
    async fn test_broker_drop_fails_pending_calls_then_recovers() {
        let broker = InMemoryBroker::new();
        let mut config = fast_config();
        config.queue.reconnect = km_rpc::ReconnectPolicy::Backoff {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: 0,
        };
        let mut service = queue_service(&broker, config).await;
        let client = service.client();
        let TransportHandle::Queue(queue) = service.transport().clone() else {
            unreachable!()
        };

        // Three calls nobody will answer
        let calls = (0..3).map(|i| {
            let client = Arc::clone(&client);
            async move {
                client
                    .call(&PeerId::from("silent"), json!(i), Duration::from_secs(30))
                    .await
            }
        });
        let crash = async {
            // Wait for all three requests to reach the broker, not just the
            // registry: a send cut off mid-flight is a different failure
            while broker.queue_depth("silent") != Some(3) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            broker.drop_connections();
        };
        let (results, ()) = tokio::join!(join_all(calls), crash);

        for result in results {
            assert_eq!(
                result,
                Err(RpcError::TransportLost {
                    peer: PeerId::from("silent")
                })
            );
        }
        assert_eq!(service.registry().pending_count(), 0);

        // The supervisor reconnects on its own
        queue.wait_connected(Duration::from_secs(2)).await.unwrap();
        let agent = responder(&broker).await;
        assert_eq!(
            client
                .call(&onboarding(), echo(json!("back")), Duration::from_secs(5))
                .await
                .unwrap(),
            json!("back")
        );
        service.shutdown().await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_broker_outage_reports_unavailable_and_fails_fast() {
        let broker = InMemoryBroker::new();
        let mut config = fast_config();
        config.queue.reconnect = km_rpc::ReconnectPolicy::Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(20),
            multiplier: 2.0,
            max_attempts: 3,
        };
        let mut service = queue_service(&broker, config).await;
        let mut events = service.client().transport().subscribe_events();

        broker.set_available(false);

        let attempts = loop {
            if let TransportEvent::Unavailable { attempts, .. } = events.recv().await.unwrap() {
                break attempts;
            }
        };
        assert_eq!(attempts, 3);

        let started = tokio::time::Instant::now();
        let result = service
            .client()
            .call(&onboarding(), json!({}), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(RpcError::TransportUnavailable { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        service.shutdown().await;
    }
}
