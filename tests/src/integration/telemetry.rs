//! # Telemetry Flows
//!
//! Calls and transport lifecycle show up in the Prometheus registry.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use km_rpc::{InMemoryConnector, PeerId, QueueResponder};
    use serde_json::json;
    use shared_bus::InMemoryBroker;

    use crate::integration::fixtures::{echo, fast_config, queue_service, CommandAgent};

    #[tokio::test]
    async fn test_calls_are_counted() -> anyhow::Result<()> {
        km_telemetry::register_metrics()?;
        let broker = InMemoryBroker::new();
        let agent = QueueResponder::new(
            Arc::new(InMemoryConnector::new(Arc::clone(&broker))),
            "metrics",
            PeerId::from("metrics-agent"),
            Arc::new(CommandAgent),
        )
        .start()
        .await?;
        let mut service = queue_service(&broker, fast_config()).await;

        let before = km_telemetry::CALLS_TOTAL
            .with_label_values(&["success"])
            .get();
        let reply = service
            .client()
            .call(&PeerId::from("metrics"), echo(json!(7)), Duration::from_secs(5))
            .await?;
        assert_eq!(reply, json!(7));
        assert!(km_telemetry::CALLS_TOTAL.with_label_values(&["success"]).get() >= before + 1.0);

        let text = km_telemetry::encode_metrics()?;
        assert!(text.contains("km_rpc_calls_total"));
        assert!(text.contains("km_rpc_inbound_frames_total"));
        assert!(text.contains("km_transport_events_total"));

        service.shutdown().await;
        agent.stop().await;
        Ok(())
    }
}
