//! Simple subscriber example for the Tyvaa broker client

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tyvaa_broker::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("📖 Tyvaa Broker - Simple Subscriber Example");
    println!("===========================================");

    let provider = Arc::new(MemoryProvider::new());
    let config = BrokerConfigBuilder::new()
        .uri("mem://tyvaa")
        .connection_name("simple-subscriber")
        .build();
    let client = Arc::new(BrokerClient::new(config, provider));

    // Watch the event bus the way a monitoring sidecar would
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("   🔔 event: {}", event.name());
        }
    });

    // Register the consumer; acknowledgement stays with the callback
    let ack_client = client.clone();
    let tag = client
        .subscribe(
            "ride-requests",
            SubscribeOptions::default(),
            move |payload, delivery| {
                let client = ack_client.clone();
                async move {
                    println!(
                        "   📨 ride request #{} (redelivered: {})",
                        payload["ride_id"], delivery.redelivered
                    );
                    if let Err(e) = client.acknowledge(&delivery).await {
                        eprintln!("   ❌ ack failed: {e}");
                    }
                }
            },
        )
        .await?;
    println!("✅ Consuming 'ride-requests' as {tag}");

    // Feed the queue from a background task, as another service would
    let publisher = client.clone();
    tokio::spawn(async move {
        for ride_id in 1..=5 {
            let message = json!({
                "ride_id": ride_id,
                "pickup": "Ngor",
                "dropoff": "Médina",
            });
            if let Err(e) = publisher
                .send_to_queue("ride-requests", &message, PublishOptions::default())
                .await
            {
                eprintln!("   ❌ publish failed: {e}");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    // Let the messages flow for a moment
    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = global_metrics().snapshot();
    println!(
        "📊 Metrics: {} consumed, {} acked",
        snapshot.messages_consumed, snapshot.messages_acked
    );

    client.unsubscribe(&tag).await?;
    client.destroy().await?;
    println!("✅ Client destroyed");

    println!("\n🎉 Subscriber example completed successfully!");

    Ok(())
}
