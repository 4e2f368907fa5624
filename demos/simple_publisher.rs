//! Simple publisher example for the Tyvaa broker client

use serde_json::json;
use std::sync::Arc;
use tyvaa_broker::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Tyvaa Broker - Simple Publisher Example");
    println!("==========================================");

    // The demo runs against the in-process endpoint; swap the provider for a
    // real transport to talk to a live broker
    let provider = Arc::new(MemoryProvider::new());
    let config = BrokerConfigBuilder::new()
        .uri("mem://tyvaa")
        .connection_name("simple-publisher")
        .build();
    let client = BrokerClient::new(config, provider);

    client.connect().await?;
    println!("✅ Connected to broker");

    // Example 1: declare the queue up front
    let info = client
        .assert_queue("ride-requests", QueueOptions::default())
        .await?;
    println!(
        "✅ Queue '{}' ready - {} buffered, {} consumers",
        info.queue, info.message_count, info.consumer_count
    );

    // Example 2: direct queue sends
    for ride_id in 1..=3 {
        client
            .send_to_queue(
                "ride-requests",
                &json!({
                    "ride_id": ride_id,
                    "pickup": "Plateau",
                    "dropoff": "Almadies",
                }),
                PublishOptions::default(),
            )
            .await?;
        println!("✅ Sent ride request #{ride_id}");
    }

    // Example 3: publish with a routing key on the default exchange
    client
        .publish(
            None,
            "ride-events",
            &json!({"kind": "surge-started", "zone": "Plateau"}),
            PublishOptions {
                message_id: Some("evt-1".to_string()),
                ..PublishOptions::default()
            },
        )
        .await?;
    println!("✅ Published surge event to 'ride-events'");

    let info = client
        .assert_queue("ride-requests", QueueOptions::default())
        .await?;
    println!("📊 'ride-requests' now buffers {} messages", info.message_count);

    let snapshot = global_metrics().snapshot();
    println!(
        "📊 Metrics: {} published ({} bytes, avg {:.0}µs)",
        snapshot.messages_published, snapshot.bytes_published, snapshot.average_publish_latency_us
    );

    client.destroy().await?;
    println!("✅ Client destroyed");

    println!("\n🎉 Publisher example completed successfully!");
    println!("💡 Try running the subscriber example next:");
    println!("   cargo run --example simple_subscriber");

    Ok(())
}
