//! End-to-end tests through the in-process broker endpoint

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tyvaa_broker::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RideRequest {
    ride_id: u64,
    rider: String,
    pickup: String,
    dropoff: String,
}

fn memory_client() -> (Arc<MemoryProvider>, Arc<BrokerClient>) {
    let provider = Arc::new(MemoryProvider::new());
    let client = Arc::new(BrokerClient::new(
        BrokerConfigBuilder::new()
            .uri("mem://tyvaa")
            .connection_name("end-to-end-tests")
            .build(),
        provider.clone(),
    ));
    (provider, client)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn sent_message_round_trips_through_a_queue() {
    let (_, client) = memory_client();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let ack_client = client.clone();
    client
        .subscribe(
            "ride-requests",
            SubscribeOptions::default(),
            move |payload, delivery| {
                let tx = tx.clone();
                let client = ack_client.clone();
                async move {
                    client.acknowledge(&delivery).await.unwrap();
                    tx.send(payload).unwrap();
                }
            },
        )
        .await
        .unwrap();

    let request = RideRequest {
        ride_id: 42,
        rider: "aminata".to_string(),
        pickup: "Plateau".to_string(),
        dropoff: "Almadies".to_string(),
    };
    client
        .send_to_queue("ride-requests", &request, PublishOptions::default())
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("stream closed");
    let received: RideRequest = serde_json::from_value(received).unwrap();
    assert_eq!(received, request);

    // Settled, so the queue is drained
    let info = client
        .assert_queue("ride-requests", QueueOptions::default())
        .await
        .unwrap();
    assert_eq!(info.message_count, 0);

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn backlog_is_delivered_to_a_late_subscriber() {
    let (_, client) = memory_client();

    for i in 0..3 {
        client
            .send_to_queue("backlog", &json!({"seq": i}), PublishOptions::default())
            .await
            .unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ack_client = client.clone();
    client
        .subscribe(
            "backlog",
            SubscribeOptions::default(),
            move |payload, delivery| {
                let tx = tx.clone();
                let client = ack_client.clone();
                async move {
                    client.acknowledge(&delivery).await.unwrap();
                    tx.send(payload["seq"].as_u64().unwrap()).unwrap();
                }
            },
        )
        .await
        .unwrap();

    for expected in 0..3 {
        let seq = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        assert_eq!(seq, expected);
    }

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn poison_body_is_dropped_without_invoking_the_callback() {
    let (_, client) = memory_client();
    let baseline = global_metrics().snapshot().poison_messages;

    let invoked = Arc::new(AtomicBool::new(false));
    let seen = invoked.clone();
    client
        .subscribe("poison", SubscribeOptions::default(), move |_, _| {
            let seen = seen.clone();
            async move {
                seen.store(true, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    // Bypass the client's serializer to get an undecodable body on the wire
    let channel = client.channel().expect("channel held after subscribe");
    channel
        .publish(
            "",
            "poison",
            Bytes::from_static(b"\xff\xfe not json"),
            &PublishOptions::default(),
        )
        .await
        .unwrap();

    // The dispatch task rejects the body without requeue
    let metrics = global_metrics();
    wait_until("poison message rejected", move || {
        metrics.snapshot().poison_messages > baseline
    })
    .await;

    // It stays gone: not redelivered, not buffered
    let info = client
        .assert_queue("poison", QueueOptions::default())
        .await
        .unwrap();
    assert_eq!(info.message_count, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!invoked.load(Ordering::SeqCst));

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn nack_with_requeue_redelivers_the_message() {
    let (_, client) = memory_client();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let settle_client = client.clone();
    client
        .subscribe(
            "retries",
            SubscribeOptions::default(),
            move |_, delivery| {
                let tx = tx.clone();
                let client = settle_client.clone();
                let counter = counter.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        client.nack(&delivery, false, true).await.unwrap();
                    } else {
                        client.acknowledge(&delivery).await.unwrap();
                    }
                    tx.send(delivery.redelivered).unwrap();
                }
            },
        )
        .await
        .unwrap();

    client
        .send_to_queue("retries", &json!({"job": "recurring"}), PublishOptions::default())
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("stream closed");
    assert!(!first);
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("stream closed");
    assert!(second);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn purge_drops_ready_messages_and_reports_the_count() {
    let (_, client) = memory_client();

    for i in 0..5 {
        client
            .send_to_queue("stale", &json!({"seq": i}), PublishOptions::default())
            .await
            .unwrap();
    }

    assert_eq!(client.purge_queue("stale").await.unwrap(), 5);
    let info = client
        .assert_queue("stale", QueueOptions::default())
        .await
        .unwrap();
    assert_eq!(info.message_count, 0);

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn endpoint_close_resets_state_and_next_use_reconnects() {
    let (provider, client) = memory_client();
    let mut events = client.subscribe_events();

    client.connect().await.unwrap();
    assert_eq!(client.state(), BrokerState::Connected);

    provider.disconnect_all("scheduled maintenance");

    let client_for_wait = client.clone();
    wait_until("close watcher observed the drop", move || {
        client_for_wait.state() == BrokerState::Disconnected
    })
    .await;
    assert!(client.channel().is_none());

    let mut saw_close_error = false;
    while let Ok(event) = events.try_recv() {
        if let BrokerEvent::Error { message } = event {
            assert!(message.contains("maintenance"));
            saw_close_error = true;
        }
    }
    assert!(saw_close_error);

    // The next operation runs the implicit reconnect
    client
        .send_to_queue("after-outage", &json!({"ok": true}), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(client.state(), BrokerState::Connected);

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn global_registry_installs_exactly_once() {
    let (_, client) = memory_client();

    init_global(client.clone()).unwrap();
    let installed = global().expect("global client missing");
    assert!(Arc::ptr_eq(&installed, &client));

    let (_, other) = memory_client();
    assert!(init_global(other).is_err());
}
