//! In-process broker endpoint for tests and demos
//!
//! [`MemoryProvider`] implements the provider traits over per-queue buffers
//! and per-consumer channels, so the client can be exercised end-to-end
//! without a live broker. Only the default exchange is modeled: a publish to
//! any exchange routes directly to the queue named by the routing key.

use crate::config::{BrokerConfig, PublishOptions, QueueOptions, SubscribeOptions};
use crate::error::BrokerClientError;
use crate::provider::{
    Channel, Connection, ConnectionProvider, ConsumerTag, Delivery, DeliveryStream, QueueInfo,
};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Clone)]
struct StoredMessage {
    payload: Bytes,
    message_id: Option<String>,
    routing_key: String,
    redelivered: bool,
}

struct ConsumerSeat {
    tag: ConsumerTag,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSeat>,
    next_seat: usize,
}

struct QueueState {
    name: String,
    inner: Mutex<QueueInner>,
}

struct Unacked {
    queue_name: String,
    message: StoredMessage,
}

/// The shared in-process broker behind every connection of one provider
struct MemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
    unacked: DashMap<u64, Unacked>,
    consumer_queues: DashMap<ConsumerTag, String>,
    next_delivery_tag: AtomicU64,
    next_consumer_id: AtomicU64,
}

impl MemoryBroker {
    fn new() -> Self {
        Self {
            queues: DashMap::new(),
            unacked: DashMap::new(),
            consumer_queues: DashMap::new(),
            next_delivery_tag: AtomicU64::new(0),
            next_consumer_id: AtomicU64::new(0),
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: name.to_string(),
                    inner: Mutex::new(QueueInner::default()),
                })
            })
            .clone()
    }

    fn enqueue(&self, queue_name: &str, message: StoredMessage) {
        let queue = self.queue(queue_name);
        queue.inner.lock().ready.push_back(message);
        self.pump(&queue);
    }

    fn requeue(&self, queue_name: &str, mut message: StoredMessage) {
        message.redelivered = true;
        let queue = self.queue(queue_name);
        queue.inner.lock().ready.push_front(message);
        self.pump(&queue);
    }

    /// Move ready messages to attached consumers, round-robin
    fn pump(&self, queue: &QueueState) {
        let mut inner = queue.inner.lock();
        loop {
            inner.consumers.retain(|seat| !seat.sender.is_closed());
            if inner.ready.is_empty() || inner.consumers.is_empty() {
                break;
            }
            let Some(message) = inner.ready.pop_front() else {
                break;
            };
            let idx = inner.next_seat % inner.consumers.len();
            inner.next_seat = inner.next_seat.wrapping_add(1);
            let (sender, no_ack) = {
                let seat = &inner.consumers[idx];
                (seat.sender.clone(), seat.no_ack)
            };

            let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
            let delivery = Delivery {
                delivery_tag,
                message_id: message.message_id.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                payload: message.payload.clone(),
            };
            if !no_ack {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue_name: queue.name.clone(),
                        message: message.clone(),
                    },
                );
            }
            if sender.send(delivery).is_err() {
                // Seat died between the retain and the send; try again
                self.unacked.remove(&delivery_tag);
                inner.ready.push_front(message);
            }
        }
    }

    fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| {
                BrokerClientError::channel(format!("unknown delivery tag {delivery_tag}"))
            })
    }

    fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let tags: Vec<u64> = if multiple {
            self.unacked
                .iter()
                .map(|entry| *entry.key())
                .filter(|tag| *tag <= delivery_tag)
                .collect()
        } else {
            vec![delivery_tag]
        };

        if !multiple && !self.unacked.contains_key(&delivery_tag) {
            return Err(BrokerClientError::channel(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        }

        for tag in tags {
            if let Some((_, unacked)) = self.unacked.remove(&tag) {
                if requeue {
                    self.requeue(&unacked.queue_name, unacked.message);
                }
            }
        }
        Ok(())
    }

    fn consume(
        &self,
        queue_name: &str,
        options: &SubscribeOptions,
    ) -> Result<(ConsumerTag, DeliveryStream)> {
        let tag = options.consumer_tag.clone().unwrap_or_else(|| {
            format!(
                "ctag-{}",
                self.next_consumer_id.fetch_add(1, Ordering::Relaxed) + 1
            )
        });
        if self.consumer_queues.contains_key(&tag) {
            return Err(BrokerClientError::channel(format!(
                "consumer tag '{tag}' already in use"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = self.queue(queue_name);
        queue.inner.lock().consumers.push(ConsumerSeat {
            tag: tag.clone(),
            no_ack: options.no_ack,
            sender,
        });
        self.consumer_queues
            .insert(tag.clone(), queue_name.to_string());
        self.pump(&queue);

        let stream: DeliveryStream = Box::pin(futures::stream::unfold(
            receiver,
            |mut receiver| async move { receiver.recv().await.map(|d| (d, receiver)) },
        ));
        Ok((tag, stream))
    }

    fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let (_, queue_name) = self.consumer_queues.remove(consumer_tag).ok_or_else(|| {
            BrokerClientError::channel(format!("unknown consumer tag '{consumer_tag}'"))
        })?;
        if let Some(queue) = self.queues.get(&queue_name) {
            queue
                .inner
                .lock()
                .consumers
                .retain(|seat| seat.tag != consumer_tag);
        }
        Ok(())
    }

    fn purge(&self, queue_name: &str) -> u32 {
        let queue = self.queue(queue_name);
        let mut inner = queue.inner.lock();
        let count = inner.ready.len() as u32;
        inner.ready.clear();
        count
    }

    fn declare(&self, queue_name: &str) -> QueueInfo {
        let queue = self.queue(queue_name);
        let inner = queue.inner.lock();
        QueueInfo {
            queue: queue_name.to_string(),
            message_count: inner.ready.len() as u32,
            consumer_count: inner.consumers.len() as u32,
        }
    }
}

struct MemoryConnection {
    close_tx: watch::Sender<Option<String>>,
}

impl MemoryConnection {
    fn new() -> Self {
        let (close_tx, _) = watch::channel(None);
        Self { close_tx }
    }

    fn close(&self, reason: &str) {
        let _ = self.close_tx.send(Some(reason.to_string()));
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn closed(&self) -> String {
        let mut rx = self.close_tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "connection dropped".to_string();
            }
        }
    }

    fn is_open(&self) -> bool {
        self.close_tx.borrow().is_none()
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    connection: Arc<MemoryConnection>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel").finish_non_exhaustive()
    }
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.connection.is_open() {
            Ok(())
        } else {
            Err(BrokerClientError::channel("connection is closed"))
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &str, _options: &QueueOptions) -> Result<QueueInfo> {
        self.ensure_open()?;
        Ok(self.broker.declare(queue))
    }

    async fn publish(
        &self,
        _exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        self.broker.enqueue(
            routing_key,
            StoredMessage {
                payload,
                message_id: options.message_id.clone(),
                routing_key: routing_key.to_string(),
                redelivered: false,
            },
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<(ConsumerTag, DeliveryStream)> {
        self.ensure_open()?;
        self.broker.consume(queue, options)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.broker.ack(delivery_tag)
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.nack(delivery_tag, multiple, requeue)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.cancel(consumer_tag)
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.broker.purge(queue))
    }
}

/// Connection provider backed by an in-process broker
pub struct MemoryProvider {
    broker: Arc<MemoryBroker>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(MemoryBroker::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Close every open connection, as a broker-initiated shutdown would
    pub fn disconnect_all(&self, reason: &str) {
        for connection in self.connections.lock().drain(..) {
            connection.close(reason);
        }
    }

    fn find(&self, handle: &Arc<dyn Connection>) -> Option<Arc<MemoryConnection>> {
        let raw = Arc::as_ptr(handle) as *const ();
        self.connections
            .lock()
            .iter()
            .find(|&c| std::ptr::eq(Arc::as_ptr(c) as *const (), raw))
            .cloned()
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    async fn get_connection(&self, _config: &BrokerConfig) -> Result<Arc<dyn Connection>> {
        let connection = Arc::new(MemoryConnection::new());
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }

    async fn get_channel(&self, connection: &Arc<dyn Connection>) -> Result<Arc<dyn Channel>> {
        let connection = self
            .find(connection)
            .ok_or_else(|| BrokerClientError::connection("unknown connection handle"))?;
        if !connection.is_open() {
            return Err(BrokerClientError::connection("connection is closed"));
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection,
        }))
    }

    async fn close_connection(&self, connection: Arc<dyn Connection>) -> Result<()> {
        if let Some(found) = self.find(&connection) {
            found.close("closed by client");
            self.connections.lock().retain(|c| !Arc::ptr_eq(c, &found));
        }
        Ok(())
    }
}
