//! Broker client with connect-on-demand semantics
//!
//! [`BrokerClient`] owns at most one connection/channel pair at a time. Every
//! queue operation runs against the held channel or first runs the guarded
//! connect. State transitions and operations are observable through the
//! event bus; see [`crate::events`].

use crate::config::{BrokerConfig, PublishOptions, QueueOptions, SubscribeOptions};
use crate::error::BrokerClientError;
use crate::events::BrokerEvent;
use crate::metrics::{global_metrics, Timer};
use crate::provider::{
    Channel, Connection, ConnectionProvider, ConsumerTag, Delivery, QueueInfo,
};
use crate::Result;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection lifecycle as observed through [`BrokerClient::state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connecting,
    Connected,
}

/// State shared with the close watcher task
struct Shared {
    state: RwLock<BrokerState>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Shared {
    fn emit(&self, event: BrokerEvent) {
        // A bus without receivers is not an error
        let _ = self.events.send(event);
    }

    fn drop_link(&self) {
        *self.channel.write() = None;
        *self.connection.write() = None;
        *self.state.write() = BrokerState::Disconnected;
    }
}

struct ConsumerEntry {
    queue_name: String,
    task: JoinHandle<()>,
}

/// Single point of access to a message-queue endpoint
pub struct BrokerClient {
    config: BrokerConfig,
    provider: Arc<dyn ConnectionProvider>,
    shared: Arc<Shared>,
    consumers: DashMap<ConsumerTag, ConsumerEntry>,
    // Serializes connection attempts; concurrent callers that find no
    // channel await the winner and reuse its result
    connect_gate: Mutex<()>,
    close_watch: RwLock<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Create a client for the given endpoint. No connection is made until
    /// [`connect`](Self::connect) or the first queue operation.
    pub fn new(config: BrokerConfig, provider: Arc<dyn ConnectionProvider>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            provider,
            shared: Arc::new(Shared {
                state: RwLock::new(BrokerState::Disconnected),
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                events,
            }),
            consumers: DashMap::new(),
            connect_gate: Mutex::new(()),
            close_watch: RwLock::new(None),
        }
    }

    /// The configuration this client was built with
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> BrokerState {
        *self.shared.state.read()
    }

    /// The held channel handle, if any
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.shared.channel.read().clone()
    }

    /// Tags of the currently registered consumers
    pub fn consumer_tags(&self) -> Vec<ConsumerTag> {
        self.consumers.iter().map(|e| e.key().clone()).collect()
    }

    /// Subscribe to lifecycle and operational events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.shared.events.subscribe()
    }

    /// Establish the connection/channel pair. Idempotent: when a channel is
    /// already held it is returned without touching the provider.
    pub async fn connect(&self) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        let _gate = self.connect_gate.lock().await;
        // A concurrent caller may have finished the handshake while we waited
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        *self.shared.state.write() = BrokerState::Connecting;
        debug!(uri = %self.config.uri, "connecting to broker");

        let attempt = async {
            let connection = self.provider.get_connection(&self.config).await?;
            let channel = self.provider.get_channel(&connection).await?;
            Ok::<_, BrokerClientError>((connection, channel))
        }
        .await;

        match attempt {
            Ok((connection, channel)) => {
                *self.shared.connection.write() = Some(connection.clone());
                *self.shared.channel.write() = Some(channel.clone());
                *self.shared.state.write() = BrokerState::Connected;
                self.spawn_close_watch(connection);
                global_metrics().record_connection_opened();
                self.shared.emit(BrokerEvent::Connected);
                info!(uri = %self.config.uri, "connected to broker");
                Ok(channel)
            }
            Err(err) => {
                self.shared.drop_link();
                global_metrics().record_connection_failure();
                self.shared.emit(BrokerEvent::Error {
                    message: err.to_string(),
                });
                error!(uri = %self.config.uri, %err, "broker connection failed");
                Err(err)
            }
        }
    }

    /// Declare a queue idempotently, connecting first if needed
    pub async fn assert_queue(&self, queue_name: &str, options: QueueOptions) -> Result<QueueInfo> {
        let channel = self.ensure_channel().await?;
        channel.declare_queue(queue_name, &options).await
    }

    /// Serialize `message` to JSON text and send it straight to a queue via
    /// the default exchange. The queue is declared first.
    pub async fn send_to_queue<T: Serialize>(
        &self,
        queue_name: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let msg = serde_json::to_value(message)?;
        let channel = self.ensure_channel().await?;
        channel
            .declare_queue(queue_name, &QueueOptions::default())
            .await?;

        let payload = Bytes::from(serde_json::to_vec(&msg)?);
        let byte_count = payload.len() as u64;
        let timer = Timer::start();
        match channel.publish("", queue_name, payload, &options).await {
            Ok(()) => {
                global_metrics().record_publish(byte_count, timer.elapsed());
                debug!(queue = queue_name, bytes = byte_count, "message sent to queue");
                self.shared.emit(BrokerEvent::MessagePublished {
                    queue_name: Some(queue_name.to_string()),
                    exchange_name: None,
                    routing_key: None,
                    msg,
                });
                Ok(())
            }
            Err(err) => {
                global_metrics().record_publish_error();
                Err(err)
            }
        }
    }

    /// Serialize `message` to JSON text and publish it to an exchange.
    /// `None` addresses the default exchange, where the routing key is the
    /// destination queue name.
    pub async fn publish<T: Serialize>(
        &self,
        exchange_name: Option<&str>,
        routing_key: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let exchange = exchange_name.unwrap_or("");
        let msg = serde_json::to_value(message)?;
        let channel = self.ensure_channel().await?;

        let payload = Bytes::from(serde_json::to_vec(&msg)?);
        let byte_count = payload.len() as u64;
        let timer = Timer::start();
        match channel.publish(exchange, routing_key, payload, &options).await {
            Ok(()) => {
                global_metrics().record_publish(byte_count, timer.elapsed());
                debug!(
                    exchange,
                    routing_key,
                    bytes = byte_count,
                    "message published"
                );
                self.shared.emit(BrokerEvent::MessagePublished {
                    queue_name: None,
                    exchange_name: Some(exchange.to_string()),
                    routing_key: Some(routing_key.to_string()),
                    msg,
                });
                Ok(())
            }
            Err(err) => {
                global_metrics().record_publish_error();
                Err(err)
            }
        }
    }

    /// Register a consumer on a queue. The queue is declared first.
    ///
    /// For every inbound delivery the raw body is parsed as UTF-8 JSON. On
    /// success `on_message` runs with the parsed value and the delivery
    /// handle; settlement is the callback's responsibility through
    /// [`acknowledge`](Self::acknowledge) or [`nack`](Self::nack). A body
    /// that does not parse is negative-acknowledged without requeue and the
    /// callback never runs. Callbacks run one at a time in delivery order.
    pub async fn subscribe<F, Fut>(
        &self,
        queue_name: &str,
        options: SubscribeOptions,
        on_message: F,
    ) -> Result<ConsumerTag>
    where
        F: Fn(Value, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let channel = self.ensure_channel().await?;
        channel
            .declare_queue(queue_name, &QueueOptions::default())
            .await?;
        let (consumer_tag, mut deliveries) = channel.consume(queue_name, &options).await?;

        let dispatch_channel = channel.clone();
        let tag = consumer_tag.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                let byte_count = delivery.payload.len() as u64;
                match serde_json::from_slice::<Value>(&delivery.payload) {
                    Ok(value) => {
                        global_metrics().record_consume(byte_count);
                        on_message(value, delivery).await;
                    }
                    Err(err) => {
                        global_metrics().record_poison_message();
                        warn!(
                            consumer_tag = %tag,
                            delivery_tag = delivery.delivery_tag,
                            %err,
                            "dropping undecodable message"
                        );
                        if let Err(err) = dispatch_channel
                            .nack(delivery.delivery_tag, false, false)
                            .await
                        {
                            warn!(consumer_tag = %tag, %err, "failed to reject undecodable message");
                        }
                    }
                }
            }
            debug!(consumer_tag = %tag, "delivery stream ended");
        });

        self.consumers.insert(
            consumer_tag.clone(),
            ConsumerEntry {
                queue_name: queue_name.to_string(),
                task,
            },
        );
        self.shared.emit(BrokerEvent::Subscribed {
            queue_name: queue_name.to_string(),
            consumer_tag: consumer_tag.clone(),
        });
        info!(queue = queue_name, consumer_tag = %consumer_tag, "consumer registered");
        Ok(consumer_tag)
    }

    /// Cancel a consumer. An unknown tag is an explicit
    /// [`UnknownConsumer`](BrokerClientError::UnknownConsumer) error.
    pub async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        let (tag, entry) = self.consumers.remove(consumer_tag).ok_or_else(|| {
            BrokerClientError::UnknownConsumer {
                consumer_tag: consumer_tag.to_string(),
            }
        })?;

        // Without a channel there is nothing to cancel at the endpoint: the
        // registration died with the connection
        if let Some(channel) = self.channel() {
            channel.cancel(&tag).await?;
        }

        self.shared.emit(BrokerEvent::Unsubscribed {
            consumer_tag: tag.clone(),
            queue_name: entry.queue_name.clone(),
        });
        info!(consumer_tag = %tag, queue = %entry.queue_name, "consumer cancelled");
        Ok(())
    }

    /// Settle a delivery positively
    pub async fn acknowledge(&self, delivery: &Delivery) -> Result<()> {
        let channel = self.require_channel()?;
        channel.ack(delivery.delivery_tag).await?;
        global_metrics().record_ack();
        self.shared.emit(BrokerEvent::MessageAcknowledged {
            message_id: delivery.message_id.clone(),
        });
        Ok(())
    }

    /// Settle deliveries negatively. `multiple` settles everything up to and
    /// including this delivery; `requeue` puts the messages back for
    /// redelivery instead of dropping them.
    pub async fn nack(&self, delivery: &Delivery, multiple: bool, requeue: bool) -> Result<()> {
        let channel = self.require_channel()?;
        channel
            .nack(delivery.delivery_tag, multiple, requeue)
            .await?;
        global_metrics().record_nack();
        self.shared.emit(BrokerEvent::MessageNacked {
            message_id: delivery.message_id.clone(),
            requeue,
        });
        Ok(())
    }

    /// Drop all ready messages from a queue, connecting first if needed
    pub async fn purge_queue(&self, queue_name: &str) -> Result<u32> {
        let channel = self.ensure_channel().await?;
        let message_count = channel.purge_queue(queue_name).await?;
        self.shared.emit(BrokerEvent::QueuePurged {
            queue_name: queue_name.to_string(),
            message_count,
        });
        info!(queue = queue_name, message_count, "queue purged");
        Ok(message_count)
    }

    /// Cancel every consumer, close the connection, and reset to
    /// `Disconnected`. Safe to call repeatedly and when never connected.
    pub async fn destroy(&self) -> Result<()> {
        let tags = self.consumer_tags();
        for tag in tags {
            if let Err(err) = self.unsubscribe(&tag).await {
                warn!(consumer_tag = %tag, %err, "failed to cancel consumer during teardown");
            }
        }

        if let Some(watch) = self.close_watch.write().take() {
            watch.abort();
        }

        let connection = self.shared.connection.write().take();
        *self.shared.channel.write() = None;
        *self.shared.state.write() = BrokerState::Disconnected;

        if let Some(connection) = connection {
            if let Err(err) = self.provider.close_connection(connection).await {
                warn!(%err, "error closing broker connection");
            }
            info!("broker connection closed");
        }
        Ok(())
    }

    fn require_channel(&self) -> Result<Arc<dyn Channel>> {
        self.channel()
            .ok_or_else(|| BrokerClientError::not_connected("no channel held"))
    }

    async fn ensure_channel(&self) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }
        self.connect()
            .await
            .map_err(|err| BrokerClientError::not_connected(err.to_string()))
    }

    fn spawn_close_watch(&self, connection: Arc<dyn Connection>) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let reason = connection.closed().await;
            warn!(%reason, "broker connection lost");
            shared.drop_link();
            shared.emit(BrokerEvent::Error { message: reason });
        });
        if let Some(previous) = self.close_watch.write().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        if let Some(watch) = self.close_watch.write().take() {
            watch.abort();
        }
        for entry in self.consumers.iter() {
            entry.value().task.abort();
        }
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("uri", &self.config.uri)
            .field("state", &self.state())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

/// Process-wide client installed through [`init_global`]
static GLOBAL_BROKER: once_cell::sync::OnceCell<Arc<BrokerClient>> =
    once_cell::sync::OnceCell::new();

/// Install the process-wide client. Fails if one is already installed.
/// Teardown is [`BrokerClient::destroy`]; the installed handle stays valid
/// for the life of the process.
pub fn init_global(client: Arc<BrokerClient>) -> Result<()> {
    GLOBAL_BROKER
        .set(client)
        .map_err(|_| BrokerClientError::generic("global broker client already initialized"))
}

/// The process-wide client installed by [`init_global`], if any
pub fn global() -> Option<Arc<BrokerClient>> {
    GLOBAL_BROKER.get().cloned()
}
