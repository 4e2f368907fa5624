//! Transport seam between the client and a broker endpoint
//!
//! The client never talks to a socket itself. It asks a
//! [`ConnectionProvider`] for opaque [`Connection`] and [`Channel`] handles
//! and issues every queue operation through the channel. Production code
//! backs these traits with a real AMQP transport; tests and demos use the
//! in-process endpoint in [`crate::memory`].

use crate::config::{BrokerConfig, PublishOptions, QueueOptions, SubscribeOptions};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Opaque identifier issued by the endpoint for one active subscription
pub type ConsumerTag = String;

/// Stream of inbound deliveries for one consumer, ended by cancellation or
/// connection loss
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// One inbound message with its broker-assigned metadata
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped settlement tag
    pub delivery_tag: u64,
    /// Publisher-supplied message identifier, if any
    pub message_id: Option<String>,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Set when the endpoint redelivers after a requeue
    pub redelivered: bool,
    /// Raw message body
    pub payload: Bytes,
}

/// Queue declaration report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Transport-level link to the broker endpoint
#[async_trait]
pub trait Connection: Send + Sync {
    /// Resolves when the link goes away, with the reason the transport
    /// reported. Pending forever while the link is healthy.
    async fn closed(&self) -> String;

    /// Whether the link is currently usable
    fn is_open(&self) -> bool;
}

/// Channel scoped to one connection, carrying all queue operations
#[async_trait]
pub trait Channel: Send + Sync + std::fmt::Debug {
    /// Declare a queue idempotently
    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<QueueInfo>;

    /// Publish a raw payload. The empty exchange name addresses the default
    /// exchange, where the routing key is the destination queue.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<()>;

    /// Register a consumer and return its tag plus the delivery stream
    async fn consume(
        &self,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<(ConsumerTag, DeliveryStream)>;

    /// Settle one delivery positively
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Settle deliveries negatively. `multiple` settles everything up to
    /// and including the tag; `requeue` puts the messages back instead of
    /// dropping them.
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    /// Cancel a consumer at the endpoint, ending its delivery stream
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Drop all ready messages from a queue, returning how many were removed
    async fn purge_queue(&self, queue: &str) -> Result<u32>;
}

/// Factory for connections and channels
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Establish a transport link to the configured endpoint
    async fn get_connection(&self, config: &BrokerConfig) -> Result<Arc<dyn Connection>>;

    /// Open a channel on an established link
    async fn get_channel(&self, connection: &Arc<dyn Connection>) -> Result<Arc<dyn Channel>>;

    /// Close a link and release its resources
    async fn close_connection(&self, connection: Arc<dyn Connection>) -> Result<()>;
}
