//! # Tyvaa Broker Client Library
//!
//! An async Rust client for the Tyvaa message-broker endpoint.
//!
//! ## Features
//!
//! - **Connect On Demand**: Lazily establishes its connection/channel pair on
//!   first use; reconnection attempts are serialized so concurrent callers
//!   share one handshake
//! - **Async/Await**: Built on tokio for non-blocking I/O
//! - **JSON Payloads**: Messages are UTF-8 JSON text of caller values,
//!   serialized with serde
//! - **Acknowledgement Controls**: Manual ack/nack with requeue, plus
//!   automatic poison-message rejection on the subscribe path
//! - **Observability**: Lifecycle and operational events on a broadcast bus,
//!   structured logging, built-in metrics
//! - **Pluggable Transport**: All endpoint traffic flows through the
//!   [`provider`] traits; an in-process endpoint backs tests and demos
//!
//! ## Quick Start
//!
//! ### Publisher Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tyvaa_broker::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let provider = Arc::new(MemoryProvider::new());
//!     let client = BrokerClient::new(BrokerConfig::default(), provider);
//!
//!     client.connect().await?;
//!     client
//!         .send_to_queue(
//!             "ride-requests",
//!             &serde_json::json!({"ride_id": 7, "pickup": "Plateau"}),
//!             PublishOptions::default(),
//!         )
//!         .await?;
//!
//!     client.destroy().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Subscriber Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tyvaa_broker::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let provider = Arc::new(MemoryProvider::new());
//!     let client = Arc::new(BrokerClient::new(BrokerConfig::default(), provider));
//!
//!     let ack_client = client.clone();
//!     let tag = client
//!         .subscribe("ride-requests", SubscribeOptions::default(), move |payload, delivery| {
//!             let client = ack_client.clone();
//!             async move {
//!                 println!("received: {payload}");
//!                 if let Err(e) = client.acknowledge(&delivery).await {
//!                     eprintln!("ack failed: {e}");
//!                 }
//!             }
//!         })
//!         .await?;
//!
//!     println!("consuming as {tag}");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod provider;

pub use client::{global, init_global, BrokerClient, BrokerState};
pub use config::{
    BrokerConfig, BrokerConfigBuilder, PublishOptions, QueueOptions, SubscribeOptions,
};
pub use error::BrokerClientError;
pub use events::BrokerEvent;
pub use memory::MemoryProvider;
pub use metrics::{global_metrics, BrokerMetrics, MetricsSnapshot};
pub use provider::{
    Channel, Connection, ConnectionProvider, ConsumerTag, Delivery, DeliveryStream, QueueInfo,
};

/// Client library result type
pub type Result<T> = std::result::Result<T, BrokerClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
