//! Observable lifecycle and operational events
//!
//! Every state transition and queue operation of the client is surfaced as a
//! [`BrokerEvent`] on a broadcast bus obtained from
//! [`BrokerClient::subscribe_events`](crate::client::BrokerClient::subscribe_events).
//! Monitoring code matches on the variant; the wire-level event name consumed
//! by dashboards is available through [`BrokerEvent::name`].

use serde_json::Value;

/// Events emitted by the broker client
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Connection and channel established
    Connected,
    /// Connection-level failure, synchronous or endpoint-initiated
    Error { message: String },
    /// A message left the client. `queue_name` is set for direct queue
    /// sends, `exchange_name`/`routing_key` for exchange publishes.
    MessagePublished {
        queue_name: Option<String>,
        exchange_name: Option<String>,
        routing_key: Option<String>,
        msg: Value,
    },
    /// Consumer registered with the endpoint
    Subscribed {
        queue_name: String,
        consumer_tag: String,
    },
    /// Consumer cancelled at the endpoint
    Unsubscribed {
        consumer_tag: String,
        queue_name: String,
    },
    /// Delivery settled positively
    MessageAcknowledged { message_id: Option<String> },
    /// Delivery settled negatively
    MessageNacked {
        message_id: Option<String>,
        requeue: bool,
    },
    /// Queue drained on request
    QueuePurged {
        queue_name: String,
        message_count: u32,
    },
}

impl BrokerEvent {
    /// Wire name of the event as consumed by monitoring
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Error { .. } => "error",
            Self::MessagePublished { .. } => "message-published",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::MessageAcknowledged { .. } => "message-acknowledged",
            Self::MessageNacked { .. } => "message-nacked",
            Self::QueuePurged { .. } => "queue-purged",
        }
    }
}
