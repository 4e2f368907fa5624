//! Metrics collection for the broker client

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Client metrics collector
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    // Publish metrics
    pub messages_published: AtomicU64,
    pub bytes_published: AtomicU64,
    pub publish_errors: AtomicU64,
    pub publish_latency_sum: AtomicU64,
    pub publish_latency_count: AtomicU64,

    // Consume metrics
    pub messages_consumed: AtomicU64,
    pub bytes_consumed: AtomicU64,
    pub poison_messages: AtomicU64,
    pub messages_acked: AtomicU64,
    pub messages_nacked: AtomicU64,

    // Connection metrics
    pub connections_opened: AtomicU64,
    pub connection_failures: AtomicU64,
}

impl BrokerMetrics {
    /// Record a successful publish
    pub fn record_publish(&self, byte_count: u64, latency: Duration) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(byte_count, Ordering::Relaxed);
        self.publish_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.publish_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a publish error
    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery handed to a consumer callback
    pub fn record_consume(&self, byte_count: u64) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a delivery dropped because its body would not parse
    pub fn record_poison_message(&self) {
        self.poison_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a positive settlement
    pub fn record_ack(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a negative settlement
    pub fn record_nack(&self) {
        self.messages_nacked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an established connection
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connection attempt
    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average publish latency in microseconds
    pub fn average_publish_latency_us(&self) -> f64 {
        let sum = self.publish_latency_sum.load(Ordering::Relaxed);
        let count = self.publish_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            average_publish_latency_us: self.average_publish_latency_us(),
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            poison_messages: self.poison_messages.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_nacked: self.messages_nacked.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub bytes_published: u64,
    pub publish_errors: u64,
    pub average_publish_latency_us: f64,
    pub messages_consumed: u64,
    pub bytes_consumed: u64,
    pub poison_messages: u64,
    pub messages_acked: u64,
    pub messages_nacked: u64,
    pub connections_opened: u64,
    pub connection_failures: u64,
}

/// Timing helper for measuring operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(self) -> Duration {
        self.start.elapsed()
    }
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<BrokerMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(BrokerMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<BrokerMetrics> {
    GLOBAL_METRICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = BrokerMetrics::default();
        metrics.record_publish(128, Duration::from_micros(40));
        metrics.record_publish(256, Duration::from_micros(60));
        metrics.record_publish_error();
        metrics.record_consume(128);
        metrics.record_poison_message();
        metrics.record_ack();
        metrics.record_nack();
        metrics.record_connection_opened();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 2);
        assert_eq!(snapshot.bytes_published, 384);
        assert_eq!(snapshot.publish_errors, 1);
        assert_eq!(snapshot.average_publish_latency_us, 50.0);
        assert_eq!(snapshot.messages_consumed, 1);
        assert_eq!(snapshot.poison_messages, 1);
        assert_eq!(snapshot.messages_acked, 1);
        assert_eq!(snapshot.messages_nacked, 1);
        assert_eq!(snapshot.connections_opened, 1);
    }

    #[test]
    fn test_average_latency_empty() {
        let metrics = BrokerMetrics::default();
        assert_eq!(metrics.average_publish_latency_us(), 0.0);
    }
}
