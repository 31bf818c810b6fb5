//! Metrics collection for the Magnetar client

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Client-side metrics collector
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub receive_errors: AtomicU64,
    pub messages_acknowledged: AtomicU64,
    pub messages_negatively_acknowledged: AtomicU64,
    pub messages_redelivered: AtomicU64,
    pub consumers_created: AtomicU64,
    pub consumers_closed: AtomicU64,
}

impl ClientMetrics {
    /// Record a message handed to the consumer
    pub fn record_receive(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a decode or child receive error surfaced to the caller
    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acknowledged message
    pub fn record_ack(&self) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a negatively acknowledged message
    pub fn record_nack(&self) {
        self.messages_negatively_acknowledged
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record messages scheduled for redelivery
    pub fn record_redelivery(&self, count: u64) {
        self.messages_redelivered.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a consumer reaching Ready
    pub fn record_consumer_created(&self) {
        self.consumers_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a consumer closing
    pub fn record_consumer_closed(&self) {
        self.consumers_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            messages_acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
            messages_negatively_acknowledged: self
                .messages_negatively_acknowledged
                .load(Ordering::Relaxed),
            messages_redelivered: self.messages_redelivered.load(Ordering::Relaxed),
            consumers_created: self.consumers_created.load(Ordering::Relaxed),
            consumers_closed: self.consumers_closed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of client metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub receive_errors: u64,
    pub messages_acknowledged: u64,
    pub messages_negatively_acknowledged: u64,
    pub messages_redelivered: u64,
    pub consumers_created: u64,
    pub consumers_closed: u64,
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<ClientMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ClientMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<ClientMetrics> {
    GLOBAL_METRICS.clone()
}

/// Broker-reported statistics for one consumer, as returned by a child and
/// as aggregated over all children of a multi-topic consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    pub num_msgs_received: u64,
    pub num_bytes_received: u64,
    pub num_receive_failed: u64,
    pub num_batch_receive_failed: u64,
    pub num_acks_sent: u64,
    pub num_acks_failed: u64,
    pub total_msgs_received: u64,
    pub total_bytes_received: u64,
    pub total_receive_failed: u64,
    pub total_acks_sent: u64,
    pub rate_msgs_received: f64,
    pub rate_bytes_received: f64,
    pub interval_duration: Duration,
}

impl ConsumerStats {
    /// Aggregate per-child stats: counters and rates are summed,
    /// `interval_duration` is averaged.
    pub fn aggregate(children: &[ConsumerStats]) -> ConsumerStats {
        let mut total = ConsumerStats::default();
        if children.is_empty() {
            return total;
        }
        let mut interval_sum = Duration::ZERO;
        for stats in children {
            total.num_msgs_received += stats.num_msgs_received;
            total.num_bytes_received += stats.num_bytes_received;
            total.num_receive_failed += stats.num_receive_failed;
            total.num_batch_receive_failed += stats.num_batch_receive_failed;
            total.num_acks_sent += stats.num_acks_sent;
            total.num_acks_failed += stats.num_acks_failed;
            total.total_msgs_received += stats.total_msgs_received;
            total.total_bytes_received += stats.total_bytes_received;
            total.total_receive_failed += stats.total_receive_failed;
            total.total_acks_sent += stats.total_acks_sent;
            total.rate_msgs_received += stats.rate_msgs_received;
            total.rate_bytes_received += stats.rate_bytes_received;
            interval_sum += stats.interval_duration;
        }
        total.interval_duration = interval_sum / children.len() as u32;
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = ClientMetrics::default();
        metrics.record_receive(128);
        metrics.record_receive(64);
        metrics.record_ack();
        metrics.record_redelivery(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.bytes_received, 192);
        assert_eq!(snapshot.messages_acknowledged, 1);
        assert_eq!(snapshot.messages_redelivered, 3);
    }

    #[test]
    fn test_stats_aggregation() {
        let a = ConsumerStats {
            num_msgs_received: 10,
            num_bytes_received: 100,
            num_acks_sent: 4,
            interval_duration: Duration::from_secs(10),
            ..Default::default()
        };
        let b = ConsumerStats {
            num_msgs_received: 5,
            num_bytes_received: 50,
            num_acks_sent: 2,
            interval_duration: Duration::from_secs(20),
            ..Default::default()
        };

        let total = ConsumerStats::aggregate(&[a, b]);
        assert_eq!(total.num_msgs_received, 15);
        assert_eq!(total.num_bytes_received, 150);
        assert_eq!(total.num_acks_sent, 6);
        assert_eq!(total.interval_duration, Duration::from_secs(15));
    }

    #[test]
    fn test_empty_aggregation() {
        let total = ConsumerStats::aggregate(&[]);
        assert_eq!(total.num_msgs_received, 0);
        assert_eq!(total.interval_duration, Duration::ZERO);
    }
}
