//! Pub/Sub source metrics.
//!
//! [`PubSubSourceMetrics`] provides lock-free atomic counters shared by the
//! pull loop, the ack task and the lease extension task, convertible to a
//! [`ConnectorMetrics`] snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time connector metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorMetrics {
    /// Records read.
    pub records_total: u64,
    /// Payload bytes read.
    pub bytes_total: u64,
    /// Errors observed.
    pub errors_total: u64,
    /// Messages delivered but not yet acknowledged.
    pub lag: u64,
    /// Connector-specific metrics.
    pub custom: Vec<(String, f64)>,
}

impl ConnectorMetrics {
    /// Appends a connector-specific metric.
    pub fn add_custom(&mut self, name: impl Into<String>, value: f64) {
        self.custom.push((name.into(), value));
    }

    /// Looks up a connector-specific metric.
    #[must_use]
    pub fn custom(&self, name: &str) -> Option<f64> {
        self.custom
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

/// Atomic counters for the Pub/Sub source.
///
/// All counters use `Relaxed` ordering; snapshots are for monitoring only.
#[derive(Debug, Default)]
pub struct PubSubSourceMetrics {
    /// Messages pulled.
    pub messages_received: AtomicU64,
    /// Payload bytes pulled.
    pub bytes_received: AtomicU64,
    /// Failed pull calls.
    pub pull_errors: AtomicU64,
    /// Ack ids successfully acknowledged.
    pub acks_sent: AtomicU64,
    /// Ack ids whose acknowledgment was abandoned after retries.
    pub ack_failures: AtomicU64,
    /// Ack ids whose deadline was extended.
    pub deadline_extensions: AtomicU64,
    /// Leases dropped for exceeding the maximum lease duration.
    pub leases_expired: AtomicU64,
    /// Checkpoints completed.
    pub checkpoints_completed: AtomicU64,
}

impl PubSubSourceMetrics {
    /// Creates a metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pulled message.
    pub fn record_message(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a failed pull.
    pub fn record_pull_error(&self) {
        self.pull_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records acknowledged ids.
    pub fn record_acks(&self, count: u64) {
        self.acks_sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Records abandoned acknowledgments.
    pub fn record_ack_failures(&self, count: u64) {
        self.ack_failures.fetch_add(count, Ordering::Relaxed);
    }

    /// Records extended deadlines.
    pub fn record_extensions(&self, count: u64) {
        self.deadline_extensions.fetch_add(count, Ordering::Relaxed);
    }

    /// Records expired leases.
    pub fn record_expired(&self, count: u64) {
        self.leases_expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a completed checkpoint.
    pub fn record_checkpoint_completed(&self) {
        self.checkpoints_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Converts to a [`ConnectorMetrics`] snapshot. `outstanding` is the
    /// current lease count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_connector_metrics(&self, outstanding: u64) -> ConnectorMetrics {
        let mut m = ConnectorMetrics {
            records_total: self.messages_received.load(Ordering::Relaxed),
            bytes_total: self.bytes_received.load(Ordering::Relaxed),
            errors_total: self.pull_errors.load(Ordering::Relaxed)
                + self.ack_failures.load(Ordering::Relaxed),
            lag: outstanding,
            custom: Vec::new(),
        };
        m.add_custom("pubsub.acks_sent", self.acks_sent.load(Ordering::Relaxed) as f64);
        m.add_custom(
            "pubsub.ack_failures",
            self.ack_failures.load(Ordering::Relaxed) as f64,
        );
        m.add_custom(
            "pubsub.deadline_extensions",
            self.deadline_extensions.load(Ordering::Relaxed) as f64,
        );
        m.add_custom(
            "pubsub.leases_expired",
            self.leases_expired.load(Ordering::Relaxed) as f64,
        );
        m.add_custom(
            "pubsub.checkpoints_completed",
            self.checkpoints_completed.load(Ordering::Relaxed) as f64,
        );
        m
    }
}
