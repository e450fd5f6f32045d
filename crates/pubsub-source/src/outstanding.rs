//! Outstanding message leases and flow control.
//!
//! Every pulled message stays *outstanding* until it is handed over for
//! acknowledgment. While outstanding the reader holds a lease on it and
//! keeps extending its ack deadline. The outstanding count and byte total
//! are bounded; once either bound is reached the pull loop parks in
//! [`OutstandingMessages::wait_for_capacity`] until acknowledgments free
//! room.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::PubSubSourceConfig;
use crate::message::AckId;

/// Bounds on outstanding work. A zero bound is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlLimits {
    /// Maximum outstanding messages.
    pub max_messages: u64,
    /// Maximum outstanding payload bytes.
    pub max_bytes: u64,
}

impl FlowControlLimits {
    /// No bounds at all.
    pub const UNBOUNDED: Self = Self {
        max_messages: 0,
        max_bytes: 0,
    };

    /// Limits taken from a source config.
    #[must_use]
    pub fn from_config(config: &PubSubSourceConfig) -> Self {
        Self {
            max_messages: config.max_outstanding_messages_count,
            max_bytes: config.max_outstanding_messages_bytes,
        }
    }
}

#[derive(Debug)]
struct Lease {
    subscription: String,
    bytes: u64,
    received_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    leases: HashMap<AckId, Lease>,
    bytes: u64,
}

/// Lease table shared by the pull loop, the ack task and the lease
/// extension task.
#[derive(Debug)]
pub struct OutstandingMessages {
    inner: Mutex<Inner>,
    limits: FlowControlLimits,
    capacity_freed: Notify,
}

impl OutstandingMessages {
    /// Creates an empty lease table.
    #[must_use]
    pub fn new(limits: FlowControlLimits) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            limits,
            capacity_freed: Notify::new(),
        }
    }

    /// Takes a lease on a freshly pulled message.
    pub fn admit(&self, ack_id: AckId, subscription: &str, bytes: u64) {
        let mut inner = self.inner.lock();
        let lease = Lease {
            subscription: subscription.to_string(),
            bytes,
            received_at: Instant::now(),
        };
        inner.bytes += bytes;
        if let Some(previous) = inner.leases.insert(ack_id, lease) {
            inner.bytes -= previous.bytes;
        }
    }

    /// Drops the leases of `ack_ids` and returns the ones that were held,
    /// grouped by subscription.
    pub fn release(&self, ack_ids: &[AckId]) -> BTreeMap<String, Vec<AckId>> {
        let mut grouped: BTreeMap<String, Vec<AckId>> = BTreeMap::new();
        {
            let mut inner = self.inner.lock();
            for id in ack_ids {
                if let Some(lease) = inner.leases.remove(id) {
                    inner.bytes -= lease.bytes;
                    grouped.entry(lease.subscription).or_default().push(id.clone());
                }
            }
        }
        if !grouped.is_empty() {
            self.capacity_freed.notify_waiters();
        }
        grouped
    }

    /// Drops leases older than `max_age` and returns their ids. The service
    /// will redeliver those messages under new ack ids.
    pub fn expire(&self, max_age: Duration) -> Vec<AckId> {
        let now = Instant::now();
        let expired: Vec<AckId> = {
            let mut inner = self.inner.lock();
            let ids: Vec<AckId> = inner
                .leases
                .iter()
                .filter(|(_, lease)| now.duration_since(lease.received_at) > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                if let Some(lease) = inner.leases.remove(id) {
                    inner.bytes -= lease.bytes;
                }
            }
            ids
        };
        if !expired.is_empty() {
            self.capacity_freed.notify_waiters();
        }
        expired
    }

    /// All held leases grouped by subscription, for deadline extension.
    #[must_use]
    pub fn leases_by_subscription(&self) -> BTreeMap<String, Vec<AckId>> {
        let inner = self.inner.lock();
        let mut grouped: BTreeMap<String, Vec<AckId>> = BTreeMap::new();
        for (id, lease) in &inner.leases {
            grouped
                .entry(lease.subscription.clone())
                .or_default()
                .push(id.clone());
        }
        grouped
    }

    /// Returns `true` while both bounds leave room for more messages.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        let inner = self.inner.lock();
        let messages_ok = self.limits.max_messages == 0
            || (inner.leases.len() as u64) < self.limits.max_messages;
        let bytes_ok = self.limits.max_bytes == 0 || inner.bytes < self.limits.max_bytes;
        messages_ok && bytes_ok
    }

    /// Waits until [`has_capacity`](Self::has_capacity) holds.
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.capacity_freed.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();
            if self.has_capacity() {
                return;
            }
            notified.await;
        }
    }

    /// Number of held leases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().leases.len()
    }

    /// Returns `true` if no lease is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().leases.is_empty()
    }

    /// Payload bytes covered by held leases.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Configured limits.
    #[must_use]
    pub fn limits(&self) -> FlowControlLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const SUB: &str = "projects/p/subscriptions/s";

    #[test]
    fn test_message_count_bound() {
        let out = OutstandingMessages::new(FlowControlLimits {
            max_messages: 2,
            max_bytes: 0,
        });
        out.admit("a".into(), SUB, 10);
        assert!(out.has_capacity());
        out.admit("b".into(), SUB, 10);
        assert!(!out.has_capacity());

        out.release(&["a".into()]);
        assert!(out.has_capacity());
        assert_eq!(out.len(), 1);
        assert_eq!(out.bytes(), 10);
    }

    #[test]
    fn test_byte_bound() {
        let out = OutstandingMessages::new(FlowControlLimits {
            max_messages: 0,
            max_bytes: 100,
        });
        out.admit("a".into(), SUB, 60);
        assert!(out.has_capacity());
        out.admit("b".into(), SUB, 40);
        assert!(!out.has_capacity());
    }

    #[test]
    fn test_unbounded() {
        let out = OutstandingMessages::new(FlowControlLimits::UNBOUNDED);
        for i in 0..10_000 {
            out.admit(AckId::new(format!("id-{i}")), SUB, 1_000);
        }
        assert!(out.has_capacity());
    }

    #[test]
    fn test_release_groups_by_subscription_and_skips_unknown() {
        let out = OutstandingMessages::new(FlowControlLimits::UNBOUNDED);
        out.admit("a".into(), "sub-1", 1);
        out.admit("b".into(), "sub-2", 1);
        out.admit("c".into(), "sub-1", 1);

        let grouped = out.release(&["a".into(), "b".into(), "c".into(), "zzz".into()]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["sub-1"], vec![AckId::from("a"), AckId::from("c")]);
        assert_eq!(grouped["sub-2"], vec![AckId::from("b")]);
        assert!(out.is_empty());
        assert_eq!(out.bytes(), 0);
    }

    #[test]
    fn test_readmit_same_id_does_not_double_count() {
        let out = OutstandingMessages::new(FlowControlLimits::UNBOUNDED);
        out.admit("a".into(), SUB, 10);
        out.admit("a".into(), SUB, 15);
        assert_eq!(out.len(), 1);
        assert_eq!(out.bytes(), 15);
    }

    #[test]
    fn test_expire() {
        let out = OutstandingMessages::new(FlowControlLimits::UNBOUNDED);
        out.admit("a".into(), SUB, 10);
        assert!(out.expire(Duration::from_secs(3600)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(out.expire(Duration::from_millis(1)), vec![AckId::from("a")]);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_capacity_wakes_on_release() {
        let out = Arc::new(OutstandingMessages::new(FlowControlLimits {
            max_messages: 1,
            max_bytes: 0,
        }));
        out.admit("a".into(), SUB, 1);

        let waiter = {
            let out = Arc::clone(&out);
            tokio::spawn(async move { out.wait_for_capacity().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        out.release(&["a".into()]);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
