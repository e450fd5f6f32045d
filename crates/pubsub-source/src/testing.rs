//! In-memory test doubles.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::client::PubSubClient;
use crate::emitter::SourceOutput;
use crate::error::PubSubError;
use crate::message::{AckId, PubSubMessage};

#[derive(Debug, Default)]
struct MockState {
    queues: HashMap<String, VecDeque<PubSubMessage>>,
    acknowledged: HashMap<String, Vec<AckId>>,
    extended: HashMap<String, Vec<AckId>>,
    pull_failures: u32,
    ack_failures: u32,
    pull_calls: u64,
    ack_calls: u64,
}

impl MockState {
    fn acknowledged_total(&self) -> usize {
        self.acknowledged.values().map(Vec::len).sum()
    }
}

/// [`PubSubClient`] backed by in-memory queues.
///
/// Pulled messages leave the queue; nothing is redelivered. Failures can be
/// injected for the next N pulls or acknowledgments.
#[derive(Debug, Default)]
pub struct MockPubSubClient {
    state: Mutex<MockState>,
    acked: Notify,
}

impl MockPubSubClient {
    /// Creates an empty client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues messages on a subscription path.
    pub fn publish(&self, subscription: &str, messages: impl IntoIterator<Item = PubSubMessage>) {
        self.state
            .lock()
            .queues
            .entry(subscription.to_string())
            .or_default()
            .extend(messages);
    }

    /// Messages still queued on a subscription.
    #[must_use]
    pub fn pending(&self, subscription: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(subscription)
            .map_or(0, VecDeque::len)
    }

    /// Ids successfully acknowledged on a subscription, in order.
    #[must_use]
    pub fn acknowledged(&self, subscription: &str) -> Vec<AckId> {
        self.state
            .lock()
            .acknowledged
            .get(subscription)
            .cloned()
            .unwrap_or_default()
    }

    /// Total ids successfully acknowledged across subscriptions.
    #[must_use]
    pub fn acknowledged_count(&self) -> usize {
        self.state.lock().acknowledged_total()
    }

    /// Ids whose deadline was extended on a subscription, in call order.
    #[must_use]
    pub fn extended(&self, subscription: &str) -> Vec<AckId> {
        self.state
            .lock()
            .extended
            .get(subscription)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of pull calls, including failed ones.
    #[must_use]
    pub fn pull_calls(&self) -> u64 {
        self.state.lock().pull_calls
    }

    /// Number of acknowledge calls, including failed ones.
    #[must_use]
    pub fn ack_calls(&self) -> u64 {
        self.state.lock().ack_calls
    }

    /// Makes the next `n` pulls fail.
    pub fn fail_next_pulls(&self, n: u32) {
        self.state.lock().pull_failures = n;
    }

    /// Makes the next `n` acknowledge calls fail.
    pub fn fail_next_acks(&self, n: u32) {
        self.state.lock().ack_failures = n;
    }

    /// Waits until at least `count` ids have been acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `Elapsed` if `timeout` passes first.
    pub async fn wait_for_acks(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.acked.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.acknowledged_count() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
    }
}

#[async_trait]
impl PubSubClient for MockPubSubClient {
    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> Result<Vec<PubSubMessage>, PubSubError> {
        let mut state = self.state.lock();
        state.pull_calls += 1;
        if state.pull_failures > 0 {
            state.pull_failures -= 1;
            return Err(PubSubError::rpc("pull", "injected failure"));
        }
        let Some(queue) = state.queues.get_mut(subscription) else {
            return Ok(Vec::new());
        };
        let n = queue.len().min(max_messages as usize);
        Ok(queue.drain(..n).collect())
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[AckId]) -> Result<(), PubSubError> {
        {
            let mut state = self.state.lock();
            state.ack_calls += 1;
            if state.ack_failures > 0 {
                state.ack_failures -= 1;
                return Err(PubSubError::rpc("acknowledge", "injected failure"));
            }
            state
                .acknowledged
                .entry(subscription.to_string())
                .or_default()
                .extend_from_slice(ack_ids);
        }
        self.acked.notify_waiters();
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[AckId],
        _deadline: Duration,
    ) -> Result<(), PubSubError> {
        self.state
            .lock()
            .extended
            .entry(subscription.to_string())
            .or_default()
            .extend_from_slice(ack_ids);
        Ok(())
    }
}

/// [`SourceOutput`] that keeps every record with its timestamp.
#[derive(Debug)]
pub struct CollectingOutput<T> {
    records: Vec<(T, Option<i64>)>,
}

impl<T> Default for CollectingOutput<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<T> CollectingOutput<T> {
    /// Creates an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected records in emission order.
    pub fn records(&self) -> impl Iterator<Item = &T> {
        self.records.iter().map(|(r, _)| r)
    }

    /// Timestamp of each collected record, `None` when emitted without one.
    pub fn timestamps(&self) -> impl Iterator<Item = Option<i64>> + '_ {
        self.records.iter().map(|(_, ts)| *ts)
    }

    /// Number of collected records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T> SourceOutput<T> for CollectingOutput<T> {
    fn collect(&mut self, record: T) {
        self.records.push((record, None));
    }

    fn collect_with_timestamp(&mut self, record: T, timestamp_millis: i64) {
        self.records.push((record, Some(timestamp_millis)));
    }
}
