//! Split reader: pulls messages for assigned splits and performs the
//! acknowledgment and deadline-extension RPCs.
//!
//! Three pieces of work run against the [`PubSubClient`]:
//!
//! - `fetch()` on the reader task pulls batches, takes a lease on every
//!   message and records the delivery with the [`AckTracker`].
//! - The ack task receives ids released by the tracker (through
//!   [`AckDispatcher`]), drops their leases and acknowledges them with
//!   retry. Failures are logged and swallowed: the service redelivers.
//! - The lease task periodically extends the ack deadline of every
//!   outstanding message so nothing is redelivered while it waits for its
//!   checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::PubSubClient;
use crate::config::PubSubSourceConfig;
use crate::error::PubSubError;
use crate::message::{AckId, PubSubMessage};
use crate::metrics::PubSubSourceMetrics;
use crate::outstanding::OutstandingMessages;
use crate::split::SubscriptionSplit;
use crate::tracker::{AckTracker, Acknowledger};

/// Maximum ack ids sent in one acknowledge or modify-deadline request.
pub const MAX_ACK_IDS_PER_REQUEST: usize = 2_500;

/// Longest a single `fetch()` waits for flow-control capacity.
const MAX_CAPACITY_WAIT: Duration = Duration::from_millis(100);

/// Messages returned by one [`SplitReader::fetch`], tagged with the id of
/// the split they belong to.
#[derive(Debug, Default)]
pub struct RecordsWithSplitIds {
    /// `(split_id, message)` pairs in delivery order.
    pub records: Vec<(String, PubSubMessage)>,
    /// Splits the reader considers exhausted.
    pub finished_splits: Vec<String>,
}

impl RecordsWithSplitIds {
    /// Returns `true` if the batch has neither records nor finished splits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.finished_splits.is_empty()
    }
}

/// Capabilities the source reader needs from a split reader.
#[async_trait]
pub trait SplitReader: Send {
    /// Fetches the next batch. Every returned message has already been
    /// registered with the ack tracker.
    async fn fetch(&mut self) -> Result<RecordsWithSplitIds, PubSubError>;

    /// Adds newly assigned splits.
    fn handle_splits_changes(&mut self, splits: Vec<SubscriptionSplit>);

    /// Interrupts a blocked `fetch`, which then returns an empty batch.
    fn wake_up(&self);

    /// Stops background work.
    async fn close(&mut self) -> Result<(), PubSubError>;
}

// ---------------------------------------------------------------------------
// Ack channel
// ---------------------------------------------------------------------------

/// [`Acknowledger`] that forwards released ids to the ack task.
#[derive(Debug, Clone)]
pub struct AckDispatcher {
    tx: mpsc::UnboundedSender<Vec<AckId>>,
}

impl Acknowledger for AckDispatcher {
    fn acknowledge(&self, ack_ids: Vec<AckId>) {
        let count = ack_ids.len();
        if self.tx.send(ack_ids).is_err() {
            warn!(
                ack_ids = count,
                "ack task has stopped; messages will be redelivered"
            );
        }
    }
}

/// Receiving half of the ack channel, consumed by the split reader.
#[derive(Debug)]
pub struct AckReceiver {
    rx: mpsc::UnboundedReceiver<Vec<AckId>>,
}

/// Creates the channel between the tracker and the ack task.
#[must_use]
pub fn ack_channel() -> (AckDispatcher, AckReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AckDispatcher { tx }, AckReceiver { rx })
}

// ---------------------------------------------------------------------------
// PubSubSplitReader
// ---------------------------------------------------------------------------

/// [`SplitReader`] backed by a [`PubSubClient`].
///
/// Background tasks are spawned on the first `fetch()`, so the reader must
/// be driven from inside a Tokio runtime.
pub struct PubSubSplitReader<C: PubSubClient> {
    client: Arc<C>,
    config: PubSubSourceConfig,
    splits: Vec<SubscriptionSplit>,
    tracker: Arc<dyn AckTracker>,
    outstanding: Arc<OutstandingMessages>,
    metrics: Arc<PubSubSourceMetrics>,
    wakeup: Arc<Notify>,
    ack_rx: Option<AckReceiver>,
    ack_handle: Option<JoinHandle<()>>,
    lease_handle: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl<C: PubSubClient> PubSubSplitReader<C> {
    /// Creates a split reader. `ack_rx` must be the receiver paired with
    /// the dispatcher the `tracker` acknowledges through.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::ConfigurationError` if `config` does not
    /// validate.
    pub fn new(
        client: Arc<C>,
        config: PubSubSourceConfig,
        tracker: Arc<dyn AckTracker>,
        ack_rx: AckReceiver,
        outstanding: Arc<OutstandingMessages>,
        metrics: Arc<PubSubSourceMetrics>,
    ) -> Result<Self, PubSubError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            config,
            splits: Vec::new(),
            tracker,
            outstanding,
            metrics,
            wakeup: Arc::new(Notify::new()),
            ack_rx: Some(ack_rx),
            ack_handle: None,
            lease_handle: None,
            shutdown,
        })
    }

    /// Currently assigned splits.
    #[must_use]
    pub fn splits(&self) -> &[SubscriptionSplit] {
        &self.splits
    }

    /// Spawns the ack and lease tasks if they are not running yet.
    fn ensure_tasks_started(&mut self) {
        let Some(ack_rx) = self.ack_rx.take() else {
            return;
        };

        self.ack_handle = Some(tokio::spawn(run_ack_task(
            Arc::clone(&self.client),
            Arc::clone(&self.outstanding),
            Arc::clone(&self.metrics),
            ack_rx,
            AckRetry {
                attempts: self.config.ack_retry_attempts,
                backoff: self.config.ack_retry_backoff,
            },
            self.shutdown.subscribe(),
        )));
        self.lease_handle = Some(tokio::spawn(run_lease_task(
            Arc::clone(&self.client),
            Arc::clone(&self.outstanding),
            Arc::clone(&self.metrics),
            LeasePolicy {
                interval: self.config.lease_extension_interval,
                ack_deadline: self.config.ack_deadline,
                max_lease_duration: self.config.max_lease_duration,
            },
            self.shutdown.subscribe(),
        )));
        debug!("started ack and lease extension tasks");
    }

    /// Split that a message pulled from `subscription_path` belongs to:
    /// the split keyed on the message's ordering key if assigned, else the
    /// first split of the subscription.
    fn owning_split(&self, subscription_path: &str, message: &PubSubMessage) -> Option<String> {
        let mut candidates = self
            .splits
            .iter()
            .filter(|s| s.subscription_path() == subscription_path);
        let first = candidates.clone().next()?;
        let keyed = message
            .ordering_key
            .as_deref()
            .and_then(|key| candidates.find(|s| s.ordering_key() == Some(key)));
        Some(keyed.unwrap_or(first).split_id())
    }
}

#[async_trait]
impl<C: PubSubClient> SplitReader for PubSubSplitReader<C> {
    async fn fetch(&mut self) -> Result<RecordsWithSplitIds, PubSubError> {
        self.ensure_tasks_started();

        if self.splits.is_empty() {
            return Ok(RecordsWithSplitIds::default());
        }

        // Suspended while flow control is exhausted; the bounded wait lets
        // the caller service checkpoint completions that free capacity.
        tokio::select! {
            biased;
            () = self.outstanding.wait_for_capacity() => {}
            () = self.wakeup.notified() => return Ok(RecordsWithSplitIds::default()),
            () = tokio::time::sleep(MAX_CAPACITY_WAIT) => {
                debug!(
                    outstanding = self.outstanding.len(),
                    bytes = self.outstanding.bytes(),
                    "flow control limit reached, pulling suspended"
                );
                return Ok(RecordsWithSplitIds::default());
            }
        }

        let mut subscriptions: Vec<String> =
            self.splits.iter().map(SubscriptionSplit::subscription_path).collect();
        subscriptions.dedup();

        let max_messages = self.config.max_messages_per_pull;
        let client = &self.client;
        let pulls = subscriptions.iter().flat_map(|path| {
            (0..self.config.parallel_pull_count).map(move |_| async move {
                (path.as_str(), client.pull(path, max_messages).await)
            })
        });
        let results = join_all(pulls).await;

        let mut batch = RecordsWithSplitIds::default();
        let mut last_error = None;
        for (path, result) in results {
            match result {
                Ok(messages) => {
                    for message in messages {
                        let Some(split_id) = self.owning_split(path, &message) else {
                            continue;
                        };
                        let bytes = message.size_bytes();
                        self.outstanding.admit(message.ack_id.clone(), path, bytes);
                        self.tracker.record_delivery(message.ack_id.clone());
                        self.metrics.record_message(bytes);
                        batch.records.push((split_id, message));
                    }
                }
                Err(e) => {
                    self.metrics.record_pull_error();
                    warn!(subscription = %path, error = %e, "pull failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if batch.records.is_empty() => Err(e),
            _ => Ok(batch),
        }
    }

    fn handle_splits_changes(&mut self, splits: Vec<SubscriptionSplit>) {
        for split in splits {
            if self.splits.contains(&split) {
                continue;
            }
            info!(split = %split, "split assigned to reader");
            self.splits.push(split);
        }
        self.splits
            .sort_by_key(SubscriptionSplit::subscription_path);
    }

    fn wake_up(&self) {
        self.wakeup.notify_one();
    }

    async fn close(&mut self) -> Result<(), PubSubError> {
        let _ = self.shutdown.send(true);
        for handle in [self.ack_handle.take(), self.lease_handle.take()]
            .into_iter()
            .flatten()
        {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("background task did not stop within 5s");
            }
        }
        info!(
            outstanding = self.outstanding.len(),
            "split reader closed; unacknowledged messages will be redelivered"
        );
        Ok(())
    }
}

impl<C: PubSubClient> std::fmt::Debug for PubSubSplitReader<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSplitReader")
            .field("splits", &self.splits)
            .field("outstanding", &self.outstanding.len())
            .field("started", &self.ack_rx.is_none())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct AckRetry {
    attempts: u32,
    backoff: Duration,
}

#[derive(Debug, Clone, Copy)]
struct LeasePolicy {
    interval: Duration,
    ack_deadline: Duration,
    max_lease_duration: Duration,
}

async fn run_ack_task<C: PubSubClient>(
    client: Arc<C>,
    outstanding: Arc<OutstandingMessages>,
    metrics: Arc<PubSubSourceMetrics>,
    mut ack_rx: AckReceiver,
    retry: AckRetry,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let ids = tokio::select! {
            biased;
            ids = ack_rx.rx.recv() => match ids {
                Some(ids) => ids,
                None => break,
            },
            _ = shutdown.changed() => {
                // Flush whatever was released before shutdown.
                while let Ok(ids) = ack_rx.rx.try_recv() {
                    acknowledge_released(&*client, &outstanding, &metrics, &ids, retry).await;
                }
                break;
            }
        };
        acknowledge_released(&*client, &outstanding, &metrics, &ids, retry).await;
    }
    debug!("ack task stopped");
}

async fn acknowledge_released<C: PubSubClient>(
    client: &C,
    outstanding: &OutstandingMessages,
    metrics: &PubSubSourceMetrics,
    ids: &[AckId],
    retry: AckRetry,
) {
    let grouped = outstanding.release(ids);
    let leased: usize = grouped.values().map(Vec::len).sum();
    if leased < ids.len() {
        debug!(
            skipped = ids.len() - leased,
            "ack ids without a lease were not acknowledged"
        );
    }
    for (subscription, ids) in grouped {
        for chunk in ids.chunks(MAX_ACK_IDS_PER_REQUEST) {
            acknowledge_with_retry(client, metrics, &subscription, chunk, retry).await;
        }
    }
}

async fn acknowledge_with_retry<C: PubSubClient>(
    client: &C,
    metrics: &PubSubSourceMetrics,
    subscription: &str,
    ids: &[AckId],
    retry: AckRetry,
) {
    let mut backoff = retry.backoff;
    for attempt in 1..=retry.attempts {
        match client.acknowledge(subscription, ids).await {
            Ok(()) => {
                metrics.record_acks(ids.len() as u64);
                debug!(subscription, ack_ids = ids.len(), "acknowledged");
                return;
            }
            Err(e) if attempt < retry.attempts => {
                warn!(
                    subscription,
                    attempt,
                    error = %e,
                    "acknowledge failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => {
                metrics.record_ack_failures(ids.len() as u64);
                warn!(
                    subscription,
                    ack_ids = ids.len(),
                    error = %e,
                    "acknowledge failed, giving up; messages will be redelivered"
                );
            }
        }
    }
}

async fn run_lease_task<C: PubSubClient>(
    client: Arc<C>,
    outstanding: Arc<OutstandingMessages>,
    metrics: Arc<PubSubSourceMetrics>,
    policy: LeasePolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; leases are fresh at that point.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let expired = outstanding.expire(policy.max_lease_duration);
        if !expired.is_empty() {
            metrics.record_expired(expired.len() as u64);
            warn!(
                leases = expired.len(),
                "leases exceeded max lease duration; messages will be redelivered"
            );
        }

        let leases: BTreeMap<String, Vec<AckId>> = outstanding.leases_by_subscription();
        for (subscription, ids) in leases {
            for chunk in ids.chunks(MAX_ACK_IDS_PER_REQUEST) {
                match client
                    .modify_ack_deadline(&subscription, chunk, policy.ack_deadline)
                    .await
                {
                    Ok(()) => metrics.record_extensions(chunk.len() as u64),
                    Err(e) => warn!(
                        subscription = %subscription,
                        ack_ids = chunk.len(),
                        error = %e,
                        "failed to extend ack deadlines"
                    ),
                }
            }
        }
    }
    debug!("lease extension task stopped");
}
