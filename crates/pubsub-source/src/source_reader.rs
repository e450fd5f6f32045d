//! Engine-facing source reader.
//!
//! [`PubSubSourceReader`] composes a [`SplitReader`] (where messages come
//! from) with a [`RecordEmitter`] (how they become records) and wires both
//! to the [`AckTracker`] so acknowledgments follow checkpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::emitter::{RecordEmitter, SourceOutput};
use crate::error::PubSubError;
use crate::metrics::PubSubSourceMetrics;
use crate::split::{SubscriptionSplit, SubscriptionSplitState};
use crate::split_reader::SplitReader;
use crate::tracker::AckTracker;

/// Result of a single [`SourceReader::poll_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    /// Records were emitted; poll again immediately.
    MoreAvailable,
    /// Nothing was available; the caller may back off before polling.
    NothingAvailable,
}

/// Operations the engine drives on a source reader.
#[async_trait]
pub trait SourceReader: Send {
    /// Record type emitted.
    type Output: Send;

    /// Assigns splits to this reader.
    fn add_splits(&mut self, splits: Vec<SubscriptionSplit>);

    /// Fetches and emits the next batch of records.
    async fn poll_next<O>(&mut self, output: &mut O) -> Result<InputStatus, PubSubError>
    where
        O: SourceOutput<Self::Output> + Send + ?Sized;

    /// Begins checkpoint `checkpoint_id`, returning the splits to persist.
    fn snapshot_state(&mut self, checkpoint_id: u64) -> Result<Vec<SubscriptionSplit>, PubSubError>;

    /// Confirms that checkpoint `checkpoint_id` is durable.
    fn notify_checkpoint_complete(&mut self, checkpoint_id: u64) -> Result<(), PubSubError>;

    /// Stops the reader.
    async fn close(&mut self) -> Result<(), PubSubError>;
}

/// Source reader for Pub/Sub subscriptions.
///
/// Splits are never finished: the source is unbounded, so a finished split
/// is reported as [`PubSubError::SplitFinished`].
pub struct PubSubSourceReader<R, E> {
    split_reader: R,
    emitter: E,
    tracker: Arc<dyn AckTracker>,
    metrics: Arc<PubSubSourceMetrics>,
    split_states: BTreeMap<String, SubscriptionSplitState>,
    closed: bool,
}

impl<R: SplitReader, E: RecordEmitter> PubSubSourceReader<R, E> {
    /// Creates a reader. `tracker` must be the tracker `split_reader`
    /// records deliveries with.
    #[must_use]
    pub fn new(
        split_reader: R,
        emitter: E,
        tracker: Arc<dyn AckTracker>,
        metrics: Arc<PubSubSourceMetrics>,
    ) -> Self {
        Self {
            split_reader,
            emitter,
            tracker,
            metrics,
            split_states: BTreeMap::new(),
            closed: false,
        }
    }

    /// Fresh progress state for a newly assigned split.
    #[must_use]
    pub fn initialized_state(split: &SubscriptionSplit) -> SubscriptionSplitState {
        SubscriptionSplitState::new(split.clone())
    }

    /// The split to persist for a split's current state.
    #[must_use]
    pub fn to_split_type(_split_id: &str, state: &SubscriptionSplitState) -> SubscriptionSplit {
        state.split().clone()
    }

    /// Progress of an assigned split.
    #[must_use]
    pub fn split_state(&self, split_id: &str) -> Option<&SubscriptionSplitState> {
        self.split_states.get(split_id)
    }

    /// Number of assigned splits.
    #[must_use]
    pub fn split_count(&self) -> usize {
        self.split_states.len()
    }

    /// Source metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PubSubSourceMetrics> {
        &self.metrics
    }

    fn on_split_finished(&self, finished: Vec<String>) -> Result<(), PubSubError> {
        error!(splits = ?finished, "split reported finished on an unbounded source");
        Err(PubSubError::SplitFinished(finished))
    }
}

#[async_trait]
impl<R: SplitReader, E: RecordEmitter> SourceReader for PubSubSourceReader<R, E> {
    type Output = E::Output;

    fn add_splits(&mut self, splits: Vec<SubscriptionSplit>) {
        for split in &splits {
            self.split_states
                .entry(split.split_id())
                .or_insert_with(|| Self::initialized_state(split));
        }
        info!(splits = splits.len(), "adding splits to source reader");
        self.split_reader.handle_splits_changes(splits);
    }

    async fn poll_next<O>(&mut self, output: &mut O) -> Result<InputStatus, PubSubError>
    where
        O: SourceOutput<Self::Output> + Send + ?Sized,
    {
        if self.closed {
            return Err(PubSubError::Shutdown);
        }

        let batch = self.split_reader.fetch().await?;
        if !batch.finished_splits.is_empty() {
            self.on_split_finished(batch.finished_splits)?;
        }
        if batch.records.is_empty() {
            return Ok(InputStatus::NothingAvailable);
        }

        for (split_id, message) in batch.records {
            // The delivery is already tracked; dropping it here would let a
            // checkpoint acknowledge a message that was never emitted.
            let Some(state) = self.split_states.get_mut(&split_id) else {
                error!(split = %split_id, ack_id = %message.ack_id, "record for unassigned split");
                return Err(PubSubError::ContractViolation(format!(
                    "split reader returned a record for unassigned split {split_id}"
                )));
            };
            self.emitter.emit(message, output, state)?;
        }
        Ok(InputStatus::MoreAvailable)
    }

    fn snapshot_state(&mut self, checkpoint_id: u64) -> Result<Vec<SubscriptionSplit>, PubSubError> {
        self.tracker.add_checkpoint(checkpoint_id)?;
        let splits: Vec<SubscriptionSplit> = self
            .split_states
            .iter()
            .map(|(id, state)| Self::to_split_type(id, state))
            .collect();
        debug!(checkpoint_id, splits = splits.len(), "snapshot taken");
        Ok(splits)
    }

    fn notify_checkpoint_complete(&mut self, checkpoint_id: u64) -> Result<(), PubSubError> {
        let released = self.tracker.notify_checkpoint_complete(checkpoint_id)?;
        self.metrics.record_checkpoint_completed();
        debug!(
            checkpoint_id,
            released = released.len(),
            "checkpoint complete"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PubSubError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.split_reader.close().await
    }
}

impl<R, E> std::fmt::Debug for PubSubSourceReader<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSourceReader")
            .field("splits", &self.split_states.keys().collect::<Vec<_>>())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::emitter::{PubSubRecordEmitter, RawPayload};
    use crate::message::{AckId, PubSubMessage};
    use crate::split_reader::RecordsWithSplitIds;
    use crate::tracker::{Acknowledger, PubSubAckTracker};

    const SPLIT: &str = "projects/p/subscriptions/s";

    #[derive(Default)]
    struct Released(Mutex<Vec<AckId>>);

    impl Acknowledger for Released {
        fn acknowledge(&self, ack_ids: Vec<AckId>) {
            self.0.lock().extend(ack_ids);
        }
    }

    /// Split reader that replays scripted batches and records deliveries
    /// the way a real one does.
    struct ScriptedSplitReader {
        tracker: Arc<dyn AckTracker>,
        batches: VecDeque<RecordsWithSplitIds>,
        closed: bool,
    }

    #[async_trait]
    impl SplitReader for ScriptedSplitReader {
        async fn fetch(&mut self) -> Result<RecordsWithSplitIds, PubSubError> {
            let batch = self.batches.pop_front().unwrap_or_default();
            for (_, m) in &batch.records {
                self.tracker.record_delivery(m.ack_id.clone());
            }
            Ok(batch)
        }

        fn handle_splits_changes(&mut self, _splits: Vec<SubscriptionSplit>) {}

        fn wake_up(&self) {}

        async fn close(&mut self) -> Result<(), PubSubError> {
            self.closed = true;
            Ok(())
        }
    }

    fn batch(acks: &[&str]) -> RecordsWithSplitIds {
        RecordsWithSplitIds {
            records: acks
                .iter()
                .map(|a| {
                    (
                        SPLIT.to_string(),
                        PubSubMessage::new(*a, format!("m-{a}"), Bytes::from_static(b"x")),
                    )
                })
                .collect(),
            finished_splits: Vec::new(),
        }
    }

    type Reader = PubSubSourceReader<ScriptedSplitReader, PubSubRecordEmitter<RawPayload>>;

    fn reader(batches: Vec<RecordsWithSplitIds>) -> (Reader, Arc<Released>) {
        let released = Arc::new(Released::default());
        let tracker: Arc<dyn AckTracker> =
            Arc::new(PubSubAckTracker::new(Arc::clone(&released) as Arc<dyn Acknowledger>));
        let split_reader = ScriptedSplitReader {
            tracker: Arc::clone(&tracker),
            batches: batches.into(),
            closed: false,
        };
        let mut reader = PubSubSourceReader::new(
            split_reader,
            PubSubRecordEmitter::new(RawPayload),
            tracker,
            Arc::new(PubSubSourceMetrics::new()),
        );
        reader.add_splits(vec![SubscriptionSplit::new("p", "s")]);
        (reader, released)
    }

    fn released_ids(released: &Released) -> Vec<String> {
        released.0.lock().iter().map(|a| a.as_str().to_string()).collect()
    }

    #[tokio::test]
    async fn test_checkpoint_releases_emitted_messages() {
        let (mut reader, released) = reader(vec![batch(&["a", "b"]), batch(&["c"])]);
        let mut out = Vec::new();

        assert_eq!(reader.poll_next(&mut out).await.unwrap(), InputStatus::MoreAvailable);
        let splits = reader.snapshot_state(1).unwrap();
        assert_eq!(splits, vec![SubscriptionSplit::new("p", "s")]);

        reader.poll_next(&mut out).await.unwrap();
        reader.snapshot_state(2).unwrap();

        reader.notify_checkpoint_complete(1).unwrap();
        assert_eq!(released_ids(&released), vec!["a", "b"]);

        reader.notify_checkpoint_complete(2).unwrap();
        assert_eq!(released_ids(&released), vec!["a", "b", "c"]);
        assert_eq!(out.len(), 3);
        assert_eq!(reader.split_state(SPLIT).unwrap().messages_consumed(), 3);
    }

    #[tokio::test]
    async fn test_empty_fetch_reports_nothing_available() {
        let (mut reader, _) = reader(Vec::new());
        let mut out: Vec<Bytes> = Vec::new();
        assert_eq!(
            reader.poll_next(&mut out).await.unwrap(),
            InputStatus::NothingAvailable
        );
    }

    #[tokio::test]
    async fn test_finished_split_is_fatal() {
        let finished = RecordsWithSplitIds {
            records: Vec::new(),
            finished_splits: vec![SPLIT.to_string()],
        };
        let (mut reader, _) = reader(vec![finished]);
        let mut out: Vec<Bytes> = Vec::new();

        let err = reader.poll_next(&mut out).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err, PubSubError::SplitFinished(vec![SPLIT.to_string()]));
    }

    #[tokio::test]
    async fn test_record_for_unassigned_split_is_fatal() {
        let mut stray = batch(&["x"]);
        stray.records[0].0 = "projects/p/subscriptions/other".to_string();
        let (mut reader, released) = reader(vec![stray]);
        let mut out: Vec<Bytes> = Vec::new();

        let err = reader.poll_next(&mut out).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, PubSubError::ContractViolation(_)));
        assert!(out.is_empty());
        assert!(released_ids(&released).is_empty());
    }

    #[test]
    fn test_non_monotonic_snapshot_rejected() {
        let (mut reader, _) = reader(Vec::new());
        reader.snapshot_state(5).unwrap();
        let err = reader.snapshot_state(4).unwrap_err();
        assert!(matches!(err, PubSubError::ContractViolation(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_polling() {
        let (mut reader, _) = reader(Vec::new());
        reader.close().await.unwrap();
        reader.close().await.unwrap();
        assert!(reader.split_reader.closed);

        let mut out: Vec<Bytes> = Vec::new();
        assert_eq!(
            reader.poll_next(&mut out).await.unwrap_err(),
            PubSubError::Shutdown
        );
    }

    #[test]
    fn test_split_mappings() {
        let split = SubscriptionSplit::new("p", "s");
        let state = Reader::initialized_state(&split);
        assert_eq!(state.messages_consumed(), 0);
        assert_eq!(Reader::to_split_type(SPLIT, &state), split);
    }

    #[test]
    fn test_reassigning_split_keeps_progress() {
        let (mut reader, _) = reader(Vec::new());
        reader.add_splits(vec![SubscriptionSplit::new("p", "s")]);
        assert_eq!(reader.split_count(), 1);
    }
}
