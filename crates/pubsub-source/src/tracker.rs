//! Checkpoint-aligned acknowledgment tracking.
//!
//! Messages pulled from a subscription must not be acknowledged until the
//! engine has durably checkpointed the fact that it processed them. The
//! [`AckTracker`] collects ack ids as messages are delivered, seals them
//! under a checkpoint id when the engine snapshots, and releases every
//! sealed id once a checkpoint at or after it is confirmed complete.
//!
//! ```text
//! record_delivery(a), record_delivery(b)
//! add_checkpoint(1)                 pending = {1: [a, b]}
//! record_delivery(c)
//! add_checkpoint(2)                 pending = {1: [a, b], 2: [c]}
//! notify_checkpoint_complete(1)  -> acknowledge [a, b]
//! ```
//!
//! Acknowledgment itself is performed by an [`Acknowledger`] outside the
//! tracker's lock. A failed acknowledgment is not rolled back: the service
//! redelivers the message once its ack deadline lapses.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::PubSubError;
use crate::message::AckId;

/// Collaborator that issues acknowledgment RPCs for released ids.
///
/// Implementations must not block: the call is made on the checkpoint
/// completion path.
pub trait Acknowledger: Send + Sync {
    /// Hands ids whose checkpoint is durable over for acknowledgment.
    fn acknowledge(&self, ack_ids: Vec<AckId>);
}

/// Tracks which delivered messages each checkpoint covers.
pub trait AckTracker: Send + Sync {
    /// Registers a delivered message. Called before the message is emitted.
    fn record_delivery(&self, ack_id: AckId);

    /// Seals all ids delivered since the previous checkpoint under
    /// `checkpoint_id`.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::ContractViolation` if `checkpoint_id` is not
    /// strictly greater than every previously added checkpoint id.
    fn add_checkpoint(&self, checkpoint_id: u64) -> Result<(), PubSubError>;

    /// Releases the ids of every pending checkpoint `<= checkpoint_id` and
    /// hands them to the acknowledger. Returns the released ids.
    ///
    /// Calling it again for an already-completed checkpoint returns an
    /// empty vec.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::ContractViolation` if `checkpoint_id` is newer
    /// than any checkpoint that was ever added.
    fn notify_checkpoint_complete(&self, checkpoint_id: u64) -> Result<Vec<AckId>, PubSubError>;
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Delivered ids not yet covered by a checkpoint.
    unassigned: Vec<AckId>,
    /// Sealed ids awaiting checkpoint completion, keyed by checkpoint id.
    pending: BTreeMap<u64, Vec<AckId>>,
    /// Highest checkpoint id passed to `add_checkpoint`.
    last_checkpoint_id: Option<u64>,
}

/// Mutex-guarded [`AckTracker`].
///
/// All three operations take the same lock, so the pull loop and the
/// engine's checkpoint callbacks can interleave freely.
pub struct PubSubAckTracker {
    state: Mutex<TrackerState>,
    acknowledger: Arc<dyn Acknowledger>,
}

impl PubSubAckTracker {
    /// Creates a tracker that releases ids to `acknowledger`.
    #[must_use]
    pub fn new(acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            acknowledger,
        }
    }

    /// Number of checkpoints with ids still awaiting completion.
    #[must_use]
    pub fn pending_checkpoints(&self) -> usize {
        self.state
            .lock()
            .pending
            .values()
            .filter(|ids| !ids.is_empty())
            .count()
    }

    /// Number of sealed ids awaiting checkpoint completion.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        self.state.lock().pending.values().map(Vec::len).sum()
    }

    /// Number of delivered ids not yet covered by a checkpoint.
    #[must_use]
    pub fn unassigned_count(&self) -> usize {
        self.state.lock().unassigned.len()
    }

    /// Highest checkpoint id added so far.
    #[must_use]
    pub fn last_checkpoint_id(&self) -> Option<u64> {
        self.state.lock().last_checkpoint_id
    }

    /// Ids sealed under `checkpoint_id`, if it is still pending.
    #[must_use]
    pub fn pending_for(&self, checkpoint_id: u64) -> Option<Vec<AckId>> {
        self.state.lock().pending.get(&checkpoint_id).cloned()
    }
}

impl AckTracker for PubSubAckTracker {
    fn record_delivery(&self, ack_id: AckId) {
        self.state.lock().unassigned.push(ack_id);
    }

    fn add_checkpoint(&self, checkpoint_id: u64) -> Result<(), PubSubError> {
        let mut state = self.state.lock();
        if let Some(last) = state.last_checkpoint_id {
            if checkpoint_id <= last {
                error!(
                    checkpoint_id,
                    last_checkpoint_id = last,
                    "checkpoint ids must be strictly increasing"
                );
                return Err(PubSubError::ContractViolation(format!(
                    "checkpoint {checkpoint_id} added after checkpoint {last}"
                )));
            }
        }

        let ids = std::mem::take(&mut state.unassigned);
        debug!(checkpoint_id, ack_ids = ids.len(), "sealed ack ids under checkpoint");
        state.pending.insert(checkpoint_id, ids);
        state.last_checkpoint_id = Some(checkpoint_id);
        Ok(())
    }

    fn notify_checkpoint_complete(&self, checkpoint_id: u64) -> Result<Vec<AckId>, PubSubError> {
        let released = {
            let mut state = self.state.lock();
            match state.last_checkpoint_id {
                Some(last) if checkpoint_id <= last => {}
                last => {
                    error!(
                        checkpoint_id,
                        last_checkpoint_id = ?last,
                        "completion notified for a checkpoint that was never started"
                    );
                    return Err(PubSubError::ContractViolation(format!(
                        "checkpoint {checkpoint_id} completed but was never started \
                         (last started: {last:?})"
                    )));
                }
            }

            let later = match checkpoint_id.checked_add(1) {
                Some(next) => state.pending.split_off(&next),
                None => BTreeMap::new(),
            };
            let completed = std::mem::replace(&mut state.pending, later);
            let drained_checkpoints = completed.len();
            let released: Vec<AckId> = completed.into_values().flatten().collect();
            debug!(
                checkpoint_id,
                drained_checkpoints,
                ack_ids = released.len(),
                "checkpoint complete"
            );
            released
        };

        if !released.is_empty() {
            self.acknowledger.acknowledge(released.clone());
        }
        Ok(released)
    }
}

impl std::fmt::Debug for PubSubAckTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PubSubAckTracker")
            .field("unassigned", &state.unassigned.len())
            .field("pending_checkpoints", &state.pending.len())
            .field("last_checkpoint_id", &state.last_checkpoint_id)
            .finish_non_exhaustive()
    }
}
