//! Reader-local mutable state for an assigned split.

use crate::message::{AckId, PubSubMessage};

use super::subscription::SubscriptionSplit;

/// Wraps an immutable [`SubscriptionSplit`] with the owning reader's
/// progress. Exclusively owned by the reader the split is assigned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSplitState {
    split: SubscriptionSplit,
    messages_consumed: u64,
    bytes_consumed: u64,
    last_ack_id: Option<AckId>,
    last_publish_time_millis: Option<i64>,
}

impl SubscriptionSplitState {
    /// Creates a state with progress at its start.
    #[must_use]
    pub fn new(split: SubscriptionSplit) -> Self {
        Self {
            split,
            messages_consumed: 0,
            bytes_consumed: 0,
            last_ack_id: None,
            last_publish_time_millis: None,
        }
    }

    /// The owned split.
    #[must_use]
    pub fn split(&self) -> &SubscriptionSplit {
        &self.split
    }

    /// Advances progress past `message`.
    pub fn record_consumed(&mut self, message: &PubSubMessage) {
        self.messages_consumed += 1;
        self.bytes_consumed += message.size_bytes();
        self.last_ack_id = Some(message.ack_id.clone());
        self.last_publish_time_millis = Some(
            self.last_publish_time_millis
                .map_or(message.publish_time_millis, |t| t.max(message.publish_time_millis)),
        );
    }

    /// Messages consumed from this split by this reader.
    #[must_use]
    pub fn messages_consumed(&self) -> u64 {
        self.messages_consumed
    }

    /// Payload bytes consumed from this split by this reader.
    #[must_use]
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// Ack id of the most recently consumed message.
    #[must_use]
    pub fn last_ack_id(&self) -> Option<&AckId> {
        self.last_ack_id.as_ref()
    }

    /// Largest publish time seen so far.
    #[must_use]
    pub fn last_publish_time_millis(&self) -> Option<i64> {
        self.last_publish_time_millis
    }
}
