//! Turning pulled messages into records.
//!
//! A [`RecordEmitter`] receives each message with the state of the split it
//! came from, pushes zero or more records into a [`SourceOutput`] and
//! updates the split's progress. [`PubSubRecordEmitter`] does this with a
//! pluggable [`MessageDeserializer`].

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::PubSubError;
use crate::message::PubSubMessage;
use crate::split::SubscriptionSplitState;

/// Downstream sink for records produced by the source.
pub trait SourceOutput<T> {
    /// Emits a record without an event timestamp.
    fn collect(&mut self, record: T);

    /// Emits a record with an event timestamp in epoch milliseconds.
    fn collect_with_timestamp(&mut self, record: T, timestamp_millis: i64) {
        let _ = timestamp_millis;
        self.collect(record);
    }
}

impl<T> SourceOutput<T> for Vec<T> {
    fn collect(&mut self, record: T) {
        self.push(record);
    }
}

/// Converts a message payload into a record.
pub trait MessageDeserializer: Send {
    /// Record type produced.
    type Output: Send;

    /// Deserializes one message.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Deserialization`] if the payload is malformed.
    fn deserialize(&self, message: &PubSubMessage) -> Result<Self::Output, PubSubError>;
}

/// Passes the raw payload through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPayload;

impl MessageDeserializer for RawPayload {
    type Output = Bytes;

    fn deserialize(&self, message: &PubSubMessage) -> Result<Bytes, PubSubError> {
        Ok(message.data.clone())
    }
}

/// Parses the payload as JSON into `T`.
#[derive(Debug)]
pub struct JsonDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDeserializer<T> {
    /// Creates a JSON deserializer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send> MessageDeserializer for JsonDeserializer<T> {
    type Output = T;

    fn deserialize(&self, message: &PubSubMessage) -> Result<T, PubSubError> {
        serde_json::from_slice(&message.data).map_err(|e| PubSubError::Deserialization {
            message_id: message.message_id.clone(),
            reason: e.to_string(),
        })
    }
}

/// Emits records for a message and advances its split state.
pub trait RecordEmitter: Send {
    /// Record type produced.
    type Output: Send;

    /// Emits the records for `message` into `output` and records the
    /// message as consumed on `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be converted.
    fn emit<O>(
        &mut self,
        message: PubSubMessage,
        output: &mut O,
        state: &mut SubscriptionSplitState,
    ) -> Result<(), PubSubError>
    where
        O: SourceOutput<Self::Output> + ?Sized;
}

/// [`RecordEmitter`] that deserializes each message into one record
/// stamped with its publish time.
#[derive(Debug, Clone, Default)]
pub struct PubSubRecordEmitter<D> {
    deserializer: D,
}

impl<D: MessageDeserializer> PubSubRecordEmitter<D> {
    /// Creates an emitter around `deserializer`.
    #[must_use]
    pub fn new(deserializer: D) -> Self {
        Self { deserializer }
    }
}

impl<D: MessageDeserializer> RecordEmitter for PubSubRecordEmitter<D> {
    type Output = D::Output;

    fn emit<O>(
        &mut self,
        message: PubSubMessage,
        output: &mut O,
        state: &mut SubscriptionSplitState,
    ) -> Result<(), PubSubError>
    where
        O: SourceOutput<Self::Output> + ?Sized,
    {
        let record = self.deserializer.deserialize(&message)?;
        output.collect_with_timestamp(record, message.publish_time_millis);
        state.record_consumed(&message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::split::SubscriptionSplit;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    fn msg(ack: &str, data: &'static [u8]) -> PubSubMessage {
        let mut m = PubSubMessage::new(ack, format!("m-{ack}"), Bytes::from_static(data));
        m.publish_time_millis = 1_700_000_000_000;
        m
    }

    #[test]
    fn test_raw_emitter_updates_state() {
        let mut emitter = PubSubRecordEmitter::new(RawPayload);
        let mut state = SubscriptionSplitState::new(SubscriptionSplit::new("p", "s"));
        let mut out: Vec<Bytes> = Vec::new();

        emitter.emit(msg("a", b"one"), &mut out, &mut state).unwrap();
        emitter.emit(msg("b", b"two"), &mut out, &mut state).unwrap();

        assert_eq!(out, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert_eq!(state.messages_consumed(), 2);
        assert_eq!(state.bytes_consumed(), 6);
        assert_eq!(state.last_ack_id().map(|a| a.as_str()), Some("b"));
    }

    #[test]
    fn test_json_emitter() {
        let mut emitter = PubSubRecordEmitter::new(JsonDeserializer::<Reading>::new());
        let mut state = SubscriptionSplitState::new(SubscriptionSplit::new("p", "s"));
        let mut out = Vec::new();

        emitter
            .emit(msg("a", br#"{"sensor":"t1","value":21.5}"#), &mut out, &mut state)
            .unwrap();
        assert_eq!(
            out,
            vec![Reading {
                sensor: "t1".into(),
                value: 21.5
            }]
        );
    }

    #[test]
    fn test_malformed_json_leaves_state_untouched() {
        let mut emitter = PubSubRecordEmitter::new(JsonDeserializer::<Reading>::new());
        let mut state = SubscriptionSplitState::new(SubscriptionSplit::new("p", "s"));
        let mut out = Vec::new();

        let err = emitter
            .emit(msg("a", b"not json"), &mut out, &mut state)
            .unwrap_err();
        assert!(matches!(err, PubSubError::Deserialization { ref message_id, .. } if message_id == "m-a"));
        assert!(out.is_empty());
        assert_eq!(state.messages_consumed(), 0);
    }
}
