//! Messages delivered by a subscription pull.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Service-issued token identifying one delivery of a message.
///
/// Redelivery of the same message yields a new id, and an id is never
/// reused after it has been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AckId(String);

impl AckId {
    /// Wraps a raw acknowledgment id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AckId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AckId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A message received from a subscription, together with its ack id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Acknowledgment id of this delivery.
    pub ack_id: AckId,
    /// Server-assigned message id (stable across redeliveries).
    pub message_id: String,
    /// Message payload.
    pub data: Bytes,
    /// User attributes.
    pub attributes: HashMap<String, String>,
    /// Ordering key, if the publisher set one.
    pub ordering_key: Option<String>,
    /// Publish time in epoch milliseconds.
    pub publish_time_millis: i64,
    /// Delivery attempt counter, when dead-lettering is enabled.
    pub delivery_attempt: Option<u32>,
}

impl PubSubMessage {
    /// Creates a message with only an ack id, message id and payload.
    #[must_use]
    pub fn new(ack_id: impl Into<AckId>, message_id: impl Into<String>, data: Bytes) -> Self {
        Self {
            ack_id: ack_id.into(),
            message_id: message_id.into(),
            data,
            attributes: HashMap::new(),
            ordering_key: None,
            publish_time_millis: 0,
            delivery_attempt: None,
        }
    }

    /// Size used for flow-control accounting.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        (self.data.len() + attrs) as u64
    }
}
