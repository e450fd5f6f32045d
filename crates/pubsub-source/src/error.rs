//! Error types for the Pub/Sub source.

use thiserror::Error;

/// Errors raised by the Pub/Sub source connector.
///
/// Two variants are fatal ([`PubSubError::is_fatal`]): they signal an
/// integration bug between the connector and the engine and must terminate
/// the reader task instead of being retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PubSubError {
    /// The engine broke a checkpoint protocol invariant.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A split of this unbounded source was reported finished.
    #[error("splits should never become finished, since the source is unbounded: {0:?}")]
    SplitFinished(Vec<String>),

    /// A persisted split could not be decoded.
    #[error("failed to decode subscription split: {0}")]
    Decode(String),

    /// A message payload could not be turned into a record.
    #[error("failed to deserialize message {message_id}: {reason}")]
    Deserialization {
        /// Server-assigned id of the offending message.
        message_id: String,
        /// Why the payload was rejected.
        reason: String,
    },

    /// A split could not be encoded for persistence.
    #[error("failed to encode subscription split: {0}")]
    Encode(String),

    /// Invalid connector configuration.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A required configuration key is absent.
    #[error("missing required configuration key '{0}'")]
    MissingConfig(String),

    /// An RPC against the messaging service failed.
    #[error("{operation} failed: {message}")]
    Rpc {
        /// The RPC that failed (`pull`, `acknowledge`, `modify_ack_deadline`).
        operation: &'static str,
        /// Transport or service error message.
        message: String,
    },

    /// An operation was invoked in the wrong lifecycle state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// The reader task is gone.
    #[error("source reader has shut down")]
    Shutdown,
}

impl PubSubError {
    /// Creates an [`PubSubError::Rpc`] error.
    pub fn rpc(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Rpc {
            operation,
            message: message.into(),
        }
    }

    /// Returns `true` for errors that must abort the job.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ContractViolation(_) | Self::SplitFinished(_))
    }

    /// Returns `true` if retrying the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }
}

impl From<bincode::error::DecodeError> for PubSubError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for PubSubError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Encode(e.to_string())
    }
}
