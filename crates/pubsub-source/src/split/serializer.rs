//! Versioned binary serializer for [`SubscriptionSplit`].
//!
//! The payload is the `bincode` encoding of the split. The version travels
//! next to the payload (the engine stores it), or in front of it when the
//! envelope helpers are used:
//!
//! ```text
//! +----------------+----------------------------+
//! | version: u32BE | bincode(SubscriptionSplit) |
//! +----------------+----------------------------+
//! ```
//!
//! Every version this build has ever produced stays decodable so that old
//! checkpoints remain restorable.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::PubSubError;

use super::subscription::SubscriptionSplit;

/// Upper bound on bytes a decoded split may claim. Length prefixes beyond
/// it fail before anything is allocated.
const DECODE_LIMIT: usize = 64 * 1024;

/// Serializer for [`SubscriptionSplit`] checkpoint payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionSplitSerializer;

impl SubscriptionSplitSerializer {
    /// Version written by this build.
    pub const VERSION: u32 = 0;

    /// Size of the version prefix in an envelope.
    const VERSION_LEN: usize = 4;

    /// Returns the version written by [`serialize`](Self::serialize).
    #[must_use]
    pub fn version(&self) -> u32 {
        Self::VERSION
    }

    /// Encodes the split payload (without the version).
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::Encode` if the encoder fails.
    pub fn serialize(&self, split: &SubscriptionSplit) -> Result<Vec<u8>, PubSubError> {
        Ok(bincode::serde::encode_to_vec(
            split,
            bincode::config::standard(),
        )?)
    }

    /// Decodes a payload written under `version`.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::Decode` for unknown versions, truncated or
    /// malformed input, trailing bytes, or a structurally invalid split.
    pub fn deserialize(&self, version: u32, bytes: &[u8]) -> Result<SubscriptionSplit, PubSubError> {
        match version {
            0 => Self::deserialize_v0(bytes),
            other => Err(PubSubError::Decode(format!(
                "unsupported split serializer version {other} (max supported {})",
                Self::VERSION
            ))),
        }
    }

    /// Encodes the split with its version prefix.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::Encode` if the encoder fails.
    pub fn serialize_versioned(&self, split: &SubscriptionSplit) -> Result<Vec<u8>, PubSubError> {
        let payload = self.serialize(split)?;
        let mut buf = BytesMut::with_capacity(Self::VERSION_LEN + payload.len());
        buf.put_u32(self.version());
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    /// Decodes an envelope produced by [`serialize_versioned`](Self::serialize_versioned).
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::Decode` if the envelope is shorter than the
    /// version prefix or the payload fails to decode.
    pub fn deserialize_versioned(&self, bytes: &[u8]) -> Result<SubscriptionSplit, PubSubError> {
        if bytes.len() < Self::VERSION_LEN {
            return Err(PubSubError::Decode(format!(
                "envelope of {} bytes is shorter than the version prefix",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let version = buf.get_u32();
        self.deserialize(version, buf)
    }

    fn deserialize_v0(bytes: &[u8]) -> Result<SubscriptionSplit, PubSubError> {
        let (split, consumed): (SubscriptionSplit, usize) =
            bincode::serde::decode_from_slice(
                bytes,
                bincode::config::standard().with_limit::<{ DECODE_LIMIT }>(),
            )?;
        if consumed != bytes.len() {
            return Err(PubSubError::Decode(format!(
                "{} trailing bytes after split payload",
                bytes.len() - consumed
            )));
        }
        split.validate()?;
        Ok(split)
    }
}
