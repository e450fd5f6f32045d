//! # Pub/Sub Source
//!
//! Checkpoint-aligned source connector for Google Cloud Pub/Sub
//! subscriptions.
//!
//! Messages are pulled, emitted downstream and held on lease. Their ack ids
//! are sealed under a checkpoint when the engine snapshots, and only
//! acknowledged once that checkpoint is confirmed durable. A failure
//! between the two leaves the messages unacknowledged, so the service
//! redelivers them and nothing processed-but-uncheckpointed is lost.
//!
//! The pieces, from the wire up:
//!
//! - [`PubSubClient`]: pull / acknowledge / modify-deadline RPCs.
//! - [`split_reader::PubSubSplitReader`]: pulling under flow control, the
//!   ack task and lease extension.
//! - [`tracker::PubSubAckTracker`]: the checkpoint to ack id mapping.
//! - [`source_reader::PubSubSourceReader`]: what the engine drives.
//! - [`reader_task::spawn_reader_task`]: runs a reader on its own task.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Messaging client interface
pub mod client;

/// Connector configuration
pub mod config;

/// Record emission and payload deserialization
pub mod emitter;

/// Error types
pub mod error;

/// Pulled messages and ack ids
pub mod message;

/// Source metrics
pub mod metrics;

/// Lease bookkeeping and flow control
pub mod outstanding;

/// Reader task actor
pub mod reader_task;

/// Source entry point
pub mod source;

/// Engine-facing source reader
pub mod source_reader;

/// Subscription splits
pub mod split;

/// Pull loop, ack dispatch and lease extension
pub mod split_reader;

/// Checkpoint-aligned acknowledgment tracking
pub mod tracker;

/// In-memory test doubles
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::PubSubClient;
pub use config::{ConnectorConfig, Credentials, PubSubSourceConfig};
pub use error::PubSubError;
pub use message::{AckId, PubSubMessage};
pub use source::PubSubSource;
pub use source_reader::{InputStatus, PubSubSourceReader, SourceReader};
pub use split::{SubscriptionSplit, SubscriptionSplitSerializer, SubscriptionSplitState};
pub use tracker::{AckTracker, Acknowledger, PubSubAckTracker};
