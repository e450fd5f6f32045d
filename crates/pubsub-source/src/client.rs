//! Messaging service client interface.
//!
//! The wire client (gRPC stubs, auth, channel management) lives outside
//! this crate. The split reader consumes it through [`PubSubClient`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PubSubError;
use crate::message::{AckId, PubSubMessage};

/// The three subscriber RPCs the source needs.
///
/// `subscription` is always the fully qualified path
/// (`projects/{project}/subscriptions/{subscription}`).
#[async_trait]
pub trait PubSubClient: Send + Sync + 'static {
    /// Pulls up to `max_messages` messages. An empty result is normal for
    /// an idle subscription and never means the stream has ended.
    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> Result<Vec<PubSubMessage>, PubSubError>;

    /// Acknowledges the given deliveries.
    async fn acknowledge(&self, subscription: &str, ack_ids: &[AckId]) -> Result<(), PubSubError>;

    /// Sets the ack deadline of the given deliveries to `deadline` from now.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[AckId],
        deadline: Duration,
    ) -> Result<(), PubSubError>;
}
