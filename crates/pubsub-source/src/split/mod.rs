//! Subscription splits: the immutable descriptor, its reader-local state,
//! and the versioned serializer used to persist splits in checkpoints.

pub mod serializer;
pub mod state;
pub mod subscription;

pub use serializer::SubscriptionSplitSerializer;
pub use state::SubscriptionSplitState;
pub use subscription::SubscriptionSplit;
