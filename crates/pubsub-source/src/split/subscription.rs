//! The immutable subscription split descriptor.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PubSubError;

/// One logical partition of work: a subscription, optionally narrowed to an
/// ordering key.
///
/// Created once at split discovery and never mutated; it is persisted
/// verbatim in every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionSplit {
    project: String,
    subscription: String,
    ordering_key: Option<String>,
}

impl SubscriptionSplit {
    /// Creates a split for a whole subscription.
    #[must_use]
    pub fn new(project: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            subscription: subscription.into(),
            ordering_key: None,
        }
    }

    /// Narrows the split to a single ordering key.
    #[must_use]
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// Project that owns the subscription.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Subscription short name.
    #[must_use]
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Ordering key, if the split is keyed.
    #[must_use]
    pub fn ordering_key(&self) -> Option<&str> {
        self.ordering_key.as_deref()
    }

    /// Fully qualified subscription path used by the service.
    #[must_use]
    pub fn subscription_path(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project, self.subscription
        )
    }

    /// Stable split id. Unique per subscription and ordering key.
    #[must_use]
    pub fn split_id(&self) -> String {
        match &self.ordering_key {
            Some(key) => format!("{}#{key}", self.subscription_path()),
            None => self.subscription_path(),
        }
    }

    /// Checks structural validity (non-empty identity).
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::Decode` when the project or subscription is empty.
    pub fn validate(&self) -> Result<(), PubSubError> {
        if self.project.is_empty() {
            return Err(PubSubError::Decode("split has an empty project".into()));
        }
        if self.subscription.is_empty() {
            return Err(PubSubError::Decode(
                "split has an empty subscription".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for SubscriptionSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.split_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_path() {
        let split = SubscriptionSplit::new("proj", "sub");
        assert_eq!(split.subscription_path(), "projects/proj/subscriptions/sub");
        assert_eq!(split.split_id(), "projects/proj/subscriptions/sub");
        assert!(split.ordering_key().is_none());
    }

    #[test]
    fn test_keyed_split_id() {
        let split = SubscriptionSplit::new("proj", "sub").with_ordering_key("user-7");
        assert_eq!(split.split_id(), "projects/proj/subscriptions/sub#user-7");
        assert_eq!(split.ordering_key(), Some("user-7"));
    }

    #[test]
    fn test_validate() {
        assert!(SubscriptionSplit::new("p", "s").validate().is_ok());
        assert!(SubscriptionSplit::new("", "s").validate().is_err());
        assert!(SubscriptionSplit::new("p", "").validate().is_err());
    }
}
