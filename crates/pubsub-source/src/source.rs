//! Entry point that builds readers for a configured subscription.

use std::sync::Arc;

use crate::client::PubSubClient;
use crate::config::{ConnectorConfig, PubSubSourceConfig};
use crate::emitter::RecordEmitter;
use crate::error::PubSubError;
use crate::metrics::PubSubSourceMetrics;
use crate::outstanding::{FlowControlLimits, OutstandingMessages};
use crate::source_reader::PubSubSourceReader;
use crate::split::{SubscriptionSplit, SubscriptionSplitSerializer};
use crate::split_reader::{ack_channel, PubSubSplitReader};
use crate::tracker::{AckTracker, PubSubAckTracker};

/// Reader type produced by [`PubSubSource::create_reader`].
pub type PubSubReader<C, E> = PubSubSourceReader<PubSubSplitReader<C>, E>;

/// An unbounded source over one Pub/Sub subscription.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use pubsub_source::{PubSubClient, PubSubSource, PubSubSourceConfig};
/// # use pubsub_source::emitter::{PubSubRecordEmitter, RawPayload};
/// # fn demo<C: PubSubClient>(client: Arc<C>) -> Result<(), pubsub_source::PubSubError> {
/// let config = PubSubSourceConfig::new("my-project", "my-subscription")
///     .with_max_outstanding_messages_count(500);
/// let source = PubSubSource::new(config, client)?;
/// let reader = source.create_reader(PubSubRecordEmitter::new(RawPayload))?;
/// # let _ = reader;
/// # Ok(())
/// # }
/// ```
pub struct PubSubSource<C: PubSubClient> {
    config: PubSubSourceConfig,
    client: Arc<C>,
}

impl<C: PubSubClient> PubSubSource<C> {
    /// Creates a source after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::ConfigurationError` if the config is invalid.
    pub fn new(config: PubSubSourceConfig, client: Arc<C>) -> Result<Self, PubSubError> {
        config.validate()?;
        Ok(Self { config, client })
    }

    /// Creates a source from a property map.
    ///
    /// # Errors
    ///
    /// See [`PubSubSourceConfig::from_config`].
    pub fn from_connector_config(
        config: &ConnectorConfig,
        client: Arc<C>,
    ) -> Result<Self, PubSubError> {
        Self::new(PubSubSourceConfig::from_config(config)?, client)
    }

    /// The validated config.
    #[must_use]
    pub fn config(&self) -> &PubSubSourceConfig {
        &self.config
    }

    /// Splits to assign. A subscription is a single unbounded split.
    #[must_use]
    pub fn splits(&self) -> Vec<SubscriptionSplit> {
        vec![self.config.split()]
    }

    /// Serializer for persisting splits in checkpoints.
    #[must_use]
    pub fn split_serializer(&self) -> SubscriptionSplitSerializer {
        SubscriptionSplitSerializer
    }

    /// Builds a reader with its own tracker, leases and metrics.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::ConfigurationError` if the config no longer
    /// validates.
    pub fn create_reader<E: RecordEmitter>(
        &self,
        emitter: E,
    ) -> Result<PubSubReader<C, E>, PubSubError> {
        let metrics = Arc::new(PubSubSourceMetrics::new());
        let outstanding = Arc::new(OutstandingMessages::new(FlowControlLimits::from_config(
            &self.config,
        )));
        let (dispatcher, ack_rx) = ack_channel();
        let tracker: Arc<dyn AckTracker> = Arc::new(PubSubAckTracker::new(Arc::new(dispatcher)));

        let split_reader = PubSubSplitReader::new(
            Arc::clone(&self.client),
            self.config.clone(),
            Arc::clone(&tracker),
            ack_rx,
            outstanding,
            Arc::clone(&metrics),
        )?;
        Ok(PubSubSourceReader::new(
            split_reader,
            emitter,
            tracker,
            metrics,
        ))
    }
}

impl<C: PubSubClient> std::fmt::Debug for PubSubSource<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSource")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
