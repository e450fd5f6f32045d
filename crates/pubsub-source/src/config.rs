//! Connector configuration.
//!
//! [`ConnectorConfig`] is the flat string property map handed over by the
//! engine (`WITH (...)` options). [`PubSubSourceConfig`] is the typed,
//! validated form the rest of the crate consumes. Required fields
//! (project and subscription) are constructor arguments, so a config
//! without them cannot be built.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PubSubError;
use crate::split::SubscriptionSplit;

// ---------------------------------------------------------------------------
// Property map
// ---------------------------------------------------------------------------

/// Flat key/value configuration for a connector instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorConfig {
    connector_type: String,
    properties: HashMap<String, String>,
}

impl ConnectorConfig {
    /// Creates an empty config for the given connector type.
    #[must_use]
    pub fn new(connector_type: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            properties: HashMap::new(),
        }
    }

    /// Creates a config pre-populated with `properties`.
    #[must_use]
    pub fn with_properties(
        connector_type: impl Into<String>,
        properties: HashMap<String, String>,
    ) -> Self {
        Self {
            connector_type: connector_type.into(),
            properties,
        }
    }

    /// Connector type name.
    #[must_use]
    pub fn connector_type(&self) -> &str {
        &self.connector_type
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Gets a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// All properties.
    #[must_use]
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Gets a required property.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::MissingConfig` if the key is absent or empty.
    pub fn require(&self, key: &str) -> Result<&str, PubSubError> {
        match self.get(key) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(PubSubError::MissingConfig(key.to_string())),
        }
    }

    /// Parses an optional property.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::ConfigurationError` if the value does not parse.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, PubSubError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| {
                    PubSubError::ConfigurationError(format!("invalid value for '{key}': {e}"))
                })
            })
            .transpose()
    }
}

/// Documentation of one recognised configuration key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigKeySpec {
    /// Key name.
    pub key: String,
    /// Human-readable description.
    pub description: String,
    /// Whether the key must be present.
    pub required: bool,
    /// Default value for optional keys.
    pub default: Option<String>,
}

impl ConfigKeySpec {
    /// A required key.
    #[must_use]
    pub fn required(key: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            required: true,
            default: None,
        }
    }

    /// An optional key with a default.
    #[must_use]
    pub fn optional(key: &str, description: &str, default: &str) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            required: false,
            default: Some(default.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helper: Duration as milliseconds
// ---------------------------------------------------------------------------

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const fn default_max_outstanding_messages_count() -> u64 {
    1_000
}

/// 100 MiB.
const fn default_max_outstanding_messages_bytes() -> u64 {
    100 * 1024 * 1024
}

const fn default_parallel_pull_count() -> u32 {
    1
}

const fn default_max_messages_per_pull() -> u32 {
    1_000
}

const fn default_ack_deadline() -> Duration {
    Duration::from_secs(10)
}

const fn default_lease_extension_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_lease_duration() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_ack_retry_attempts() -> u32 {
    3
}

const fn default_ack_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

/// Bounds the service accepts for an ack deadline.
const MIN_ACK_DEADLINE: Duration = Duration::from_secs(10);
const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// How the messaging client authenticates.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Ambient credentials from the environment.
    #[default]
    ApplicationDefault,
    /// Service account key file on disk.
    ServiceAccountFile {
        /// Path to the JSON key file.
        path: String,
    },
    /// Pre-minted OAuth access token.
    AccessToken {
        /// Bearer token.
        token: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApplicationDefault => f.write_str("ApplicationDefault"),
            Self::ServiceAccountFile { path } => f
                .debug_struct("ServiceAccountFile")
                .field("path", path)
                .finish(),
            Self::AccessToken { .. } => f.write_str("AccessToken(***)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed source config
// ---------------------------------------------------------------------------

/// Validated configuration of a Pub/Sub source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubSourceConfig {
    /// Project that owns the subscription.
    pub project_name: String,

    /// Subscription short name.
    pub subscription_name: String,

    /// Maximum delivered-but-unacknowledged messages. `0` disables the bound.
    #[serde(default = "default_max_outstanding_messages_count")]
    pub max_outstanding_messages_count: u64,

    /// Maximum delivered-but-unacknowledged payload bytes. `0` disables the bound.
    #[serde(default = "default_max_outstanding_messages_bytes")]
    pub max_outstanding_messages_bytes: u64,

    /// Number of concurrent pull requests per fetch.
    #[serde(default = "default_parallel_pull_count")]
    pub parallel_pull_count: u32,

    /// Maximum messages requested by a single pull.
    #[serde(default = "default_max_messages_per_pull")]
    pub max_messages_per_pull: u32,

    /// Client credentials.
    #[serde(default)]
    pub credentials: Credentials,

    /// Service endpoint override (e.g. an emulator).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Ack deadline requested when extending leases.
    #[serde(default = "default_ack_deadline", with = "duration_millis")]
    pub ack_deadline: Duration,

    /// How often outstanding leases are extended.
    #[serde(default = "default_lease_extension_interval", with = "duration_millis")]
    pub lease_extension_interval: Duration,

    /// Leases older than this are no longer extended.
    #[serde(default = "default_max_lease_duration", with = "duration_millis")]
    pub max_lease_duration: Duration,

    /// Attempts per acknowledgment batch before giving up.
    #[serde(default = "default_ack_retry_attempts")]
    pub ack_retry_attempts: u32,

    /// Initial backoff between acknowledgment attempts (doubles per attempt).
    #[serde(default = "default_ack_retry_backoff", with = "duration_millis")]
    pub ack_retry_backoff: Duration,
}

impl PubSubSourceConfig {
    /// Creates a config with defaults for every optional field.
    #[must_use]
    pub fn new(project_name: impl Into<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            subscription_name: subscription_name.into(),
            max_outstanding_messages_count: default_max_outstanding_messages_count(),
            max_outstanding_messages_bytes: default_max_outstanding_messages_bytes(),
            parallel_pull_count: default_parallel_pull_count(),
            max_messages_per_pull: default_max_messages_per_pull(),
            credentials: Credentials::default(),
            endpoint: None,
            ack_deadline: default_ack_deadline(),
            lease_extension_interval: default_lease_extension_interval(),
            max_lease_duration: default_max_lease_duration(),
            ack_retry_attempts: default_ack_retry_attempts(),
            ack_retry_backoff: default_ack_retry_backoff(),
        }
    }

    /// Sets the outstanding message bound.
    #[must_use]
    pub fn with_max_outstanding_messages_count(mut self, count: u64) -> Self {
        self.max_outstanding_messages_count = count;
        self
    }

    /// Sets the outstanding byte bound.
    #[must_use]
    pub fn with_max_outstanding_messages_bytes(mut self, bytes: u64) -> Self {
        self.max_outstanding_messages_bytes = bytes;
        self
    }

    /// Sets the number of concurrent pulls.
    #[must_use]
    pub fn with_parallel_pull_count(mut self, count: u32) -> Self {
        self.parallel_pull_count = count;
        self
    }

    /// Sets the per-pull message limit.
    #[must_use]
    pub fn with_max_messages_per_pull(mut self, count: u32) -> Self {
        self.max_messages_per_pull = count;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the endpoint override.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the lease extension interval.
    #[must_use]
    pub fn with_lease_extension_interval(mut self, interval: Duration) -> Self {
        self.lease_extension_interval = interval;
        self
    }

    /// Sets the acknowledgment retry policy.
    #[must_use]
    pub fn with_ack_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.ack_retry_attempts = attempts;
        self.ack_retry_backoff = backoff;
        self
    }

    /// The split covering this config's subscription.
    #[must_use]
    pub fn split(&self) -> SubscriptionSplit {
        SubscriptionSplit::new(&self.project_name, &self.subscription_name)
    }

    /// Validates the config.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::ConfigurationError` describing the first
    /// invalid field.
    pub fn validate(&self) -> Result<(), PubSubError> {
        if self.project_name.trim().is_empty() {
            return Err(PubSubError::ConfigurationError(
                "project name must not be empty".into(),
            ));
        }
        if self.subscription_name.trim().is_empty() {
            return Err(PubSubError::ConfigurationError(
                "subscription name must not be empty".into(),
            ));
        }
        if self.parallel_pull_count == 0 {
            return Err(PubSubError::ConfigurationError(
                "parallel pull count must be at least 1".into(),
            ));
        }
        if self.max_messages_per_pull == 0 {
            return Err(PubSubError::ConfigurationError(
                "max messages per pull must be at least 1".into(),
            ));
        }
        if !(MIN_ACK_DEADLINE..=MAX_ACK_DEADLINE).contains(&self.ack_deadline) {
            return Err(PubSubError::ConfigurationError(format!(
                "ack deadline {:?} outside {MIN_ACK_DEADLINE:?}..={MAX_ACK_DEADLINE:?}",
                self.ack_deadline
            )));
        }
        if self.lease_extension_interval.is_zero()
            || self.lease_extension_interval >= self.ack_deadline
        {
            return Err(PubSubError::ConfigurationError(
                "lease extension interval must be non-zero and shorter than the ack deadline"
                    .into(),
            ));
        }
        if self.max_lease_duration < self.ack_deadline {
            return Err(PubSubError::ConfigurationError(format!(
                "max lease duration {:?} must not be shorter than the ack deadline {:?}",
                self.max_lease_duration, self.ack_deadline
            )));
        }
        if self.ack_retry_attempts == 0 {
            return Err(PubSubError::ConfigurationError(
                "ack retry attempts must be at least 1".into(),
            ));
        }
        if let Some(endpoint) = &self.endpoint {
            if endpoint.trim().is_empty() {
                return Err(PubSubError::ConfigurationError(
                    "endpoint override must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Builds a validated config from a [`ConnectorConfig`] property map.
    ///
    /// Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::MissingConfig` for an absent required key and
    /// `PubSubError::ConfigurationError` for unparseable, negative, or
    /// otherwise invalid values.
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, PubSubError> {
        let project = config.require("project")?;
        let subscription = config.require("subscription")?;
        let mut cfg = Self::new(project, subscription);

        if let Some(v) = non_negative(config, "max.outstanding.messages.count")? {
            cfg.max_outstanding_messages_count = v;
        }
        if let Some(v) = non_negative(config, "max.outstanding.messages.bytes")? {
            cfg.max_outstanding_messages_bytes = v;
        }
        if let Some(v) = non_negative(config, "parallel.pull.count")? {
            cfg.parallel_pull_count = u32::try_from(v).map_err(|_| {
                PubSubError::ConfigurationError("parallel.pull.count is too large".into())
            })?;
        }
        if let Some(v) = config.get_parsed::<u32>("max.messages.per.pull")? {
            cfg.max_messages_per_pull = v;
        }
        if let Some(ms) = config.get_parsed::<u64>("ack.deadline.ms")? {
            cfg.ack_deadline = Duration::from_millis(ms);
        }
        if let Some(ms) = config.get_parsed::<u64>("lease.extension.interval.ms")? {
            cfg.lease_extension_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = config.get_parsed::<u64>("max.lease.duration.ms")? {
            cfg.max_lease_duration = Duration::from_millis(ms);
        }
        if let Some(v) = config.get_parsed::<u32>("ack.retry.attempts")? {
            cfg.ack_retry_attempts = v;
        }
        if let Some(ms) = config.get_parsed::<u64>("ack.retry.backoff.ms")? {
            cfg.ack_retry_backoff = Duration::from_millis(ms);
        }
        cfg.endpoint = config.get("endpoint").map(ToString::to_string);
        cfg.credentials = parse_credentials(config)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Keys recognised by [`from_config`](Self::from_config).
    #[must_use]
    pub fn config_keys() -> Vec<ConfigKeySpec> {
        vec![
            ConfigKeySpec::required("project", "Project that owns the subscription"),
            ConfigKeySpec::required("subscription", "Subscription to pull from"),
            ConfigKeySpec::optional(
                "max.outstanding.messages.count",
                "Max unacknowledged messages before pulling pauses (0 = unbounded)",
                "1000",
            ),
            ConfigKeySpec::optional(
                "max.outstanding.messages.bytes",
                "Max unacknowledged bytes before pulling pauses (0 = unbounded)",
                "104857600",
            ),
            ConfigKeySpec::optional("parallel.pull.count", "Concurrent pull requests", "1"),
            ConfigKeySpec::optional("max.messages.per.pull", "Messages per pull request", "1000"),
            ConfigKeySpec::optional("ack.deadline.ms", "Ack deadline used for lease extension", "10000"),
            ConfigKeySpec::optional(
                "lease.extension.interval.ms",
                "Interval between lease extensions",
                "5000",
            ),
            ConfigKeySpec::optional(
                "max.lease.duration.ms",
                "Stop extending leases older than this",
                "3600000",
            ),
            ConfigKeySpec::optional("ack.retry.attempts", "Attempts per acknowledgment batch", "3"),
            ConfigKeySpec::optional("ack.retry.backoff.ms", "Initial acknowledgment retry backoff", "100"),
            ConfigKeySpec::optional("endpoint", "Service endpoint override", ""),
            ConfigKeySpec::optional(
                "credentials.type",
                "Credentials (application_default/service_account_file/access_token)",
                "application_default",
            ),
            ConfigKeySpec::optional("credentials.path", "Service account key file", ""),
            ConfigKeySpec::optional("credentials.token", "OAuth access token", ""),
        ]
    }
}

/// Parses an integer that must not be negative.
fn non_negative(config: &ConnectorConfig, key: &str) -> Result<Option<u64>, PubSubError> {
    match config.get_parsed::<i64>(key)? {
        Some(v) if v < 0 => Err(PubSubError::ConfigurationError(format!(
            "'{key}' must be non-negative, got {v}"
        ))),
        Some(v) => Ok(Some(v.unsigned_abs())),
        None => Ok(None),
    }
}

fn parse_credentials(config: &ConnectorConfig) -> Result<Credentials, PubSubError> {
    match config.get("credentials.type").map(str::to_lowercase) {
        None => Ok(Credentials::ApplicationDefault),
        Some(ref s) if s == "application_default" => Ok(Credentials::ApplicationDefault),
        Some(ref s) if s == "service_account_file" => Ok(Credentials::ServiceAccountFile {
            path: config.require("credentials.path")?.to_string(),
        }),
        Some(ref s) if s == "access_token" => Ok(Credentials::AccessToken {
            token: config.require("credentials.token")?.to_string(),
        }),
        Some(other) => Err(PubSubError::ConfigurationError(format!(
            "unsupported credentials type '{other}'"
        ))),
    }
}
