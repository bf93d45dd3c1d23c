//! Relay configuration and defaults.
//!
//! Every section deserializes with defaults, so a config file only needs the
//! fields it overrides.

use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_NAMESPACE: &str = "local";
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_MESSAGE_RETENTION: Duration = Duration::from_secs(600);
pub const DEFAULT_SUBSCRIPTION_TTL: Duration = Duration::from_secs(86_400);
pub const DEFAULT_MAX_OUTSTANDING_MESSAGES: usize = 25;
pub const DEFAULT_MAX_OUTSTANDING_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_LEASE: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DELIVERY_RETRIES: u32 = 2;
pub const DEFAULT_STREAM_WAIT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_STREAM_FAILURES: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REPLY_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_CONNECTOR_WORKERS: usize = 4;

/// Fixed settings applied when a subscription is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    pub exactly_once_delivery: bool,
    pub message_ordering: bool,
    #[serde(rename = "ack_deadline_secs", with = "secs")]
    pub ack_deadline: Duration,
    #[serde(rename = "message_retention_secs", with = "secs")]
    pub message_retention: Duration,
    #[serde(rename = "expiration_ttl_secs", with = "secs")]
    pub expiration_ttl: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            exactly_once_delivery: true,
            message_ordering: true,
            ack_deadline: DEFAULT_ACK_DEADLINE,
            message_retention: DEFAULT_MESSAGE_RETENTION,
            expiration_ttl: DEFAULT_SUBSCRIPTION_TTL,
        }
    }
}

/// Bounds on what a single pull stream may hold un-acked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControl {
    pub max_messages: usize,
    pub max_bytes: usize,
    #[serde(rename = "max_lease_secs", with = "secs")]
    pub max_lease: Duration,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_OUTSTANDING_MESSAGES,
            max_bytes: DEFAULT_MAX_OUTSTANDING_BYTES,
            max_lease: DEFAULT_MAX_LEASE,
        }
    }
}

/// Stream supervision limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Bounded wait on the stream before checking for shutdown again.
    #[serde(rename = "stream_wait_ms", with = "millis")]
    pub stream_wait: Duration,
    /// Consecutive failures after which the stream is stopped for good.
    pub max_failures: u32,
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stream_wait: DEFAULT_STREAM_WAIT,
            max_failures: DEFAULT_MAX_STREAM_FAILURES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// How inbound replies are paired with pending requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMatching {
    /// Only a reply carrying the request's correlation id resolves it.
    #[default]
    CorrelationId,
    /// Replies without a known id go to the oldest waiting request.
    NextAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    #[serde(rename = "default_timeout_ms", with = "millis")]
    pub default_timeout: Duration,
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    pub workers: usize,
    pub matching: ReplyMatching,
    /// Unmatched replies kept for inspection before the oldest is dropped.
    pub inbox_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_REPLY_POLL_INTERVAL,
            workers: DEFAULT_CONNECTOR_WORKERS,
            matching: ReplyMatching::default(),
            inbox_capacity: 256,
        }
    }
}

/// Top-level configuration for a `TransportContext` and everything built on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Project / namespace that owns every topic and subscription.
    pub namespace: String,
    /// Environment suffix appended to routed topic names (`dev`, `prod`, ...).
    pub topic_suffix: Option<String>,
    pub subscription: SubscriptionSettings,
    pub flow_control: FlowControl,
    /// Deliveries at or above this retry count are dropped unprocessed.
    pub max_delivery_retries: u32,
    pub supervisor: SupervisorConfig,
    pub correlator: CorrelatorConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            topic_suffix: None,
            subscription: SubscriptionSettings::default(),
            flow_control: FlowControl::default(),
            max_delivery_retries: DEFAULT_MAX_DELIVERY_RETRIES,
            supervisor: SupervisorConfig::default(),
            correlator: CorrelatorConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_topic_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.topic_suffix = Some(suffix.into());
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_correlator(mut self, correlator: CorrelatorConfig) -> Self {
        self.correlator = correlator;
        self
    }

    /// Build a config from `RELAY_NAMESPACE`, `RELAY_TOPIC_SUFFIX` and an
    /// optional JSON file named by `RELAY_CONFIG`.
    ///
    /// The file is applied first; the two variables override it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("RELAY_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        if let Ok(namespace) = std::env::var("RELAY_NAMESPACE") {
            if namespace.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "RELAY_NAMESPACE".into(),
                    value: namespace,
                });
            }
            config.namespace = namespace;
        }
        if let Ok(suffix) = std::env::var("RELAY_TOPIC_SUFFIX") {
            config.topic_suffix = Some(suffix).filter(|s| !s.is_empty());
        }
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply the environment suffix to a base topic name.
    pub fn topic_name(&self, base: &str) -> String {
        match self.topic_suffix.as_deref() {
            Some(suffix) if !suffix.is_empty() => format!("{base}_{suffix}"),
            _ => base.to_string(),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
