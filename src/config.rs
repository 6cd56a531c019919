//! # Outbox Configuration
//!
//! Layered configuration for the dispatcher: built-in defaults, then an optional
//! file (TOML, YAML or JSON, picked by extension), then `OUTBOX__*` environment
//! variables.
//!
//! ```text
//! OUTBOX__BATCH_SIZE=25
//! OUTBOX__MAX_RETRY_ATTEMPTS=8
//! OUTBOX__COLLECTION_NAME_PREFIX=billing_
//! ```
//!
//! Keys are accepted in snake_case or camelCase. The `config` crate lowercases
//! keys, so each camelCase alias is also listed in its lowercased form.

use crate::error::{OutboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "OUTBOX";

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Seconds between processing cycles
    #[serde(alias = "pollIntervalSeconds", alias = "pollintervalseconds")]
    pub poll_interval_seconds: u64,
    /// Extra pause after each cycle to throttle store load
    #[serde(alias = "interCycleDelayMs", alias = "intercycledelayms")]
    pub inter_cycle_delay_ms: u64,
    /// Attempts before an envelope is abandoned
    #[serde(alias = "maxRetryAttempts", alias = "maxretryattempts")]
    pub max_retry_attempts: u32,
    /// First retry delay; doubles with each further attempt
    #[serde(alias = "baseRetryDelaySeconds", alias = "baseretrydelayseconds")]
    pub base_retry_delay_seconds: u64,
    /// Upper bound for the retry delay
    #[serde(alias = "maxRetryDelaySeconds", alias = "maxretrydelayseconds")]
    pub max_retry_delay_seconds: u64,
    /// Envelopes claimed and dispatched per cycle
    #[serde(alias = "batchSize", alias = "batchsize")]
    pub batch_size: usize,
    /// Start the processing loop as soon as the outbox is built
    #[serde(alias = "autoStart", alias = "autostart")]
    pub auto_start: bool,
    /// Age after which an in-flight envelope is considered stuck
    #[serde(alias = "processingTtlMinutes", alias = "processingttlminutes")]
    pub processing_ttl_minutes: u64,
    /// Validity of a claim
    #[serde(alias = "claimLeaseMinutes", alias = "claimleaseminutes")]
    pub claim_lease_minutes: u64,
    /// Prepended to the collection name so several outboxes can share a store
    #[serde(alias = "collectionNamePrefix", alias = "collectionnameprefix")]
    pub collection_name_prefix: String,
    /// How long shutdown waits for an in-progress dispatch
    #[serde(alias = "shutdownGracePeriodSeconds", alias = "shutdowngraceperiodseconds")]
    pub shutdown_grace_period_seconds: u64,
    /// Per-invocation handler time limit; unset means no limit
    #[serde(alias = "handlerTimeoutSeconds", alias = "handlertimeoutseconds")]
    pub handler_timeout_seconds: Option<u64>,
    /// Worker identity recorded as claim owner; generated when unset
    #[serde(alias = "workerId", alias = "workerid")]
    pub worker_id: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            inter_cycle_delay_ms: 0,
            max_retry_attempts: 5,
            base_retry_delay_seconds: 2,
            max_retry_delay_seconds: 3600,
            batch_size: 10,
            auto_start: true,
            processing_ttl_minutes: 5,
            claim_lease_minutes: 2,
            collection_name_prefix: String::new(),
            shutdown_grace_period_seconds: 30,
            handler_timeout_seconds: None,
            worker_id: None,
        }
    }
}

impl OutboxConfig {
    /// Load defaults overridden by `OUTBOX__*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load defaults, then `path` (when given), then `OUTBOX__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    /// Same as [`OutboxConfig::load`] with a custom environment prefix
    pub fn load_with_env_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading outbox configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: OutboxConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(OutboxError::configuration("outbox", message));

        if self.poll_interval_seconds == 0 {
            return invalid("poll_interval_seconds must be greater than zero");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero");
        }
        if self.max_retry_attempts == 0 {
            return invalid("max_retry_attempts must be greater than zero");
        }
        if self.processing_ttl_minutes == 0 {
            return invalid("processing_ttl_minutes must be greater than zero");
        }
        if self.claim_lease_minutes == 0 {
            return invalid("claim_lease_minutes must be greater than zero");
        }
        if self.max_retry_delay_seconds < self.base_retry_delay_seconds {
            return invalid("max_retry_delay_seconds must not be below base_retry_delay_seconds");
        }
        if self.handler_timeout_seconds == Some(0) {
            return invalid("handler_timeout_seconds must be greater than zero when set");
        }
        if !self
            .collection_name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return invalid("collection_name_prefix may only contain ASCII letters, digits and '_'");
        }
        if self
            .worker_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return invalid("worker_id must not be blank when set");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn inter_cycle_delay(&self) -> Duration {
        Duration::from_millis(self.inter_cycle_delay_ms)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.base_retry_delay_seconds)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_seconds)
    }

    pub fn processing_ttl(&self) -> Duration {
        Duration::from_secs(self.processing_ttl_minutes.saturating_mul(60))
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_minutes.saturating_mul(60))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_seconds)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_seconds.map(Duration::from_secs)
    }

    /// Configured worker id, or a fresh `outbox-worker-{pid}-{uuid}`
    pub fn resolve_worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            format!(
                "outbox-worker-{}-{}",
                std::process::id(),
                uuid::Uuid::new_v4()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OutboxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.claim_lease(), Duration::from_secs(120));
        assert_eq!(config.processing_ttl(), Duration::from_secs(300));
        assert!(config.handler_timeout().is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = OutboxConfig {
            batch_size: 0,
            ..OutboxConfig::default()
        };
        assert!(config.validate().is_err());

        config.batch_size = 1;
        config.collection_name_prefix = "billing; DROP TABLE".to_string();
        assert!(config.validate().is_err());

        config.collection_name_prefix = "billing_".to_string();
        config.base_retry_delay_seconds = 10;
        config.max_retry_delay_seconds = 5;
        assert!(config.validate().is_err());

        config.max_retry_delay_seconds = 10;
        config.worker_id = Some("   ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
batch_size = 25
max_retry_attempts = 8
collection_name_prefix = "billing_"
handler_timeout_seconds = 15
"#
        )
        .unwrap();

        let config =
            OutboxConfig::load_with_env_prefix(Some(file.path()), "OUTBOX_TEST_TOML").unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_retry_attempts, 8);
        assert_eq!(config.collection_name_prefix, "billing_");
        assert_eq!(config.handler_timeout(), Some(Duration::from_secs(15)));
        // untouched values keep their defaults
        assert_eq!(config.poll_interval_seconds, 5);
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "poll_interval_seconds = 0").unwrap();

        let err = OutboxConfig::load_with_env_prefix(Some(file.path()), "OUTBOX_TEST_INVALID")
            .unwrap_err();
        assert!(matches!(err, OutboxError::Configuration { .. }));
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("OUTBOX_TEST_ENV__BATCH_SIZE", "3");
        std::env::set_var("OUTBOX_TEST_ENV__AUTO_START", "false");
        let config = OutboxConfig::load_with_env_prefix(None, "OUTBOX_TEST_ENV").unwrap();
        std::env::remove_var("OUTBOX_TEST_ENV__BATCH_SIZE");
        std::env::remove_var("OUTBOX_TEST_ENV__AUTO_START");

        assert_eq!(config.batch_size, 3);
        assert!(!config.auto_start);
    }

    #[test]
    fn test_camel_case_keys_are_accepted() {
        let config: OutboxConfig = serde_json::from_str(
            r#"{"batchSize": 4, "claimLeaseMinutes": 7, "collectionNamePrefix": "ops_"}"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.claim_lease_minutes, 7);
        assert_eq!(config.collection_name_prefix, "ops_");
        assert!(config.auto_start);
    }

    #[test]
    fn test_load_camel_case_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
batchSize = 25
maxRetryAttempts = 8
pollIntervalSeconds = 3
collectionNamePrefix = "ops_"
autoStart = false
"#
        )
        .unwrap();

        let config =
            OutboxConfig::load_with_env_prefix(Some(file.path()), "OUTBOX_TEST_CAMEL").unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_retry_attempts, 8);
        assert_eq!(config.poll_interval_seconds, 3);
        assert_eq!(config.collection_name_prefix, "ops_");
        assert!(!config.auto_start);
    }

    #[test]
    fn test_huge_minute_values_saturate() {
        let config = OutboxConfig {
            processing_ttl_minutes: u64::MAX / 10,
            claim_lease_minutes: u64::MAX,
            ..OutboxConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.processing_ttl(), Duration::from_secs(u64::MAX));
        assert_eq!(config.claim_lease(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_generated_worker_ids_are_unique() {
        let config = OutboxConfig::default();
        let a = config.resolve_worker_id();
        let b = config.resolve_worker_id();
        assert!(a.starts_with("outbox-worker-"));
        assert_ne!(a, b);

        let named = OutboxConfig {
            worker_id: Some("billing-1".to_string()),
            ..OutboxConfig::default()
        };
        assert_eq!(named.resolve_worker_id(), "billing-1");
    }
}
