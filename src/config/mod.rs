//! Governance configuration.
//!
//! ```rust,no_run
//! use pathgate::config::GovernanceConfig;
//!
//! # async fn example() -> Result<(), pathgate::config::ConfigError> {
//! let config = GovernanceConfig::from_file("pathgate.json")
//!     .await?
//!     .with_env_overrides()?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

pub mod env;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Feature;
use crate::resilience::ExponentialBackoff;

pub use env::{ENV_PREFIX, EnvOverrides};

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The key with invalid value
        key: String,
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiple validation errors
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// What admission does when the volatile counter backend is unreachable.
/// Both policies are fail-closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Admit through a conditional increment in the durable store; deny if
    /// that store is unreachable too.
    #[default]
    DurableFallback,
    /// Deny every quota-gated request until the counter backend recovers.
    DenyAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub path_generation_limit: u32,
    pub open_answer_grading_limit: u32,
    pub degraded_policy: DegradedPolicy,
    /// Days a month's volatile counter outlives the month itself.
    pub counter_retention_days: u32,
}

impl QuotaConfig {
    pub fn limit_for(&self, feature: Feature) -> u32 {
        match feature {
            Feature::PathGeneration => self.path_generation_limit,
            Feature::OpenAnswerGrading => self.open_answer_grading_limit,
        }
    }

    pub fn with_limit(mut self, feature: Feature, limit: u32) -> Self {
        match feature {
            Feature::PathGeneration => self.path_generation_limit = limit,
            Feature::OpenAnswerGrading => self.open_answer_grading_limit = limit,
        }
        self
    }

    pub fn counter_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.counter_retention_days))
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            path_generation_limit: 10,
            open_answer_grading_limit: 50,
            degraded_policy: DegradedPolicy::default(),
            counter_retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub ttl_secs: u64,
    /// Bounded wait for the per-student generation lock.
    pub generation_wait_ms: u64,
    /// Results below this confidence are returned but not cached.
    pub min_confidence: Option<f32>,
    /// Completed items a student needs before a path can be generated.
    pub min_history_items: u32,
}

impl PathConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn generation_wait(&self) -> Duration {
        Duration::from_millis(self.generation_wait_ms)
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 3600,
            generation_wait_ms: 5_000,
            min_confidence: None,
            min_history_items: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            2.0,
        )
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 2,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub student_monthly_alert_usd: Option<Decimal>,
    pub feature_alert_usd: BTreeMap<Feature, Decimal>,
    pub total_alert_usd: Option<Decimal>,
    pub top_n: usize,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            student_monthly_alert_usd: Some(dec!(5)),
            feature_alert_usd: BTreeMap::new(),
            total_alert_usd: None,
            top_n: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

/// Backend locations. Connection URLs are only read from the environment
/// and never serialized.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    #[serde(skip)]
    pub postgres_url: Option<SecretString>,
    #[serde(skip)]
    pub redis_url: Option<SecretString>,
    pub key_prefix: String,
    pub table_prefix: String,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("postgres_url", &self.postgres_url.as_ref().map(|_| "[REDACTED]"))
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("key_prefix", &self.key_prefix)
            .field("table_prefix", &self.table_prefix)
            .finish()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            postgres_url: None,
            redis_url: None,
            key_prefix: "pathgate:".to_string(),
            table_prefix: "pathgate_".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub quota: QuotaConfig,
    pub paths: PathConfig,
    pub upstream: UpstreamConfig,
    pub cost: CostConfig,
    pub reconcile: ReconcileConfig,
    pub backends: BackendConfig,
}

impl GovernanceConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub async fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Overlay `PATHGATE_*` environment variables.
    pub fn with_env_overrides(self) -> ConfigResult<Self> {
        EnvOverrides::new().apply(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |key: &str, message: &str| {
            errors.push(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        };

        if self.paths.ttl_secs == 0 {
            invalid("paths.ttl_secs", "cache entries must outlive their creation");
        }
        if self.paths.generation_wait_ms == 0 {
            invalid("paths.generation_wait_ms", "must be greater than zero");
        }
        if let Some(confidence) = self.paths.min_confidence
            && !(0.0..=1.0).contains(&confidence)
        {
            invalid("paths.min_confidence", "must be within 0.0..=1.0");
        }
        if self.upstream.timeout_secs == 0 {
            invalid("upstream.timeout_secs", "must be greater than zero");
        }
        if self.upstream.initial_backoff_ms > self.upstream.max_backoff_ms {
            invalid(
                "upstream.initial_backoff_ms",
                "must not exceed upstream.max_backoff_ms",
            );
        }
        if self.reconcile.interval_secs == 0 {
            invalid("reconcile.interval_secs", "must be greater than zero");
        }
        if self.cost.top_n == 0 {
            invalid("cost.top_n", "must be greater than zero");
        }
        let negative_threshold = self
            .cost
            .student_monthly_alert_usd
            .iter()
            .chain(self.cost.total_alert_usd.iter())
            .chain(self.cost.feature_alert_usd.values())
            .any(|t| t.is_sign_negative());
        if negative_threshold {
            invalid("cost", "alert thresholds must not be negative");
        }
        if !self
            .backends
            .key_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            invalid(
                "backends.key_prefix",
                "only ASCII alphanumeric, underscore, and colon allowed",
            );
        }
        if !self
            .backends
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            invalid(
                "backends.table_prefix",
                "only ASCII alphanumeric and underscore allowed",
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GovernanceConfig::default();
        assert_eq!(config.quota.limit_for(Feature::PathGeneration), 10);
        assert_eq!(config.quota.limit_for(Feature::OpenAnswerGrading), 50);
        assert_eq!(config.paths.ttl(), chrono::Duration::hours(24));
        assert_eq!(config.quota.degraded_policy, DegradedPolicy::DurableFallback);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "quota": {{ "path_generation_limit": 3, "degraded_policy": "deny_all" }},
                "cost": {{ "feature_alert_usd": {{ "open_answer_grading": "12.5" }} }}
            }}"#
        )
        .unwrap();

        let config = GovernanceConfig::from_file(file.path()).await.unwrap();
        assert_eq!(config.quota.path_generation_limit, 3);
        assert_eq!(config.quota.open_answer_grading_limit, 50);
        assert_eq!(config.quota.degraded_policy, DegradedPolicy::DenyAll);
        assert_eq!(
            config.cost.feature_alert_usd.get(&Feature::OpenAnswerGrading),
            Some(&dec!(12.5))
        );
        assert_eq!(config.paths.ttl_secs, 86400);
    }

    #[tokio::test]
    async fn test_from_missing_file() {
        let err = GovernanceConfig::from_file("/nonexistent/pathgate.json")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = GovernanceConfig::default();
        config.paths.ttl_secs = 0;
        config.paths.min_confidence = Some(1.5);
        config.backends.key_prefix = "bad prefix".into();

        let err = config.validate().unwrap_err();
        match err {
            ConfigError::ValidationErrors(ValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_backend_debug_redacts_urls() {
        let mut config = BackendConfig::default();
        config.redis_url = Some(SecretString::from("redis://:hunter2@localhost".to_string()));
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }
}
