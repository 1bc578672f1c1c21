//! Environment variable overrides.
//!
//! Environment variables are read, never written: mutating them at runtime
//! is not thread-safe.

use std::str::FromStr;

use rust_decimal::Decimal;
use secrecy::SecretString;

use super::{ConfigError, ConfigResult, DegradedPolicy, GovernanceConfig};

pub const ENV_PREFIX: &str = "PATHGATE_";

/// Overlays `PATHGATE_*` variables onto a loaded [`GovernanceConfig`].
///
/// `PATHGATE_QUOTA_PATH_GENERATION_LIMIT=20` sets `quota.path_generation_limit`.
/// Connection URLs come from `PATHGATE_POSTGRES_URL` and `PATHGATE_REDIS_URL`.
#[derive(Debug, Clone)]
pub struct EnvOverrides {
    prefix: String,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::prefixed(ENV_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `quota.path_generation_limit` -> `PATHGATE_QUOTA_PATH_GENERATION_LIMIT`
    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }

    fn get(&self, key: &str) -> ConfigResult<Option<String>> {
        match std::env::var(self.env_key(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn parse<T>(&self, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)?
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn apply(&self, mut config: GovernanceConfig) -> ConfigResult<GovernanceConfig> {
        if let Some(v) = self.parse("quota.path_generation_limit")? {
            config.quota.path_generation_limit = v;
        }
        if let Some(v) = self.parse("quota.open_answer_grading_limit")? {
            config.quota.open_answer_grading_limit = v;
        }
        if let Some(v) = self.get("quota.degraded_policy")? {
            config.quota.degraded_policy = match v.trim() {
                "durable_fallback" => DegradedPolicy::DurableFallback,
                "deny_all" => DegradedPolicy::DenyAll,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "quota.degraded_policy".into(),
                        message: format!("unknown policy '{}'", other),
                    });
                }
            };
        }
        if let Some(v) = self.parse("paths.ttl_secs")? {
            config.paths.ttl_secs = v;
        }
        if let Some(v) = self.parse("paths.generation_wait_ms")? {
            config.paths.generation_wait_ms = v;
        }
        if let Some(v) = self.parse("paths.min_history_items")? {
            config.paths.min_history_items = v;
        }
        if let Some(v) = self.parse("upstream.timeout_secs")? {
            config.upstream.timeout_secs = v;
        }
        if let Some(v) = self.parse("upstream.max_retries")? {
            config.upstream.max_retries = v;
        }
        if let Some(v) = self.parse::<Decimal>("cost.student_monthly_alert_usd")? {
            config.cost.student_monthly_alert_usd = Some(v);
        }
        if let Some(v) = self.parse::<Decimal>("cost.total_alert_usd")? {
            config.cost.total_alert_usd = Some(v);
        }
        if let Some(v) = self.parse("reconcile.interval_secs")? {
            config.reconcile.interval_secs = v;
        }
        if let Some(v) = self.get("postgres.url")? {
            config.backends.postgres_url = Some(SecretString::from(v));
        }
        if let Some(v) = self.get("redis.url")? {
            config.backends.redis_url = Some(SecretString::from(v));
        }
        Ok(config)
    }
}

impl Default for EnvOverrides {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use secrecy::ExposeSecret;

    #[test]
    fn test_env_key_conversion() {
        let overrides = EnvOverrides::new();
        assert_eq!(
            overrides.env_key("quota.path_generation_limit"),
            "PATHGATE_QUOTA_PATH_GENERATION_LIMIT"
        );
        assert_eq!(overrides.env_key("redis.url"), "PATHGATE_REDIS_URL");
    }

    #[test]
    fn test_apply_overrides() {
        // Unique prefix so parallel tests never observe these variables.
        let overrides = EnvOverrides::prefixed("PATHGATE_TEST_APPLY_");

        // SAFETY: Test-only environment setup with a prefix no other test reads
        unsafe {
            std::env::set_var("PATHGATE_TEST_APPLY_QUOTA_PATH_GENERATION_LIMIT", "25");
            std::env::set_var("PATHGATE_TEST_APPLY_QUOTA_DEGRADED_POLICY", "deny_all");
            std::env::set_var("PATHGATE_TEST_APPLY_COST_TOTAL_ALERT_USD", "100.50");
            std::env::set_var("PATHGATE_TEST_APPLY_REDIS_URL", "redis://localhost:6379");
        }

        let config = overrides.apply(GovernanceConfig::default()).unwrap();
        assert_eq!(config.quota.path_generation_limit, 25);
        assert_eq!(config.quota.degraded_policy, DegradedPolicy::DenyAll);
        assert_eq!(config.cost.total_alert_usd, Some(dec!(100.50)));
        assert_eq!(
            config.backends.redis_url.as_ref().unwrap().expose_secret(),
            "redis://localhost:6379"
        );
        assert_eq!(config.quota.open_answer_grading_limit, 50);
    }

    #[test]
    fn test_invalid_number_reports_key() {
        let overrides = EnvOverrides::prefixed("PATHGATE_TEST_INVALID_");

        // SAFETY: Test-only environment setup with a prefix no other test reads
        unsafe {
            std::env::set_var("PATHGATE_TEST_INVALID_PATHS_TTL_SECS", "a day");
        }

        let err = overrides.apply(GovernanceConfig::default()).unwrap_err();
        assert!(err.to_string().contains("paths.ttl_secs"));
    }
}
