//! Redis counter backend.
//!
//! Enable with the `redis-backend` feature flag. Each primitive is a Lua
//! script, so the conditional logic runs as one atomic server-side step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CounterBackend, CounterError, CounterOutcome, CounterResult};
use crate::domain::QuotaKey;
use crate::resilience::{ExponentialBackoff, with_retry};

const CHECK_AND_INCREMENT: &str = r#"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
if used < limit then
    used = redis.call('INCR', KEYS[1])
    redis.call('EXPIREAT', KEYS[1], ARGV[2])
    return {1, used}
end
return {0, used}
"#;

const RELEASE: &str = r#"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
if used > 0 then
    return redis.call('DECR', KEYS[1])
end
return 0
"#;

const RAISE_TO: &str = r#"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
local floor = tonumber(ARGV[1])
if floor > used then
    redis.call('SET', KEYS[1], floor)
    used = floor
end
redis.call('EXPIREAT', KEYS[1], ARGV[2])
return used
"#;

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub key_prefix: String,
    pub connection_timeout: Duration,
    pub response_timeout: Duration,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: "pathgate:".to_string(),
            connection_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_millis(500),
            max_retries: 2,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(50),
                Duration::from_millis(500),
                2.0,
            ),
        }
    }
}

impl RedisConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> CounterResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(CounterError::Protocol {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

pub struct RedisCounter {
    client: Arc<redis::Client>,
    config: RedisConfig,
    check_and_increment: redis::Script,
    release: redis::Script,
    raise_to: redis::Script,
}

impl RedisCounter {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
            check_and_increment: redis::Script::new(CHECK_AND_INCREMENT),
            release: redis::Script::new(RELEASE),
            raise_to: redis::Script::new(RAISE_TO),
        })
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> CounterResult<Self> {
        self.config = self.config.prefix(prefix)?;
        Ok(self)
    }

    /// Feature and month never contain ':', so the free-form student id is
    /// recovered by splitting from the right.
    fn counter_key(&self, key: &QuotaKey) -> String {
        format!(
            "{}quota:{}:{}:{}",
            self.config.key_prefix, key.student_id, key.feature, key.month
        )
    }

    async fn get_connection(&self) -> CounterResult<redis::aio::MultiplexedConnection> {
        with_retry(
            self.config.max_retries,
            &self.config.backoff,
            CounterError::is_retryable,
            || async {
                tokio::time::timeout(
                    self.config.connection_timeout,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                .map_err(|_| CounterError::Timeout(self.config.connection_timeout))?
                .map_err(unavailable)
            },
        )
        .await
        .map(|r| r.value)
        .map_err(|r| r.value)
    }

    async fn invoke<T: redis::FromRedisValue>(
        &self,
        invocation: redis::ScriptInvocation<'_>,
    ) -> CounterResult<T> {
        let mut conn = self.get_connection().await?;
        tokio::time::timeout(
            self.config.response_timeout,
            invocation.invoke_async(&mut conn),
        )
        .await
        .map_err(|_| CounterError::Timeout(self.config.response_timeout))?
        .map_err(unavailable)
    }
}

fn unavailable(e: redis::RedisError) -> CounterError {
    CounterError::Unavailable {
        message: e.to_string(),
    }
}

#[async_trait]
impl CounterBackend for RedisCounter {
    fn name(&self) -> &str {
        "redis"
    }

    async fn check_and_increment(
        &self,
        key: &QuotaKey,
        limit: u32,
        expire_at: DateTime<Utc>,
    ) -> CounterResult<CounterOutcome> {
        let mut invocation = self.check_and_increment.prepare_invoke();
        invocation
            .key(self.counter_key(key))
            .arg(limit)
            .arg(expire_at.timestamp());
        let (allowed, used): (i64, i64) = self.invoke(invocation).await?;
        Ok(CounterOutcome {
            allowed: allowed == 1,
            used: to_count(used)?,
        })
    }

    async fn release(&self, key: &QuotaKey) -> CounterResult<u32> {
        let mut invocation = self.release.prepare_invoke();
        invocation.key(self.counter_key(key));
        let used: i64 = self.invoke(invocation).await?;
        to_count(used)
    }

    async fn current(&self, key: &QuotaKey) -> CounterResult<u32> {
        let mut conn = self.get_connection().await?;
        let used: Option<i64> = tokio::time::timeout(
            self.config.response_timeout,
            redis::cmd("GET")
                .arg(self.counter_key(key))
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| CounterError::Timeout(self.config.response_timeout))?
        .map_err(unavailable)?;
        to_count(used.unwrap_or(0))
    }

    async fn raise_to(
        &self,
        key: &QuotaKey,
        floor: u32,
        expire_at: DateTime<Utc>,
    ) -> CounterResult<u32> {
        let mut invocation = self.raise_to.prepare_invoke();
        invocation
            .key(self.counter_key(key))
            .arg(floor)
            .arg(expire_at.timestamp());
        let used: i64 = self.invoke(invocation).await?;
        to_count(used)
    }
}

fn to_count(raw: i64) -> CounterResult<u32> {
    u32::try_from(raw).map_err(|_| CounterError::Protocol {
        message: format!("counter value {} out of range", raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Feature, MonthKey, StudentId};

    #[test]
    fn test_counter_key_layout() {
        let counter = RedisCounter::new("redis://127.0.0.1:6379")
            .unwrap()
            .prefix("lms:")
            .unwrap();
        let key = QuotaKey::new(
            StudentId::new("s1"),
            Feature::OpenAnswerGrading,
            MonthKey::new(2026, 10).unwrap(),
        );
        assert_eq!(
            counter.counter_key(&key),
            "lms:quota:s1:open_answer_grading:2026-10"
        );
    }

    #[test]
    fn test_colon_in_student_id_keeps_keys_distinct() {
        let counter = RedisCounter::new("redis://127.0.0.1:6379").unwrap();
        let october = MonthKey::new(2026, 10).unwrap();
        let keys = [
            QuotaKey::new(StudentId::new("a"), Feature::PathGeneration, october),
            QuotaKey::new(
                StudentId::new("a:path_generation"),
                Feature::PathGeneration,
                october,
            ),
            QuotaKey::new(
                StudentId::new("a:open_answer_grading:2026-10"),
                Feature::PathGeneration,
                october,
            ),
            QuotaKey::new(StudentId::new("a"), Feature::OpenAnswerGrading, october),
            QuotaKey::new(
                StudentId::new("a"),
                Feature::PathGeneration,
                MonthKey::new(2026, 11).unwrap(),
            ),
        ];
        let rendered: std::collections::HashSet<String> =
            keys.iter().map(|k| counter.counter_key(k)).collect();
        assert_eq!(rendered.len(), keys.len());
    }

    #[test]
    fn test_rejects_unsafe_prefix() {
        assert!(RedisConfig::default().prefix("a b").is_err());
    }

    #[test]
    fn test_to_count_range() {
        assert_eq!(to_count(7).unwrap(), 7);
        assert!(to_count(-1).is_err());
    }
}
