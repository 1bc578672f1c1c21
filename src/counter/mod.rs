//! Volatile per-month usage counters.
//!
//! The counter is the real-time admission authority. Each bucket key is
//! scoped to one UTC month, so rollover happens by key change and old keys
//! simply expire.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::MemoryCounter;
#[cfg(feature = "redis-backend")]
pub use redis::{RedisConfig, RedisCounter};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::QuotaConfig;
use crate::domain::{Clock, Feature, QuotaKey, StudentId};

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Counter backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("Counter operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Unexpected counter reply: {message}")]
    Protocol { message: String },
}

impl CounterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout(_))
    }
}

pub type CounterResult<T> = std::result::Result<T, CounterError>;

/// Result of one atomic check-and-increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterOutcome {
    pub allowed: bool,
    pub used: u32,
}

/// Atomic primitives a volatile key-value backend must provide.
#[async_trait::async_trait]
pub trait CounterBackend: Send + Sync {
    fn name(&self) -> &str;

    /// If `used < limit`, increment and allow; otherwise deny without
    /// mutating. Sets the key to expire at `expire_at`.
    async fn check_and_increment(
        &self,
        key: &QuotaKey,
        limit: u32,
        expire_at: DateTime<Utc>,
    ) -> CounterResult<CounterOutcome>;

    /// Decrement floored at zero.
    async fn release(&self, key: &QuotaKey) -> CounterResult<u32>;

    /// Current count; absent keys read as zero.
    async fn current(&self, key: &QuotaKey) -> CounterResult<u32>;

    /// Set the count to `max(current, floor)`.
    async fn raise_to(
        &self,
        key: &QuotaKey,
        floor: u32,
        expire_at: DateTime<Utc>,
    ) -> CounterResult<u32>;

    /// Drop keys past their expiry. Backends that expire keys natively
    /// keep the default.
    async fn purge_expired(&self) -> CounterResult<usize> {
        Ok(0)
    }
}

/// Outcome of an admission check as reported to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub used: u32,
    pub limit: u32,
    pub resets_at: DateTime<Utc>,
    /// Decided by the durable store because the counter backend failed.
    pub degraded: bool,
}

/// Volatile counter service: maps (student, feature) to the current
/// month's bucket and applies the configured limit.
#[derive(Clone)]
pub struct VolatileCounter {
    backend: Arc<dyn CounterBackend>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
}

impl VolatileCounter {
    pub fn new(backend: Arc<dyn CounterBackend>, clock: Arc<dyn Clock>, config: QuotaConfig) -> Self {
        Self {
            backend,
            clock,
            config,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn key_for(&self, student_id: &StudentId, feature: Feature) -> QuotaKey {
        QuotaKey::current(student_id, feature, self.clock.now())
    }

    pub fn limit_for(&self, feature: Feature) -> u32 {
        self.config.limit_for(feature)
    }

    pub async fn check_and_increment_key(&self, key: &QuotaKey) -> CounterResult<AdmissionDecision> {
        let limit = self.config.limit_for(key.feature);
        let expire_at = key.expire_at(self.config.counter_retention());
        let outcome = self
            .backend
            .check_and_increment(key, limit, expire_at)
            .await?;
        Ok(AdmissionDecision {
            allowed: outcome.allowed,
            used: outcome.used,
            limit,
            resets_at: key.resets_at(),
            degraded: false,
        })
    }

    pub async fn check_and_increment(
        &self,
        student_id: &StudentId,
        feature: Feature,
    ) -> CounterResult<AdmissionDecision> {
        let key = self.key_for(student_id, feature);
        self.check_and_increment_key(&key).await
    }

    pub async fn release(&self, key: &QuotaKey) -> CounterResult<u32> {
        self.backend.release(key).await
    }

    pub async fn current(&self, key: &QuotaKey) -> CounterResult<u32> {
        self.backend.current(key).await
    }

    pub async fn raise_to(&self, key: &QuotaKey, floor: u32) -> CounterResult<u32> {
        let expire_at = key.expire_at(self.config.counter_retention());
        self.backend.raise_to(key, floor, expire_at).await
    }

    pub async fn purge_expired(&self) -> CounterResult<usize> {
        self.backend.purge_expired().await
    }
}
