//! Durable store: the audit source of truth for quota usage, path cache
//! entries and usage events.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod records;

pub use memory::MemoryPersistence;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresPersistence};
pub use records::{CacheEntry, CacheStatus, QuotaRecord, UsageEvent};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{PathId, QuotaKey, StudentId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {message}")]
    Corrupt { message: String },

    #[error("Invalid cache transition for {path_id}: {message}")]
    InvalidTransition { path_id: PathId, message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for durable store backends.
///
/// Every mutation is atomic per key: per (student, feature, month) for quota
/// records and per student for cache entries.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    fn name(&self) -> &str;

    /// Load the record for `key`, creating it with `used_count = 0` on first use.
    async fn ensure_quota_record(
        &self,
        key: &QuotaKey,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<QuotaRecord>;

    async fn load_quota_record(&self, key: &QuotaKey) -> StoreResult<Option<QuotaRecord>>;

    /// All records of a student, oldest month first.
    async fn list_quota_records(&self, student_id: &StudentId) -> StoreResult<Vec<QuotaRecord>>;

    /// Merge a count observed on the volatile counter:
    /// `used = min(max(used, observed), limit)`. Creates the record if absent.
    async fn merge_quota_usage(
        &self,
        key: &QuotaKey,
        observed: u32,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<QuotaRecord>;

    /// Conditional increment used for degraded admission. Returns the new
    /// count, or `None` when the record is already at `limit`.
    async fn try_increment_quota(
        &self,
        key: &QuotaKey,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<u32>>;

    /// Refund one unconsumed degraded-mode reservation, floored at zero.
    async fn release_quota(&self, key: &QuotaKey, at: DateTime<Utc>) -> StoreResult<u32>;

    /// Store `entry` as the student's active entry. Any previously active
    /// entry becomes superseded in the same atomic step; its id is returned.
    async fn activate_cache_entry(&self, entry: &CacheEntry) -> StoreResult<Option<PathId>>;

    /// The student's active entry, whether or not its window has passed.
    async fn load_active_cache_entry(
        &self,
        student_id: &StudentId,
    ) -> StoreResult<Option<CacheEntry>>;

    async fn load_cache_entry(&self, path_id: &PathId) -> StoreResult<Option<CacheEntry>>;

    /// Mark `path_id` expired if it is still the student's active entry.
    async fn expire_cache_entry(
        &self,
        student_id: &StudentId,
        path_id: &PathId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Expire every active entry whose window ended at or before `now`.
    async fn expire_stale_cache_entries(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn append_usage_event(&self, event: &UsageEvent) -> StoreResult<()>;

    /// Events with `from <= occurred_at < to`, oldest first.
    async fn usage_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>>;
}

#[cfg(feature = "postgres")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> StoreResult<T>;
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(feature = "postgres")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}
