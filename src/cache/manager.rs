//! Path cache state machine over the durable store.
//!
//! Per student: `none -> active -> {expired | superseded}`. Terminal states
//! never change again. The store makes each transition atomic per student;
//! this manager adds lazy expiry, statistics and logging.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::collaborators::GeneratedPath;
use crate::domain::{Clock, StudentId};
use crate::observability::GovernanceMetrics;
use crate::store::{CacheEntry, Persistence, StoreResult};

/// Cache statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub supersessions: u64,
    pub invalidations: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Clone)]
pub struct PathCacheManager {
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    metrics: Arc<GovernanceMetrics>,
}

impl PathCacheManager {
    pub fn new(
        store: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            metrics,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The student's live entry, or `None`. An active entry found past its
    /// window is expired on the way out.
    pub async fn get(&self, student_id: &StudentId) -> StoreResult<Option<CacheEntry>> {
        let now = self.clock.now();
        let Some(entry) = self.store.load_active_cache_entry(student_id).await? else {
            self.metrics.cache_misses.inc();
            return Ok(None);
        };

        if entry.is_live(now) {
            self.metrics.cache_hits.inc();
            tracing::debug!(
                student_id = %student_id,
                path_id = %entry.path_id,
                "Path cache hit"
            );
            return Ok(Some(entry));
        }

        self.expire_lapsed(&entry).await?;
        self.metrics.cache_misses.inc();
        Ok(None)
    }

    /// The student's live entry, without touching statistics or state.
    pub async fn peek(&self, student_id: &StudentId) -> StoreResult<Option<CacheEntry>> {
        let now = self.clock.now();
        Ok(self
            .store
            .load_active_cache_entry(student_id)
            .await?
            .filter(|e| e.is_live(now)))
    }

    /// Store a freshly generated path as the student's active entry,
    /// superseding any previous one.
    pub async fn put(
        &self,
        student_id: &StudentId,
        path: &GeneratedPath,
    ) -> StoreResult<CacheEntry> {
        let entry = CacheEntry::active(
            student_id.clone(),
            self.clock.now(),
            self.ttl,
            path.recommendations.clone(),
            path.reasoning.clone(),
            path.usage.clone(),
        )
        .with_confidence(path.confidence);

        let superseded = self.store.activate_cache_entry(&entry).await?;
        if let Some(previous) = superseded {
            self.metrics.cache_supersessions.inc();
            tracing::debug!(
                student_id = %student_id,
                path_id = %entry.path_id,
                superseded = %previous,
                "Superseded cached path"
            );
        }
        tracing::info!(
            student_id = %student_id,
            path_id = %entry.path_id,
            expires_at = %entry.expires_at,
            "Cached generated path"
        );
        Ok(entry)
    }

    /// Expire the student's live entry now. Returns `false`, changing
    /// nothing, when there is no live entry.
    pub async fn invalidate(&self, student_id: &StudentId) -> StoreResult<bool> {
        let now = self.clock.now();
        let Some(entry) = self.store.load_active_cache_entry(student_id).await? else {
            return Ok(false);
        };

        if !entry.is_live(now) {
            self.expire_lapsed(&entry).await?;
            return Ok(false);
        }

        let invalidated = self
            .store
            .expire_cache_entry(student_id, &entry.path_id, now)
            .await?;
        if invalidated {
            self.metrics.cache_invalidations.inc();
            tracing::info!(
                student_id = %student_id,
                path_id = %entry.path_id,
                "Invalidated cached path"
            );
        }
        Ok(invalidated)
    }

    /// Expire every active entry whose window has ended.
    pub async fn sweep_expired(&self) -> StoreResult<usize> {
        let expired = self
            .store
            .expire_stale_cache_entries(self.clock.now())
            .await?;
        if expired > 0 {
            self.metrics.cache_expirations.add(expired as u64);
            tracing::debug!(expired, "Swept expired cached paths");
        }
        Ok(expired)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.metrics.cache_hits.get(),
            misses: self.metrics.cache_misses.get(),
            supersessions: self.metrics.cache_supersessions.get(),
            invalidations: self.metrics.cache_invalidations.get(),
            expirations: self.metrics.cache_expirations.get(),
        }
    }

    async fn expire_lapsed(&self, entry: &CacheEntry) -> StoreResult<()> {
        // Conditional on the path id: a concurrent put may already have
        // replaced this entry.
        let expired = self
            .store
            .expire_cache_entry(&entry.student_id, &entry.path_id, self.clock.now())
            .await?;
        if expired {
            self.metrics.cache_expirations.inc();
            tracing::debug!(
                student_id = %entry.student_id,
                path_id = %entry.path_id,
                "Cached path expired"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ManualClock, TokenUsage};
    use crate::store::{CacheStatus, MemoryPersistence};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn manager() -> (PathCacheManager, Arc<ManualClock>, Arc<MemoryPersistence>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryPersistence::new());
        let manager = PathCacheManager::new(
            store.clone(),
            clock.clone(),
            Duration::hours(24),
            Arc::new(GovernanceMetrics::new()),
        );
        (manager, clock, store)
    }

    fn path(label: &str) -> GeneratedPath {
        GeneratedPath {
            recommendations: serde_json::json!([label]),
            reasoning: format!("because {label}"),
            usage: TokenUsage::new(100, 200, dec!(0.003)),
            confidence: Some(0.8),
        }
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let (manager, _, _) = manager();
        let student = StudentId::new("s1");

        let stored = manager.put(&student, &path("algebra")).await.unwrap();
        let fetched = manager.get(&student).await.unwrap().unwrap();
        assert_eq!(fetched.path_id, stored.path_id);
        assert_eq!(fetched.recommendations, serde_json::json!(["algebra"]));
        assert_eq!(fetched.confidence, Some(0.8));
        assert_eq!(fetched.expires_at - fetched.generated_at, Duration::hours(24));
    }

    #[tokio::test]
    async fn test_get_expires_lazily() {
        let (manager, clock, store) = manager();
        let student = StudentId::new("s1");
        let stored = manager.put(&student, &path("a")).await.unwrap();

        clock.advance(Duration::hours(24));
        assert!(manager.get(&student).await.unwrap().is_none());

        let entry = store.load_cache_entry(&stored.path_id).await.unwrap().unwrap();
        assert_eq!(entry.status, CacheStatus::Expired);
        assert_eq!(manager.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_put_supersedes_previous() {
        let (manager, clock, store) = manager();
        let student = StudentId::new("s1");
        let first = manager.put(&student, &path("a")).await.unwrap();
        clock.advance(Duration::minutes(1));
        let second = manager.put(&student, &path("b")).await.unwrap();

        let history = store.cache_history(&student);
        let active: Vec<_> = history
            .iter()
            .filter(|e| e.status == CacheStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].path_id, second.path_id);
        assert_eq!(history[0].path_id, first.path_id);
        assert_eq!(history[0].status, CacheStatus::Superseded);
        assert_eq!(manager.stats().supersessions, 1);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let (manager, _, _) = manager();
        let student = StudentId::new("s1");
        manager.put(&student, &path("a")).await.unwrap();

        assert!(manager.invalidate(&student).await.unwrap());
        assert!(!manager.invalidate(&student).await.unwrap());
        assert!(manager.get(&student).await.unwrap().is_none());
        assert!(!manager.invalidate(&StudentId::new("nobody")).await.unwrap());
        assert_eq!(manager.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_invalidate_lapsed_entry_is_noop() {
        let (manager, clock, _) = manager();
        let student = StudentId::new("s1");
        manager.put(&student, &path("a")).await.unwrap();
        clock.advance(Duration::hours(25));

        assert!(!manager.invalidate(&student).await.unwrap());
        assert_eq!(manager.stats().invalidations, 0);
        assert_eq!(manager.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_sweep_and_hit_rate() {
        let (manager, clock, _) = manager();
        manager.put(&StudentId::new("a"), &path("a")).await.unwrap();
        manager.put(&StudentId::new("b"), &path("b")).await.unwrap();

        assert!(manager.get(&StudentId::new("a")).await.unwrap().is_some());
        assert!(manager.get(&StudentId::new("c")).await.unwrap().is_none());
        assert_eq!(manager.stats().hit_rate(), 0.5);

        clock.advance(Duration::hours(30));
        assert_eq!(manager.sweep_expired().await.unwrap(), 2);
        assert_eq!(manager.sweep_expired().await.unwrap(), 0);
    }
}
