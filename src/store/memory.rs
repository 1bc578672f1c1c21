//! In-memory durable store (for testing and single-instance deployments).

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::records::{CacheEntry, CacheStatus, QuotaRecord, UsageEvent};
use super::{Persistence, StoreError, StoreResult};
use crate::domain::{PathId, QuotaKey, StudentId};

/// DashMap-backed store. Each map shard is its own lock, so unrelated
/// students never contend.
///
/// Lock order is always `active` before `entries`.
#[derive(Debug)]
pub struct MemoryPersistence {
    quotas: DashMap<QuotaKey, QuotaRecord>,
    entries: DashMap<PathId, CacheEntry>,
    active: DashMap<StudentId, PathId>,
    events: DashMap<StudentId, Vec<UsageEvent>>,
    available: AtomicBool,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self {
            quotas: DashMap::new(),
            entries: DashMap::new(),
            active: DashMap::new(),
            events: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`StoreError::Storage`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn quota_record_count(&self) -> usize {
        self.quotas.len()
    }

    pub fn cache_entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn usage_event_count(&self) -> usize {
        self.events.iter().map(|e| e.value().len()).sum()
    }

    /// Every entry ever stored for a student, oldest first.
    pub fn cache_history(&self, student_id: &StudentId) -> Vec<CacheEntry> {
        let mut history: Vec<CacheEntry> = self
            .entries
            .iter()
            .filter(|e| &e.value().student_id == student_id)
            .map(|e| e.value().clone())
            .collect();
        history.sort_by_key(|e| e.generated_at);
        history
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Storage {
                message: "memory store offline".to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl Persistence for MemoryPersistence {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_quota_record(
        &self,
        key: &QuotaKey,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<QuotaRecord> {
        self.check_available()?;
        let record = self
            .quotas
            .entry(key.clone())
            .or_insert_with(|| QuotaRecord::fresh(key, limit, at));
        Ok(record.value().clone())
    }

    async fn load_quota_record(&self, key: &QuotaKey) -> StoreResult<Option<QuotaRecord>> {
        self.check_available()?;
        Ok(self.quotas.get(key).map(|r| r.value().clone()))
    }

    async fn list_quota_records(&self, student_id: &StudentId) -> StoreResult<Vec<QuotaRecord>> {
        self.check_available()?;
        let mut records: Vec<QuotaRecord> = self
            .quotas
            .iter()
            .filter(|r| &r.key().student_id == student_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.month.cmp(&b.month).then(a.feature.cmp(&b.feature)));
        Ok(records)
    }

    async fn merge_quota_usage(
        &self,
        key: &QuotaKey,
        observed: u32,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<QuotaRecord> {
        self.check_available()?;
        let mut record = self
            .quotas
            .entry(key.clone())
            .or_insert_with(|| QuotaRecord::fresh(key, limit, at));
        record.merge_observed(observed, limit, at);
        Ok(record.value().clone())
    }

    async fn try_increment_quota(
        &self,
        key: &QuotaKey,
        limit: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<u32>> {
        self.check_available()?;
        let mut record = self
            .quotas
            .entry(key.clone())
            .or_insert_with(|| QuotaRecord::fresh(key, limit, at));
        record.limit = limit;
        if record.used_count >= limit {
            return Ok(None);
        }
        record.used_count += 1;
        record.updated_at = at;
        Ok(Some(record.used_count))
    }

    async fn release_quota(&self, key: &QuotaKey, at: DateTime<Utc>) -> StoreResult<u32> {
        self.check_available()?;
        match self.quotas.get_mut(key) {
            Some(mut record) => {
                record.used_count = record.used_count.saturating_sub(1);
                record.updated_at = at;
                Ok(record.used_count)
            }
            None => Ok(0),
        }
    }

    async fn activate_cache_entry(&self, entry: &CacheEntry) -> StoreResult<Option<PathId>> {
        self.check_available()?;
        if entry.status != CacheStatus::Active {
            return Err(StoreError::InvalidTransition {
                path_id: entry.path_id,
                message: format!("cannot activate an entry with status {}", entry.status),
            });
        }

        let superseded = match self.active.entry(entry.student_id.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = *slot.get();
                if let Some(mut old) = self.entries.get_mut(&previous) {
                    old.transition(CacheStatus::Superseded, entry.generated_at);
                }
                self.entries.insert(entry.path_id, entry.clone());
                slot.insert(entry.path_id);
                Some(previous)
            }
            Entry::Vacant(slot) => {
                self.entries.insert(entry.path_id, entry.clone());
                slot.insert(entry.path_id);
                None
            }
        };
        Ok(superseded)
    }

    async fn load_active_cache_entry(
        &self,
        student_id: &StudentId,
    ) -> StoreResult<Option<CacheEntry>> {
        self.check_available()?;
        let Some(path_id) = self.active.get(student_id).map(|id| *id.value()) else {
            return Ok(None);
        };
        Ok(self
            .entries
            .get(&path_id)
            .map(|e| e.value().clone())
            .filter(|e| e.status == CacheStatus::Active))
    }

    async fn load_cache_entry(&self, path_id: &PathId) -> StoreResult<Option<CacheEntry>> {
        self.check_available()?;
        Ok(self.entries.get(path_id).map(|e| e.value().clone()))
    }

    async fn expire_cache_entry(
        &self,
        student_id: &StudentId,
        path_id: &PathId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        match self.active.entry(student_id.clone()) {
            Entry::Occupied(slot) if slot.get() == path_id => {
                slot.remove();
                if let Some(mut entry) = self.entries.get_mut(path_id) {
                    entry.transition(CacheStatus::Expired, at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_stale_cache_entries(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.check_available()?;
        // Collect first: the `entries` iterator must be released before
        // `expire_cache_entry` takes the `active` lock.
        let stale: Vec<(StudentId, PathId)> = self
            .entries
            .iter()
            .filter(|e| e.status == CacheStatus::Active && e.is_expired_at(now))
            .map(|e| (e.student_id.clone(), e.path_id))
            .collect();

        let mut expired = 0;
        for (student_id, path_id) in stale {
            if self.expire_cache_entry(&student_id, &path_id, now).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn append_usage_event(&self, event: &UsageEvent) -> StoreResult<()> {
        self.check_available()?;
        self.events
            .entry(event.student_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn usage_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>> {
        self.check_available()?;
        let mut events: Vec<UsageEvent> = self
            .events
            .iter()
            .flat_map(|log| {
                log.value()
                    .iter()
                    .filter(|e| e.occurred_at >= from && e.occurred_at < to)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        events.sort_by_key(|e| e.occurred_at);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Feature, MonthKey, TokenUsage};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
    }

    fn key(student: &str) -> QuotaKey {
        QuotaKey::new(
            StudentId::new(student),
            Feature::PathGeneration,
            MonthKey::of(t0()),
        )
    }

    fn entry(student: &str, at: DateTime<Utc>) -> CacheEntry {
        CacheEntry::active(
            StudentId::new(student),
            at,
            Duration::hours(24),
            serde_json::json!({"units": [1, 2]}),
            "reasoning".into(),
            TokenUsage::default(),
        )
    }

    #[tokio::test]
    async fn test_ensure_quota_record_is_lazy_and_unique() {
        let store = MemoryPersistence::new();
        let k = key("s1");

        assert!(store.load_quota_record(&k).await.unwrap().is_none());
        let created = store.ensure_quota_record(&k, 10, t0()).await.unwrap();
        assert_eq!(created.used_count, 0);
        assert_eq!(created.reset_at, k.resets_at());

        store.try_increment_quota(&k, 10, t0()).await.unwrap();
        let again = store.ensure_quota_record(&k, 10, t0()).await.unwrap();
        assert_eq!(again.used_count, 1);
        assert_eq!(store.quota_record_count(), 1);
    }

    #[tokio::test]
    async fn test_try_increment_stops_at_limit() {
        let store = MemoryPersistence::new();
        let k = key("s1");

        for expected in 1..=3 {
            assert_eq!(
                store.try_increment_quota(&k, 3, t0()).await.unwrap(),
                Some(expected)
            );
        }
        assert_eq!(store.try_increment_quota(&k, 3, t0()).await.unwrap(), None);

        assert_eq!(store.release_quota(&k, t0()).await.unwrap(), 2);
        assert_eq!(store.try_increment_quota(&k, 3, t0()).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_zero_limit_never_admits() {
        let store = MemoryPersistence::new();
        assert_eq!(
            store.try_increment_quota(&key("s1"), 0, t0()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_months_are_separate_records() {
        let store = MemoryPersistence::new();
        let october = key("s1");
        let november = QuotaKey::new(
            october.student_id.clone(),
            october.feature,
            october.month.next(),
        );

        store.merge_quota_usage(&october, 7, 10, t0()).await.unwrap();
        store
            .ensure_quota_record(&november, 10, t0() + Duration::days(20))
            .await
            .unwrap();

        let records = store.list_quota_records(&october.student_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].month, october.month);
        assert_eq!(records[0].used_count, 7);
        assert_eq!(records[1].month, november.month);
        assert_eq!(records[1].used_count, 0);
    }

    #[tokio::test]
    async fn test_activate_supersedes_previous() {
        let store = MemoryPersistence::new();
        let first = entry("s1", t0());
        let second = entry("s1", t0() + Duration::hours(1));

        assert_eq!(store.activate_cache_entry(&first).await.unwrap(), None);
        assert_eq!(
            store.activate_cache_entry(&second).await.unwrap(),
            Some(first.path_id)
        );

        let old = store.load_cache_entry(&first.path_id).await.unwrap().unwrap();
        assert_eq!(old.status, CacheStatus::Superseded);
        assert_eq!(old.status_changed_at, Some(second.generated_at));

        let active = store
            .load_active_cache_entry(&StudentId::new("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.path_id, second.path_id);
    }

    #[tokio::test]
    async fn test_activate_rejects_terminal_entry() {
        let store = MemoryPersistence::new();
        let mut e = entry("s1", t0());
        e.transition(CacheStatus::Expired, t0());
        assert!(matches!(
            store.activate_cache_entry(&e).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_expire_is_conditional_on_active_path() {
        let store = MemoryPersistence::new();
        let student = StudentId::new("s1");
        let first = entry("s1", t0());
        let second = entry("s1", t0() + Duration::minutes(5));
        store.activate_cache_entry(&first).await.unwrap();
        store.activate_cache_entry(&second).await.unwrap();

        // First entry is no longer active, so expiring it is a no-op
        assert!(
            !store
                .expire_cache_entry(&student, &first.path_id, t0())
                .await
                .unwrap()
        );
        assert!(
            store
                .expire_cache_entry(&student, &second.path_id, t0())
                .await
                .unwrap()
        );
        assert!(
            store
                .load_active_cache_entry(&student)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_expire_stale_entries() {
        let store = MemoryPersistence::new();
        store.activate_cache_entry(&entry("old", t0())).await.unwrap();
        store
            .activate_cache_entry(&entry("fresh", t0() + Duration::hours(20)))
            .await
            .unwrap();

        let expired = store
            .expire_stale_cache_entries(t0() + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert!(
            store
                .load_active_cache_entry(&StudentId::new("fresh"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_usage_events_range() {
        let store = MemoryPersistence::new();
        for (i, student) in ["a", "b", "a"].iter().enumerate() {
            let event = UsageEvent::new(
                StudentId::new(*student),
                Feature::OpenAnswerGrading,
                t0() + Duration::hours(i as i64),
                100,
                50,
                dec!(0.002),
            );
            store.append_usage_event(&event).await.unwrap();
        }

        let events = store
            .usage_events(t0(), t0() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].occurred_at < events[1].occurred_at);
        assert_eq!(store.usage_event_count(), 3);
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = MemoryPersistence::new();
        store.set_available(false);
        assert!(matches!(
            store.load_quota_record(&key("s1")).await,
            Err(StoreError::Storage { .. })
        ));
        store.set_available(true);
        assert!(store.load_quota_record(&key("s1")).await.is_ok());
    }
}
