//! Eventual consistency between the volatile counter and the durable store.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QuotaConfig;
use crate::counter::VolatileCounter;
use crate::domain::{Clock, QuotaKey};
use crate::observability::GovernanceMetrics;
use crate::store::Persistence;

/// Keys awaiting reconciliation, the reservations still in flight per key,
/// and refunds that could not be applied when their reservation settled.
/// No global lock: all of them are sharded maps.
#[derive(Debug, Default)]
pub struct ReconcileQueue {
    dirty: DashSet<QuotaKey>,
    in_flight: DashMap<QuotaKey, u32>,
    counter_refunds: DashMap<QuotaKey, u32>,
    durable_refunds: DashMap<QuotaKey, u32>,
}

impl ReconcileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, key: QuotaKey) {
        self.dirty.insert(key);
    }

    pub fn is_marked(&self, key: &QuotaKey) -> bool {
        self.dirty.contains(key)
    }

    pub fn drain(&self) -> Vec<QuotaKey> {
        let keys: Vec<QuotaKey> = self.dirty.iter().map(|k| k.key().clone()).collect();
        keys.into_iter()
            .filter_map(|k| self.dirty.remove(&k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    pub(crate) fn begin_reservation(&self, key: &QuotaKey) {
        increment(&self.in_flight, key);
    }

    pub(crate) fn end_reservation(&self, key: &QuotaKey) {
        decrement(&self.in_flight, key);
    }

    /// Reservations admitted by the counter but not yet committed or released.
    pub fn in_flight(&self, key: &QuotaKey) -> u32 {
        count(&self.in_flight, key)
    }

    /// A counter refund failed; the next pass for `key` retries it.
    pub(crate) fn defer_counter_refund(&self, key: &QuotaKey) {
        increment(&self.counter_refunds, key);
        self.mark(key.clone());
    }

    /// A degraded reservation's durable refund failed or never ran.
    pub(crate) fn defer_durable_refund(&self, key: &QuotaKey) {
        increment(&self.durable_refunds, key);
        self.mark(key.clone());
    }

    pub(crate) fn settle_counter_refund(&self, key: &QuotaKey) {
        decrement(&self.counter_refunds, key);
    }

    pub(crate) fn settle_durable_refund(&self, key: &QuotaKey) {
        decrement(&self.durable_refunds, key);
    }

    /// Units still held by the counter for failed calls.
    pub fn pending_counter_refunds(&self, key: &QuotaKey) -> u32 {
        count(&self.counter_refunds, key)
    }

    pub fn pending_durable_refunds(&self, key: &QuotaKey) -> u32 {
        count(&self.durable_refunds, key)
    }

    /// Counter units that are not consumption: in-flight reservations plus
    /// refunds the counter still owes.
    pub fn unsettled(&self, key: &QuotaKey) -> u32 {
        self.in_flight(key) + self.pending_counter_refunds(key)
    }
}

fn increment(map: &DashMap<QuotaKey, u32>, key: &QuotaKey) {
    *map.entry(key.clone()).or_insert(0) += 1;
}

fn decrement(map: &DashMap<QuotaKey, u32>, key: &QuotaKey) {
    map.remove_if_mut(key, |_, n| {
        *n = n.saturating_sub(1);
        *n == 0
    });
}

fn count(map: &DashMap<QuotaKey, u32>, key: &QuotaKey) -> u32 {
    map.get(key).map(|n| *n).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys whose durable record now reflects the counter.
    pub reconciled: usize,
    /// Keys whose lost counter was restored from the durable record.
    pub restored: usize,
    /// Keys that failed and were queued again.
    pub deferred: usize,
    /// Expired counter keys dropped from the volatile backend.
    pub purged: usize,
}

/// Folds volatile counts into durable records, and restores counters that
/// the volatile backend lost.
pub struct Reconciler {
    counter: VolatileCounter,
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
    queue: Arc<ReconcileQueue>,
    metrics: Arc<GovernanceMetrics>,
}

impl Reconciler {
    pub fn new(
        counter: VolatileCounter,
        store: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        config: QuotaConfig,
        queue: Arc<ReconcileQueue>,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        Self {
            counter,
            store,
            clock,
            config,
            queue,
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<ReconcileQueue> {
        &self.queue
    }

    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        match self.counter.purge_expired().await {
            Ok(purged) => report.purged = purged,
            Err(e) => tracing::warn!(error = %e, "Failed to purge expired counter keys"),
        }
        let keys = self.queue.drain();
        if keys.is_empty() {
            return report;
        }
        self.metrics.reconcile_runs.inc();

        let outcomes = futures::future::join_all(keys.into_iter().map(|key| async move {
            let outcome = self.reconcile_key(&key).await;
            (key, outcome)
        }))
        .await;

        for (key, outcome) in outcomes {
            match outcome {
                Ok(restored) => {
                    report.reconciled += 1;
                    if restored {
                        report.restored += 1;
                    }
                }
                Err(message) => {
                    tracing::error!(
                        key = %key,
                        error = %message,
                        "Quota reconciliation failed; key re-queued"
                    );
                    self.queue.mark(key);
                    self.metrics.reconcile_deferred.inc();
                    report.deferred += 1;
                }
            }
        }

        self.metrics.reconcile_pending.set(self.queue.len() as i64);
        tracing::debug!(
            reconciled = report.reconciled,
            restored = report.restored,
            deferred = report.deferred,
            purged = report.purged,
            "Quota reconciliation pass complete"
        );
        report
    }

    /// Returns whether the counter had to be raised to the durable value.
    async fn reconcile_key(&self, key: &QuotaKey) -> Result<bool, String> {
        self.apply_deferred_refunds(key).await?;

        let limit = self.config.limit_for(key.feature);
        let volatile = self.counter.current(key).await.map_err(|e| e.to_string())?;
        // Read unsettled units after the counter: a reservation admitted in
        // between is then subtracted without being counted, never the reverse.
        let observed = volatile.saturating_sub(self.queue.unsettled(key));

        let record = self
            .store
            .merge_quota_usage(key, observed, limit, self.clock.now())
            .await
            .map_err(|e| e.to_string())?;

        if record.used_count > volatile {
            self.counter
                .raise_to(key, record.used_count)
                .await
                .map_err(|e| e.to_string())?;
            tracing::info!(
                key = %key,
                durable = record.used_count,
                volatile,
                "Restored volatile counter from durable record"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Each refund is settled only after it was applied, so a failure
    /// leaves the rest owed for the next pass.
    async fn apply_deferred_refunds(&self, key: &QuotaKey) -> Result<(), String> {
        for _ in 0..self.queue.pending_counter_refunds(key) {
            let used = self.counter.release(key).await.map_err(|e| e.to_string())?;
            self.queue.settle_counter_refund(key);
            tracing::info!(key = %key, used, "Deferred quota refund applied to counter");
        }
        for _ in 0..self.queue.pending_durable_refunds(key) {
            let used = self
                .store
                .release_quota(key, self.clock.now())
                .await
                .map_err(|e| e.to_string())?;
            self.queue.settle_durable_refund(key);
            tracing::info!(key = %key, used, "Deferred quota refund applied to durable record");
        }
        Ok(())
    }

    /// Run [`Reconciler::run_once`] every `interval` until `shutdown` fires.
    /// A final pass runs on shutdown.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.run_once().await;
                        tracing::debug!("Quota reconciler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounter;
    use crate::domain::{Feature, ManualClock, StudentId};
    use crate::store::MemoryPersistence;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        reconciler: Arc<Reconciler>,
        backend: Arc<MemoryCounter>,
        store: Arc<MemoryPersistence>,
        counter: VolatileCounter,
        clock: Arc<ManualClock>,
        key: QuotaKey,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryCounter::new(clock.clone()));
        let store = Arc::new(MemoryPersistence::new());
        let config = QuotaConfig::default();
        let counter = VolatileCounter::new(backend.clone(), clock.clone(), config.clone());
        let key = counter.key_for(&StudentId::new("s1"), Feature::PathGeneration);
        let reconciler = Arc::new(Reconciler::new(
            counter.clone(),
            store.clone(),
            clock.clone(),
            config,
            Arc::new(ReconcileQueue::new()),
            Arc::new(GovernanceMetrics::new()),
        ));
        Fixture {
            reconciler,
            backend,
            store,
            counter,
            clock,
            key,
        }
    }

    #[tokio::test]
    async fn test_merges_volatile_into_durable() {
        let f = fixture();
        for _ in 0..3 {
            f.counter.check_and_increment_key(&f.key).await.unwrap();
        }
        f.reconciler.queue().mark(f.key.clone());

        let report = f.reconciler.run_once().await;
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.restored, 0);
        let record = f.store.load_quota_record(&f.key).await.unwrap().unwrap();
        assert_eq!(record.used_count, 3);
        assert!(f.reconciler.queue().is_empty());
    }

    #[tokio::test]
    async fn test_restores_lost_counter() {
        let f = fixture();
        f.store
            .merge_quota_usage(&f.key, 4, 10, Utc::now())
            .await
            .unwrap();
        f.backend.forget(&f.key);
        f.reconciler.queue().mark(f.key.clone());

        let report = f.reconciler.run_once().await;
        assert_eq!(report.restored, 1);
        assert_eq!(f.counter.current(&f.key).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_in_flight_reservations_are_not_merged() {
        let f = fixture();
        f.counter.check_and_increment_key(&f.key).await.unwrap();
        f.counter.check_and_increment_key(&f.key).await.unwrap();
        f.reconciler.queue().begin_reservation(&f.key);
        f.reconciler.queue().mark(f.key.clone());

        f.reconciler.run_once().await;
        let record = f.store.load_quota_record(&f.key).await.unwrap().unwrap();
        assert_eq!(record.used_count, 1);
    }

    #[tokio::test]
    async fn test_owed_refund_applied_before_merge() {
        let f = fixture();
        f.counter.check_and_increment_key(&f.key).await.unwrap();
        f.counter.check_and_increment_key(&f.key).await.unwrap();
        f.reconciler.queue().defer_counter_refund(&f.key);
        assert_eq!(f.reconciler.queue().unsettled(&f.key), 1);

        let report = f.reconciler.run_once().await;
        assert_eq!(report.reconciled, 1);
        assert_eq!(f.counter.current(&f.key).await.unwrap(), 1);
        assert_eq!(f.reconciler.queue().pending_counter_refunds(&f.key), 0);
        let record = f.store.load_quota_record(&f.key).await.unwrap().unwrap();
        assert_eq!(record.used_count, 1);
    }

    #[tokio::test]
    async fn test_pass_purges_expired_counter_keys() {
        let f = fixture();
        f.counter.check_and_increment_key(&f.key).await.unwrap();
        assert_eq!(f.reconciler.run_once().await.purged, 0);
        assert_eq!(f.backend.len(), 1);

        let expiry = f.key.expire_at(QuotaConfig::default().counter_retention());
        f.clock.set(expiry + chrono::Duration::seconds(1));
        let report = f.reconciler.run_once().await;
        assert_eq!(report.purged, 1);
        assert!(f.backend.is_empty());
    }

    #[tokio::test]
    async fn test_failure_requeues_key() {
        let f = fixture();
        f.reconciler.queue().mark(f.key.clone());
        f.store.set_available(false);

        let report = f.reconciler.run_once().await;
        assert_eq!(report.deferred, 1);
        assert!(f.reconciler.queue().is_marked(&f.key));

        f.store.set_available(true);
        let report = f.reconciler.run_once().await;
        assert_eq!(report.reconciled, 1);
    }

    #[tokio::test]
    async fn test_spawned_reconciler_stops_on_cancel() {
        let f = fixture();
        f.counter.check_and_increment_key(&f.key).await.unwrap();
        f.reconciler.queue().mark(f.key.clone());

        let token = CancellationToken::new();
        let handle = f
            .reconciler
            .clone()
            .spawn(Duration::from_millis(10), token.clone());
        token.cancel();
        handle.await.unwrap();

        let record = f.store.load_quota_record(&f.key).await.unwrap().unwrap();
        assert_eq!(record.used_count, 1);
    }
}
