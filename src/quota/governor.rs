//! Admission control with reserve-then-settle semantics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::reconcile::ReconcileQueue;
use crate::config::{DegradedPolicy, QuotaConfig};
use crate::counter::{AdmissionDecision, CounterError, VolatileCounter};
use crate::domain::{Clock, Feature, MonthKey, QuotaKey, StudentId};
use crate::observability::GovernanceMetrics;
use crate::store::{Persistence, QuotaRecord};
use crate::{Error, Result};

/// One admitted unit of quota, held until the upstream call settles.
///
/// Settle it with [`QuotaGovernor::commit`] on success or
/// [`QuotaGovernor::release`] otherwise. A reservation dropped unsettled,
/// for instance by a panicking task, queues its own refund for the
/// reconciler.
#[derive(Debug)]
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    key: QuotaKey,
    decision: AdmissionDecision,
    queue: Arc<ReconcileQueue>,
    settled: bool,
}

impl Reservation {
    pub fn key(&self) -> &QuotaKey {
        &self.key
    }

    pub fn decision(&self) -> &AdmissionDecision {
        &self.decision
    }

    pub fn is_degraded(&self) -> bool {
        self.decision.degraded
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(
            key = %self.key,
            degraded = self.decision.degraded,
            "Reservation dropped unsettled; refund queued"
        );
        if self.decision.degraded {
            self.queue.defer_durable_refund(&self.key);
        } else {
            // Owe the refund before the in-flight count drops, so the unit
            // is never observed as consumption.
            self.queue.defer_counter_refund(&self.key);
            self.queue.end_reservation(&self.key);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FeatureQuota {
    pub feature: Feature,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub resets_at: DateTime<Utc>,
}

impl FeatureQuota {
    fn new(feature: Feature, used: u32, limit: u32, resets_at: DateTime<Utc>) -> Self {
        Self {
            feature,
            used,
            limit,
            remaining: limit.saturating_sub(used),
            resets_at,
        }
    }

    fn from_record(record: &QuotaRecord) -> Self {
        Self::new(
            record.feature,
            record.used_count,
            record.limit,
            record.reset_at,
        )
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Real-time usage, read from the volatile counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub student_id: StudentId,
    pub month: MonthKey,
    pub features: Vec<FeatureQuota>,
    /// Read from the durable store because the counter was unreachable.
    pub degraded: bool,
}

impl QuotaStatus {
    pub fn feature(&self, feature: Feature) -> Option<&FeatureQuota> {
        self.features.iter().find(|f| f.feature == feature)
    }
}

/// Durable usage for the current month, reconciled on read, plus the
/// records of earlier months.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuotaSummary {
    pub student_id: StudentId,
    pub month: MonthKey,
    pub features: Vec<FeatureQuota>,
    pub history: Vec<QuotaRecord>,
}

impl QuotaSummary {
    pub fn feature(&self, feature: Feature) -> Option<&FeatureQuota> {
        self.features.iter().find(|f| f.feature == feature)
    }
}

#[derive(Clone)]
pub struct QuotaGovernor {
    counter: VolatileCounter,
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
    queue: Arc<ReconcileQueue>,
    metrics: Arc<GovernanceMetrics>,
}

impl QuotaGovernor {
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

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<ReconcileQueue> {
        &self.queue
    }

    /// Atomic check-and-increment for the current month. Falls back to the
    /// durable store when the counter is unreachable; never fails open.
    pub async fn check_and_increment(
        &self,
        student_id: &StudentId,
        feature: Feature,
    ) -> Result<AdmissionDecision> {
        let key = self.counter.key_for(student_id, feature);
        let decision = match self.counter.check_and_increment_key(&key).await {
            Ok(decision) => decision,
            Err(e) => self.degraded_admission(&key, e).await?,
        };
        self.metrics
            .record_admission(decision.allowed, decision.degraded);
        Ok(decision)
    }

    /// Reserve one unit of `feature`, or fail with [`Error::QuotaExceeded`].
    pub async fn admit(&self, student_id: &StudentId, feature: Feature) -> Result<Reservation> {
        let key = self.counter.key_for(student_id, feature);
        // Track before incrementing so reconciliation never folds an
        // unsettled reservation into the durable record.
        self.queue.begin_reservation(&key);

        let decision = match self.counter.check_and_increment_key(&key).await {
            Ok(decision) => decision,
            Err(e) => {
                self.queue.end_reservation(&key);
                let decision = self.degraded_admission(&key, e).await?;
                self.metrics.record_admission(decision.allowed, true);
                return self.reserve(key, decision);
            }
        };
        self.metrics.record_admission(decision.allowed, false);

        if !decision.allowed {
            self.queue.end_reservation(&key);
        }
        self.reserve(key, decision)
    }

    fn reserve(&self, key: QuotaKey, decision: AdmissionDecision) -> Result<Reservation> {
        if !decision.allowed {
            tracing::info!(
                student_id = %key.student_id,
                feature = %key.feature,
                used = decision.used,
                limit = decision.limit,
                "Quota exceeded"
            );
            return Err(Error::QuotaExceeded {
                feature: key.feature,
                used: decision.used,
                limit: decision.limit,
                reset_at: decision.resets_at,
            });
        }
        tracing::debug!(
            student_id = %key.student_id,
            feature = %key.feature,
            used = decision.used,
            limit = decision.limit,
            degraded = decision.degraded,
            "Quota reserved"
        );
        Ok(Reservation {
            key,
            decision,
            queue: Arc::clone(&self.queue),
            settled: false,
        })
    }

    async fn degraded_admission(
        &self,
        key: &QuotaKey,
        cause: CounterError,
    ) -> Result<AdmissionDecision> {
        tracing::warn!(
            key = %key,
            error = %cause,
            policy = ?self.config.degraded_policy,
            "Counter backend unavailable; using degraded admission"
        );
        if self.config.degraded_policy == DegradedPolicy::DenyAll {
            self.metrics.record_admission(false, true);
            return Err(Error::CounterUnavailable(cause));
        }

        let limit = self.config.limit_for(key.feature);
        let admitted = match self
            .store
            .try_increment_quota(key, limit, self.clock.now())
            .await
        {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::error!(
                    key = %key,
                    error = %e,
                    "Durable store unavailable during degraded admission; denying"
                );
                self.metrics.record_admission(false, true);
                return Err(Error::PersistenceUnavailable(e));
            }
        };

        let used = match admitted {
            Some(used) => {
                self.queue.mark(key.clone());
                used
            }
            None => limit,
        };
        Ok(AdmissionDecision {
            allowed: admitted.is_some(),
            used,
            limit,
            resets_at: key.resets_at(),
            degraded: true,
        })
    }

    /// The upstream call succeeded: the reservation becomes consumption.
    pub fn commit(&self, mut reservation: Reservation) {
        reservation.settled = true;
        let key = &reservation.key;
        if !reservation.decision.degraded {
            self.queue.end_reservation(key);
        }
        self.queue.mark(key.clone());
        tracing::debug!(
            key = %key,
            used = reservation.decision.used,
            "Quota reservation committed"
        );
    }

    /// The upstream call did not complete: refund the reservation. A refund
    /// the backend rejects is owed until the reconciler applies it.
    pub async fn release(&self, mut reservation: Reservation) {
        reservation.settled = true;
        let key = &reservation.key;
        self.metrics.reservations_released.inc();

        if reservation.decision.degraded {
            if let Err(e) = self.store.release_quota(key, self.clock.now()).await {
                tracing::error!(
                    key = %key,
                    error = %e,
                    "Failed to refund degraded reservation; deferred to reconciliation"
                );
                self.queue.defer_durable_refund(key);
            }
            return;
        }

        match self.counter.release(key).await {
            Ok(used) => {
                self.queue.end_reservation(key);
                tracing::debug!(key = %key, used, "Quota reservation released");
            }
            Err(e) => {
                self.queue.defer_counter_refund(key);
                self.queue.end_reservation(key);
                tracing::error!(
                    key = %key,
                    error = %e,
                    "Failed to refund reservation; deferred to reconciliation"
                );
            }
        }
    }

    /// Real-time per-feature usage. Falls back to durable records, flagged
    /// `degraded`, when the counter is unreachable.
    pub async fn get_status(&self, student_id: &StudentId) -> Result<QuotaStatus> {
        let now = self.clock.now();
        let month = MonthKey::of(now);
        let mut features = Vec::with_capacity(Feature::ALL.len());
        let mut degraded = false;

        for feature in Feature::ALL {
            let key = QuotaKey::new(student_id.clone(), feature, month);
            let limit = self.config.limit_for(feature);
            let used = match self.counter.current(&key).await {
                Ok(used) => used,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Counter unavailable; reading durable status");
                    degraded = true;
                    self.store
                        .load_quota_record(&key)
                        .await?
                        .map(|r| r.used_count)
                        .unwrap_or(0)
                }
            };
            features.push(FeatureQuota::new(feature, used, limit, key.resets_at()));
        }

        Ok(QuotaStatus {
            student_id: student_id.clone(),
            month,
            features,
            degraded,
        })
    }

    /// Durable-backed summary. Each feature's counter is merged into its
    /// record first; a record is created on first observation.
    pub async fn get_summary(&self, student_id: &StudentId) -> Result<QuotaSummary> {
        let now = self.clock.now();
        let month = MonthKey::of(now);
        let mut features = Vec::with_capacity(Feature::ALL.len());

        for feature in Feature::ALL {
            let key = QuotaKey::new(student_id.clone(), feature, month);
            let limit = self.config.limit_for(feature);
            let record = match self.counter.current(&key).await {
                Ok(volatile) => {
                    let observed = volatile.saturating_sub(self.queue.unsettled(&key));
                    self.store
                        .merge_quota_usage(&key, observed, limit, now)
                        .await?
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Counter unavailable; summary from durable store only");
                    self.store.ensure_quota_record(&key, limit, now).await?
                }
            };
            features.push(FeatureQuota::from_record(&record));
        }

        let history = self
            .store
            .list_quota_records(student_id)
            .await?
            .into_iter()
            .filter(|r| r.month < month)
            .collect();

        Ok(QuotaSummary {
            student_id: student_id.clone(),
            month,
            features,
            history,
        })
    }
}
