//! Running cost totals per student and month.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;

use super::breakdown::{CostBreakdown, Period};
use super::{cost_from_micros, cost_to_micros};
use crate::config::CostConfig;
use crate::domain::{Clock, Feature, MonthKey, StudentId, TokenUsage};
use crate::observability::GovernanceMetrics;
use crate::store::{Persistence, StoreResult, UsageEvent};

/// Records one usage event per completed upstream call and keeps running
/// per-student monthly totals in scaled atomic counters.
///
/// Totals cover calls recorded by this process for the current and the
/// previous month; older months are pruned when a new month's first call is
/// recorded. [`CostTracker::get_breakdown`] reads the durable event log and
/// is authoritative.
pub struct CostTracker {
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    config: CostConfig,
    totals: DashMap<(StudentId, MonthKey), AtomicU64>,
    alerted: DashSet<(StudentId, MonthKey)>,
    newest_month: AtomicI64,
    metrics: Arc<GovernanceMetrics>,
}

impl CostTracker {
    pub fn new(
        store: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        config: CostConfig,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            totals: DashMap::new(),
            alerted: DashSet::new(),
            newest_month: AtomicI64::new(i64::MIN),
            metrics,
        }
    }

    /// Append a usage event and fold its cost into the running total.
    ///
    /// The running total is updated even when the durable append fails: the
    /// upstream spend already happened.
    pub async fn record(
        &self,
        student_id: &StudentId,
        feature: Feature,
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: Decimal,
    ) -> StoreResult<UsageEvent> {
        let now = self.clock.now();
        let event = UsageEvent::new(
            student_id.clone(),
            feature,
            now,
            tokens_in,
            tokens_out,
            cost_usd,
        );

        let month = MonthKey::of(now);
        self.prune_on_rollover(month);
        let micros = cost_to_micros(cost_usd);
        let total = {
            let counter = self
                .totals
                .entry((student_id.clone(), month))
                .or_insert_with(|| AtomicU64::new(0));
            counter.fetch_add(micros, Ordering::Relaxed) + micros
        };
        self.metrics.record_cost(cost_usd);
        self.check_student_threshold(student_id, month, cost_from_micros(total));

        if let Err(e) = self.store.append_usage_event(&event).await {
            tracing::error!(
                student_id = %student_id,
                feature = %feature,
                event_id = %event.event_id,
                error = %e,
                "Failed to persist usage event"
            );
            return Err(e);
        }

        tracing::debug!(
            student_id = %student_id,
            feature = %feature,
            tokens_in,
            tokens_out,
            cost_usd = %cost_usd,
            "Recorded usage event"
        );
        Ok(event)
    }

    pub async fn record_usage(
        &self,
        student_id: &StudentId,
        feature: Feature,
        usage: &TokenUsage,
    ) -> StoreResult<UsageEvent> {
        self.record(
            student_id,
            feature,
            usage.tokens_in,
            usage.tokens_out,
            usage.cost_usd,
        )
        .await
    }

    pub fn monthly_total(&self, student_id: &StudentId, month: MonthKey) -> Decimal {
        self.totals
            .get(&(student_id.clone(), month))
            .map(|v| cost_from_micros(v.load(Ordering::Relaxed)))
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn get_breakdown(&self, period: Period) -> StoreResult<CostBreakdown> {
        let events = if period.is_empty() {
            Vec::new()
        } else {
            self.store.usage_events(period.start, period.end).await?
        };
        Ok(CostBreakdown::from_events(period, &events, &self.config))
    }

    /// Drop running totals and alert marks for months before `cutoff`.
    pub fn prune_before(&self, cutoff: MonthKey) -> usize {
        let before = self.totals.len();
        self.totals.retain(|(_, month), _| *month >= cutoff);
        self.alerted.retain(|(_, month)| *month >= cutoff);
        before - self.totals.len()
    }

    /// Number of (student, month) running totals held in memory.
    pub fn tracked_totals(&self) -> usize {
        self.totals.len()
    }

    fn prune_on_rollover(&self, month: MonthKey) {
        let ordinal = month.ordinal();
        if self.newest_month.fetch_max(ordinal, Ordering::AcqRel) >= ordinal {
            return;
        }
        let pruned = self.prune_before(month.previous());
        if pruned > 0 {
            tracing::debug!(month = %month, pruned, "Pruned cost totals of closed months");
        }
    }

    fn check_student_threshold(&self, student_id: &StudentId, month: MonthKey, total: Decimal) {
        let Some(threshold) = self.config.student_monthly_alert_usd else {
            return;
        };
        if total > threshold && self.alerted.insert((student_id.clone(), month)) {
            tracing::warn!(
                student_id = %student_id,
                month = %month,
                total_usd = %total,
                threshold_usd = %threshold,
                "Student monthly cost crossed alert threshold"
            );
        }
    }

    #[cfg(test)]
    fn alerted(&self, student_id: &StudentId, month: MonthKey) -> bool {
        self.alerted.contains(&(student_id.clone(), month))
    }
}
