//! Metrics collection for the governance components.
//!
//! Built-in atomic metrics for local tracking; a [`MetricsSummary`] snapshot
//! can be serialized for export by the surrounding application.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::cost::{cost_from_micros, cost_to_micros};

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Simple histogram using fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets sized for upstream generation calls, which run for seconds.
    pub fn default_latency() -> Self {
        Self::new(vec![
            100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the sum in the original unit (ms). The internal sum is scaled
    /// by 1000x to keep sub-millisecond precision.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Governance metrics registry shared by the governor, cache manager,
/// reconciler and cost tracker.
#[derive(Debug)]
pub struct GovernanceMetrics {
    pub admissions_allowed: Counter,
    pub admissions_denied: Counter,
    pub admissions_degraded: Counter,
    pub reservations_released: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_supersessions: Counter,
    pub cache_invalidations: Counter,
    pub cache_expirations: Counter,
    pub generations: Counter,
    pub generations_coalesced: Counter,
    pub generation_lock_timeouts: Counter,
    pub upstream_failures: Counter,
    pub reconcile_runs: Counter,
    pub reconcile_deferred: Counter,
    pub reconcile_pending: Gauge,
    pub cost_total_micros: Counter,
    pub generation_latency_ms: Histogram,
}

impl GovernanceMetrics {
    pub fn new() -> Self {
        Self {
            admissions_allowed: Counter::new(),
            admissions_denied: Counter::new(),
            admissions_degraded: Counter::new(),
            reservations_released: Counter::new(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            cache_supersessions: Counter::new(),
            cache_invalidations: Counter::new(),
            cache_expirations: Counter::new(),
            generations: Counter::new(),
            generations_coalesced: Counter::new(),
            generation_lock_timeouts: Counter::new(),
            upstream_failures: Counter::new(),
            reconcile_runs: Counter::new(),
            reconcile_deferred: Counter::new(),
            reconcile_pending: Gauge::new(),
            cost_total_micros: Counter::new(),
            generation_latency_ms: Histogram::default_latency(),
        }
    }

    pub fn record_admission(&self, allowed: bool, degraded: bool) {
        if allowed {
            self.admissions_allowed.inc();
        } else {
            self.admissions_denied.inc();
        }
        if degraded {
            self.admissions_degraded.inc();
        }
    }

    pub fn record_generation(&self, success: bool, latency_ms: f64) {
        self.generation_latency_ms.observe(latency_ms);
        if success {
            self.generations.inc();
        } else {
            self.upstream_failures.inc();
        }
    }

    pub fn record_cost(&self, cost_usd: Decimal) {
        self.cost_total_micros.add(cost_to_micros(cost_usd));
    }

    pub fn total_cost_usd(&self) -> Decimal {
        cost_from_micros(self.cost_total_micros.get())
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.get();
        let total = hits + self.cache_misses.get();
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self)
    }
}

impl Default for GovernanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of [`GovernanceMetrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub admissions_allowed: u64,
    pub admissions_denied: u64,
    pub admissions_degraded: u64,
    pub reservations_released: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub generations: u64,
    pub generations_coalesced: u64,
    pub upstream_failures: u64,
    pub reconcile_deferred: u64,
    pub reconcile_pending: i64,
    pub total_cost_usd: Decimal,
    pub avg_generation_latency_ms: f64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &GovernanceMetrics) -> Self {
        let count = registry.generation_latency_ms.count();
        let avg_latency = if count > 0 {
            registry.generation_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        Self {
            admissions_allowed: registry.admissions_allowed.get(),
            admissions_denied: registry.admissions_denied.get(),
            admissions_degraded: registry.admissions_degraded.get(),
            reservations_released: registry.reservations_released.get(),
            cache_hits: registry.cache_hits.get(),
            cache_misses: registry.cache_misses.get(),
            cache_hit_rate: registry.cache_hit_rate(),
            generations: registry.generations.get(),
            generations_coalesced: registry.generations_coalesced.get(),
            upstream_failures: registry.upstream_failures.get(),
            reconcile_deferred: registry.reconcile_deferred.get(),
            reconcile_pending: registry.reconcile_pending.get(),
            total_cost_usd: registry.total_cost_usd(),
            avg_generation_latency_ms: avg_latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.set(10);
        gauge.inc();
        assert_eq!(gauge.get(), 11);
        gauge.dec();
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![10.0, 50.0, 100.0]);
        hist.observe(5.0);
        hist.observe(25.0);
        hist.observe(75.0);
        hist.observe(150.0);
        assert_eq!(hist.count(), 4);
        assert_eq!(hist.bucket_counts(), vec![1, 1, 1, 1]);
        assert!((hist.sum_ms() - 255.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary() {
        let metrics = GovernanceMetrics::new();
        metrics.record_admission(true, false);
        metrics.record_admission(false, true);
        metrics.cache_hits.inc();
        metrics.cache_misses.add(3);
        metrics.record_generation(true, 1200.0);
        metrics.record_cost(dec!(0.0125));

        let summary = metrics.summary();
        assert_eq!(summary.admissions_allowed, 1);
        assert_eq!(summary.admissions_denied, 1);
        assert_eq!(summary.admissions_degraded, 1);
        assert_eq!(summary.cache_hit_rate, 0.25);
        assert_eq!(summary.generations, 1);
        assert_eq!(summary.total_cost_usd, dec!(0.0125));
        assert_eq!(summary.avg_generation_latency_ms, 1200.0);
    }
}
