//! The metered service: the operations exposed to the surrounding
//! application, wiring quota, cache, generation lock and cost tracking.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStats, GenerationGuard, GenerationLocks, PathCacheManager};
use crate::collaborators::{
    ContextSource, GeneratedPath, GradedAnswer, Grader, GradingRequest, PathGenerator,
    StudentContext, UpstreamError, UpstreamResult,
};
use crate::config::{ConfigError, GovernanceConfig, UpstreamConfig};
use crate::cost::{CostBreakdown, CostTracker, Period};
use crate::counter::{CounterBackend, MemoryCounter, VolatileCounter};
use crate::domain::{Clock, Feature, MonthKey, StudentId, SystemClock};
use crate::observability::GovernanceMetrics;
use crate::quota::{QuotaGovernor, QuotaStatus, QuotaSummary, ReconcileQueue, Reconciler, Reservation};
use crate::resilience::with_retry;
use crate::store::{CacheEntry, MemoryPersistence, Persistence};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSource {
    /// Live cache entry; no upstream call and no quota.
    Cached,
    /// Generated by this request.
    Generated,
    /// Produced by a concurrent request this one waited for.
    Coalesced,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PathOutcome {
    pub entry: CacheEntry,
    pub source: PathSource,
    /// Whether `entry` is stored as the student's active entry.
    pub cached: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GradingOutcome {
    pub answer: GradedAnswer,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

struct Inner {
    config: GovernanceConfig,
    clock: Arc<dyn Clock>,
    governor: QuotaGovernor,
    reconciler: Arc<Reconciler>,
    cache: PathCacheManager,
    locks: GenerationLocks,
    cost: CostTracker,
    generator: Arc<dyn PathGenerator>,
    grader: Option<Arc<dyn Grader>>,
    contexts: Arc<dyn ContextSource>,
    metrics: Arc<GovernanceMetrics>,
}

/// Cheaply cloneable handle to the governed operations.
#[derive(Clone)]
pub struct MeteredService {
    inner: Arc<Inner>,
}

pub struct MeteredServiceBuilder {
    config: GovernanceConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn Persistence>>,
    counter: Option<Arc<dyn CounterBackend>>,
    generator: Option<Arc<dyn PathGenerator>>,
    grader: Option<Arc<dyn Grader>>,
    contexts: Option<Arc<dyn ContextSource>>,
    metrics: Option<Arc<GovernanceMetrics>>,
}

impl MeteredServiceBuilder {
    fn new(config: GovernanceConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            counter: None,
            generator: None,
            grader: None,
            contexts: None,
            metrics: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Durable store. Defaults to [`MemoryPersistence`].
    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Volatile counter backend. Defaults to [`MemoryCounter`].
    pub fn counter_backend(mut self, counter: Arc<dyn CounterBackend>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn PathGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn grader(mut self, grader: Arc<dyn Grader>) -> Self {
        self.grader = Some(grader);
        self
    }

    pub fn context_source(mut self, contexts: Arc<dyn ContextSource>) -> Self {
        self.contexts = Some(contexts);
        self
    }

    pub fn metrics(mut self, metrics: Arc<GovernanceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<MeteredService> {
        self.config.validate()?;

        let generator = self.generator.ok_or_else(|| missing("generator"))?;
        let contexts = self.contexts.ok_or_else(|| missing("context_source"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryPersistence::new()));
        let backend = self
            .counter
            .unwrap_or_else(|| Arc::new(MemoryCounter::new(clock.clone())));
        let metrics = self.metrics.unwrap_or_default();
        let counter_name = backend.name().to_string();
        let config = self.config;

        let counter = VolatileCounter::new(backend, clock.clone(), config.quota.clone());
        let queue = Arc::new(ReconcileQueue::new());
        let governor = QuotaGovernor::new(
            counter.clone(),
            store.clone(),
            clock.clone(),
            config.quota.clone(),
            queue.clone(),
            metrics.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            counter,
            store.clone(),
            clock.clone(),
            config.quota.clone(),
            queue,
            metrics.clone(),
        ));
        let cache = PathCacheManager::new(
            store.clone(),
            clock.clone(),
            config.paths.ttl(),
            metrics.clone(),
        );
        let locks = GenerationLocks::new(config.paths.generation_wait());
        let cost = CostTracker::new(store.clone(), clock.clone(), config.cost.clone(), metrics.clone());

        tracing::info!(
            store = store.name(),
            counter = %counter_name,
            path_limit = config.quota.limit_for(Feature::PathGeneration),
            grading_limit = config.quota.limit_for(Feature::OpenAnswerGrading),
            "Metered service initialized"
        );

        Ok(MeteredService {
            inner: Arc::new(Inner {
                config,
                clock,
                governor,
                reconciler,
                cache,
                locks,
                cost,
                generator,
                grader: self.grader,
                contexts,
                metrics,
            }),
        })
    }
}

fn missing(key: &str) -> Error {
    Error::Config(ConfigError::InvalidValue {
        key: key.to_string(),
        message: "required collaborator not provided".to_string(),
    })
}

impl MeteredService {
    pub fn builder(config: GovernanceConfig) -> MeteredServiceBuilder {
        MeteredServiceBuilder::new(config)
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.inner.config
    }

    pub fn governor(&self) -> &QuotaGovernor {
        &self.inner.governor
    }

    pub fn cache(&self) -> &PathCacheManager {
        &self.inner.cache
    }

    pub fn cost_tracker(&self) -> &CostTracker {
        &self.inner.cost
    }

    pub fn metrics(&self) -> &Arc<GovernanceMetrics> {
        &self.inner.metrics
    }

    /// Durable usage for the current month, reconciled on read.
    pub async fn quota_summary(&self, student_id: &StudentId) -> Result<QuotaSummary> {
        self.inner.governor.get_summary(student_id).await
    }

    /// Real-time usage from the volatile counter.
    pub async fn quota_status(&self, student_id: &StudentId) -> Result<QuotaStatus> {
        self.inner.governor.get_status(student_id).await
    }

    /// Return the student's learning path, generating one when there is no
    /// live cached path or when `force_refresh` is set.
    ///
    /// Quota is only consumed when an upstream generation completes.
    pub async fn generate_path(
        &self,
        student_id: &StudentId,
        force_refresh: bool,
    ) -> Result<PathOutcome> {
        let inner = &self.inner;

        // A forced refresh must not be satisfied by the path it is replacing.
        let replacing = if force_refresh {
            inner.cache.peek(student_id).await?.map(|e| e.path_id)
        } else if let Some(entry) = inner.cache.get(student_id).await? {
            return Ok(PathOutcome {
                entry,
                source: PathSource::Cached,
                cached: true,
            });
        } else {
            None
        };

        let guard = match inner.locks.acquire(student_id).await {
            Ok(guard) => guard,
            Err(e) => {
                inner.metrics.generation_lock_timeouts.inc();
                return Err(e);
            }
        };

        // Someone may have generated while we waited. Peek, so the miss
        // that brought us here is not counted twice.
        if let Some(entry) = inner.cache.peek(student_id).await?
            && Some(entry.path_id) != replacing
        {
            inner.metrics.generations_coalesced.inc();
            tracing::debug!(
                student_id = %student_id,
                path_id = %entry.path_id,
                "Coalesced with concurrent generation"
            );
            return Ok(PathOutcome {
                entry,
                source: PathSource::Coalesced,
                cached: true,
            });
        }

        let context = self.load_context(student_id).await?;
        let reservation = inner.governor.admit(student_id, Feature::PathGeneration).await?;

        // The task owns the lock and the reservation, so a dropped caller
        // never cancels a dispatched upstream call or leaks quota.
        let task = tokio::spawn(Self::run_generation(
            Arc::clone(&self.inner),
            guard,
            context,
            reservation,
            force_refresh,
        ));
        task.await.map_err(|e| Error::UpstreamFailure {
            message: format!("generation task aborted: {}", e),
            attempts: 0,
        })?
    }

    async fn load_context(&self, student_id: &StudentId) -> Result<StudentContext> {
        let min_items = self.inner.config.paths.min_history_items as usize;
        let context = self
            .inner
            .contexts
            .load(student_id)
            .await
            .map_err(|e| upstream_error(e, 1))?;

        match context {
            Some(context) if context.history_len() >= min_items => Ok(context),
            Some(context) => Err(Error::InsufficientData {
                reason: format!(
                    "{} completed item(s), at least {} required",
                    context.history_len(),
                    min_items
                ),
            }),
            None => Err(Error::InsufficientData {
                reason: "no learning history".to_string(),
            }),
        }
    }

    async fn run_generation(
        inner: Arc<Inner>,
        guard: GenerationGuard,
        context: StudentContext,
        reservation: Reservation,
        force_refresh: bool,
    ) -> Result<PathOutcome> {
        let student_id = guard.student_id().clone();
        let started = Instant::now();
        let generator = Arc::clone(&inner.generator);

        let result = call_upstream(&inner.config.upstream, || generator.generate(&context)).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let path = match result {
            Ok(path) => path,
            Err(retried) => {
                inner.metrics.record_generation(false, latency_ms);
                inner.governor.release(reservation).await;
                tracing::warn!(
                    student_id = %student_id,
                    attempts = retried.attempts,
                    error = %retried.value,
                    "Path generation failed; reservation released"
                );
                return Err(upstream_error(retried.value, retried.attempts));
            }
        };
        inner.metrics.record_generation(true, latency_ms);

        let (entry, cached) = Self::store_path(&inner, &student_id, &path).await;
        inner.governor.commit(reservation);
        if let Err(e) = inner
            .cost
            .record_usage(&student_id, Feature::PathGeneration, &path.usage)
            .await
        {
            tracing::error!(student_id = %student_id, error = %e, "Usage event not persisted");
        }
        drop(guard);

        tracing::info!(
            student_id = %student_id,
            path_id = %entry.path_id,
            cached,
            force_refresh,
            latency_ms,
            "Generated learning path"
        );
        Ok(PathOutcome {
            entry,
            source: PathSource::Generated,
            cached,
        })
    }

    /// Cache the path unless its confidence is below the configured floor.
    /// A failed store write still returns the path, uncached.
    async fn store_path(
        inner: &Inner,
        student_id: &StudentId,
        path: &GeneratedPath,
    ) -> (CacheEntry, bool) {
        let below_floor = match (inner.config.paths.min_confidence, path.confidence) {
            (Some(floor), Some(confidence)) => confidence < floor,
            _ => false,
        };

        if !below_floor {
            match inner.cache.put(student_id, path).await {
                Ok(entry) => return (entry, true),
                Err(e) => tracing::error!(
                    student_id = %student_id,
                    error = %e,
                    "Failed to cache generated path; returning it uncached"
                ),
            }
        } else {
            tracing::info!(
                student_id = %student_id,
                confidence = path.confidence,
                "Generated path below confidence floor; not cached"
            );
        }

        let entry = CacheEntry::active(
            student_id.clone(),
            inner.clock.now(),
            inner.cache.ttl(),
            path.recommendations.clone(),
            path.reasoning.clone(),
            path.usage.clone(),
        )
        .with_confidence(path.confidence);
        (entry, false)
    }

    /// Expire the student's cached path. `false` when there was none.
    pub async fn invalidate_path(&self, student_id: &StudentId) -> Result<bool> {
        Ok(self.inner.cache.invalidate(student_id).await?)
    }

    /// Grade an open answer against the student's grading quota.
    pub async fn submit_for_grading(
        &self,
        student_id: &StudentId,
        request: GradingRequest,
    ) -> Result<GradingOutcome> {
        let grader = self.inner.grader.clone().ok_or_else(|| missing("grader"))?;
        let reservation = self
            .inner
            .governor
            .admit(student_id, Feature::OpenAnswerGrading)
            .await?;

        let inner = Arc::clone(&self.inner);
        let student_id = student_id.clone();
        let task = tokio::spawn(async move {
            let result =
                call_upstream(&inner.config.upstream, || grader.grade(&student_id, &request))
                    .await;

            match result {
                Ok(answer) => {
                    let decision = reservation.decision().clone();
                    inner.governor.commit(reservation);
                    if let Err(e) = inner
                        .cost
                        .record_usage(&student_id, Feature::OpenAnswerGrading, &answer.usage)
                        .await
                    {
                        tracing::error!(student_id = %student_id, error = %e, "Usage event not persisted");
                    }
                    tracing::info!(
                        student_id = %student_id,
                        question_id = %request.question_id,
                        score = answer.score,
                        "Graded open answer"
                    );
                    Ok(GradingOutcome {
                        answer,
                        used: decision.used,
                        limit: decision.limit,
                        remaining: decision.limit.saturating_sub(decision.used),
                    })
                }
                Err(retried) => {
                    inner.governor.release(reservation).await;
                    tracing::warn!(
                        student_id = %student_id,
                        attempts = retried.attempts,
                        error = %retried.value,
                        "Grading failed; reservation released"
                    );
                    Err(upstream_error(retried.value, retried.attempts))
                }
            }
        });

        task.await.map_err(|e| Error::UpstreamFailure {
            message: format!("grading task aborted: {}", e),
            attempts: 0,
        })?
    }

    pub async fn cost_breakdown(&self, period: Period) -> Result<CostBreakdown> {
        Ok(self.inner.cost.get_breakdown(period).await?)
    }

    /// Running total recorded by this process for the student's month.
    pub fn monthly_cost(&self, student_id: &StudentId, month: MonthKey) -> Decimal {
        self.inner.cost.monthly_total(student_id, month)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub async fn sweep_expired_paths(&self) -> Result<usize> {
        Ok(self.inner.cache.sweep_expired().await?)
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.inner.reconciler)
    }

    /// Run reconciliation on the configured interval until `shutdown` fires.
    pub fn spawn_reconciler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.reconciler()
            .spawn(self.inner.config.reconcile.interval(), shutdown)
    }
}

/// One upstream call with a per-attempt timeout and bounded retry.
async fn call_upstream<T, F, Fut>(
    upstream: &UpstreamConfig,
    operation: F,
) -> std::result::Result<T, crate::resilience::Retried<UpstreamError>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = UpstreamResult<T>>,
{
    let timeout = upstream.timeout();
    with_retry(
        upstream.max_retries,
        &upstream.backoff(),
        UpstreamError::is_retryable,
        || {
            let attempt = operation();
            async move {
                tokio::time::timeout(timeout, attempt)
                    .await
                    .unwrap_or(Err(UpstreamError::Timeout(timeout)))
            }
        },
    )
    .await
    .map(|r| r.value)
}

fn upstream_error(error: UpstreamError, attempts: u32) -> Error {
    match error {
        UpstreamError::InsufficientData(reason) => Error::InsufficientData { reason },
        other => Error::UpstreamFailure {
            message: other.to_string(),
            attempts,
        },
    }
}
