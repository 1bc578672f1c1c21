//! # pathgate
//!
//! Usage governance for AI-backed learning features: monthly per-student
//! quotas, a 24-hour path cache with single-flight generation, and cost
//! accounting for every upstream call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pathgate::collaborators::{
//!     GeneratedPath, InMemoryContextSource, PathGenerator, StudentContext, UpstreamResult,
//! };
//! use pathgate::{GovernanceConfig, MeteredService, StudentId, TokenUsage};
//!
//! struct Recommender;
//!
//! #[async_trait::async_trait]
//! impl PathGenerator for Recommender {
//!     async fn generate(&self, _context: &StudentContext) -> UpstreamResult<GeneratedPath> {
//!         Ok(GeneratedPath {
//!             recommendations: serde_json::json!(["fractions-2"]),
//!             reasoning: "next unit in sequence".into(),
//!             usage: TokenUsage::default(),
//!             confidence: Some(0.9),
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pathgate::Error> {
//!     let contexts = Arc::new(InMemoryContextSource::new());
//!     let student = StudentId::new("stu-42");
//!     contexts.insert(StudentContext::new(student.clone()).with_completed(["fractions-1"]));
//!
//!     let service = MeteredService::builder(GovernanceConfig::default())
//!         .generator(Arc::new(Recommender))
//!         .context_source(contexts)
//!         .build()?;
//!
//!     let outcome = service.generate_path(&student, false).await?;
//!     println!("{} ({:?})", outcome.entry.path_id, outcome.source);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod cost;
pub mod counter;
pub mod domain;
pub mod observability;
pub mod quota;
pub mod resilience;
pub mod service;
pub mod store;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use cache::{CacheStats, GenerationGuard, GenerationLocks, PathCacheManager};
pub use collaborators::{
    ContextSource, GeneratedPath, GradedAnswer, Grader, GradingRequest, PathGenerator,
    StudentContext, UpstreamError,
};
pub use config::{ConfigError, DegradedPolicy, GovernanceConfig};
pub use cost::{AlertScope, CostBreakdown, CostTracker, Period, ThresholdAlert};
pub use counter::{AdmissionDecision, CounterBackend, CounterError, MemoryCounter, VolatileCounter};
#[cfg(feature = "redis-backend")]
pub use counter::{RedisConfig, RedisCounter};
pub use domain::{
    Clock, Feature, ManualClock, MonthKey, PathId, QuotaKey, StudentId, SystemClock, TokenUsage,
};
pub use observability::{GovernanceMetrics, MetricsSummary};
pub use quota::{
    FeatureQuota, QuotaGovernor, QuotaStatus, QuotaSummary, ReconcileQueue, ReconcileReport,
    Reconciler, Reservation,
};
pub use service::{
    GradingOutcome, MeteredService, MeteredServiceBuilder, PathOutcome, PathSource,
};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresPersistence};
pub use store::{
    CacheEntry, CacheStatus, MemoryPersistence, Persistence, QuotaRecord, StoreError, UsageEvent,
};

/// Error type for governed operations.
///
/// Every variant carries enough context to tell the caller what happened
/// and when, if ever, retrying makes sense.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Monthly quota for the feature is used up.
    #[error("Quota exceeded for {feature}: {used}/{limit} used, resets at {reset_at}")]
    QuotaExceeded {
        feature: Feature,
        used: u32,
        limit: u32,
        reset_at: DateTime<Utc>,
    },

    /// Another generation for the same student is still running.
    #[error("Generation already in progress for {student_id}, retry in {:.0}s", retry_after.as_secs_f64())]
    GenerationInProgress {
        student_id: StudentId,
        retry_after: Duration,
    },

    /// The upstream service failed after local retries.
    #[error("Upstream failure after {attempts} attempt(s): {message}")]
    UpstreamFailure { message: String, attempts: u32 },

    /// Not enough learning history to produce a meaningful result.
    #[error("Insufficient data: {reason}")]
    InsufficientData { reason: String },

    /// Durable store unreachable.
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] store::StoreError),

    /// Volatile counter unreachable and no degraded admission possible.
    #[error("Quota counter unavailable: {0}")]
    CounterUnavailable(#[from] counter::CounterError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Coarse error kind for callers that map errors onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    QuotaExceeded,
    InProgress,
    UpstreamFailure,
    InsufficientData,
    PersistenceUnavailable,
    Configuration,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Error::GenerationInProgress { .. } => ErrorKind::InProgress,
            Error::UpstreamFailure { .. } => ErrorKind::UpstreamFailure,
            Error::InsufficientData { .. } => ErrorKind::InsufficientData,
            Error::PersistenceUnavailable(_) | Error::CounterUnavailable(_) => {
                ErrorKind::PersistenceUnavailable
            }
            Error::Config(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InProgress | ErrorKind::UpstreamFailure | ErrorKind::PersistenceUnavailable
        )
    }

    /// How long to wait before retrying, when that is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::GenerationInProgress { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// When a quota-exceeded request can next succeed.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::QuotaExceeded { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }

    /// Short, user-facing guidance.
    pub fn guidance(&self) -> String {
        match self {
            Error::QuotaExceeded { reset_at, .. } => format!(
                "Monthly limit reached. It resets on {}.",
                reset_at.format("%Y-%m-%d")
            ),
            Error::GenerationInProgress { retry_after, .. } => format!(
                "A path is already being prepared. Try again in {} seconds.",
                retry_after.as_secs().max(1)
            ),
            Error::UpstreamFailure { .. } => {
                "The service is temporarily unavailable. No quota was used; please try again."
                    .to_string()
            }
            Error::InsufficientData { .. } => {
                "Complete a few more activities before requesting a personalized path.".to_string()
            }
            Error::PersistenceUnavailable(_) | Error::CounterUnavailable(_) => {
                "The service is temporarily unavailable. Please try again shortly.".to_string()
            }
            Error::Config(_) => "The service is misconfigured.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
