//! Observability for the governance subsystem.
//!
//! Logging goes through `tracing` with structured fields; no subscriber is
//! installed by the library. Counters live in [`GovernanceMetrics`].

mod metrics;

pub use metrics::{Counter, Gauge, GovernanceMetrics, Histogram, MetricsSummary};
