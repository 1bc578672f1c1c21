//! Generated-path cache with a 24-hour validity window, and per-student
//! single-flight generation.

mod flight;
mod manager;

pub use flight::{GenerationGuard, GenerationLocks};
pub use manager::{CacheStats, PathCacheManager};
