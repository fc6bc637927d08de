//! morphcache - Caching and Resilience Core
//!
//! The caching and resilience layer of a resource-transformation proxy
//! (images, stylesheets, scripts, documents). Transformed artifacts are
//! expensive to produce, so they are served from an ordered stack of cache
//! tiers and produced at most once per key when every tier misses.
//!
//! # Architecture
//!
//! ```text
//!                    ┌────────────────────────┐
//!  request ────────▶ │    ArtifactPipeline    │
//!                    └───────────┬────────────┘
//!               lookup           │ miss
//!          ┌─────────────────────┼──────────────────────┐
//!          ▼                     ▼                      ▼
//!  ┌───────────────┐   ┌──────────────────┐   ┌──────────────────┐
//!  │ MultiTierCache│   │ RequestCoalescer │──▶│  CircuitBreaker  │──▶ producer
//!  │ memory/redis/ │   │  (single-flight) │   │                  │
//!  │  filesystem   │   └──────────────────┘   └──────────────────┘
//!  └───────┬───────┘
//!          │ filesystem tier
//!          ▼
//!  ┌───────────────┐   ┌──────────────────┐
//!  │StorageMonitor │──▶│  EvictionEngine  │
//!  └───────────────┘   └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Key strategy, cache tiers and the multi-tier orchestrator
//! - [`config`] - YAML configuration and duration parsing
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus counters
//! - [`pipeline`] - Cache-or-produce serve path and component assembly
//! - [`resilience`] - Circuit breaker and request coalescer
//! - [`scheduler`] - Cancellable interval tasks
//! - [`storage`] - Disk usage monitoring and eviction

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheKey, CacheTier, FilesystemTier, KeyStrategy, MemoryTier, MultiTierCache,
    Params, RedisTier,
};
pub use config::CoreConfig;
pub use error::{Error, Result};
pub use pipeline::{Artifact, ArtifactPipeline, CacheCore, Served};
pub use resilience::{CircuitBreaker, CircuitState, RequestCoalescer};
pub use scheduler::ScheduledTask;
pub use storage::{EvictionEngine, StorageMonitor, StorageStatus};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
