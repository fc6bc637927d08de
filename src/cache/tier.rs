//! Cache Tier Contract
//!
//! Uniform async interface implemented by every backing store. Each tier
//! owns its medium and may fail independently; the orchestrator turns tier
//! errors into misses/no-ops and never surfaces them to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::entry::CacheEntry;
use crate::error::Result;
use crate::metrics;

/// One backing store in the cache hierarchy
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Tier name used in logs and stats
    fn name(&self) -> &str;

    /// Probe order; lower values are checked first
    fn priority(&self) -> u32;

    /// Get an entry
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Read an entry for internal copying: no hit/miss counting and no
    /// access bookkeeping
    async fn peek(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous value
    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Option<Duration>) -> Result<()>;

    /// Delete an entry, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check whether a live entry exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every entry owned by this tier
    async fn clear(&self) -> Result<()>;

    /// Current statistics
    async fn stats(&self) -> CacheTierStats;

    /// Reset hit/miss/error counters
    fn reset_stats(&self);
}

/// Per-tier statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheTierStats {
    /// Lookups that returned a value
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Live keys held by the tier (best effort for remote media)
    pub key_count: u64,
    /// hits / (hits + misses), 0.0 when idle
    pub hit_rate: f64,
    /// Operations that failed
    pub error_count: u64,
}

/// Atomic hit/miss/error counters shared by tier implementations
#[derive(Debug)]
pub struct TierCounters {
    tier: String,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl TierCounters {
    /// Create counters for the named tier
    pub fn new(tier: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_tier_op(&self.tier, "get", "hit");
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_tier_op(&self.tier, "get", "miss");
    }

    pub fn record_error(&self, op: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_tier_op(&self.tier, op, "error");
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Build a stats snapshot with the given key count
    pub fn snapshot(&self, key_count: u64) -> CacheTierStats {
        let hits = self.hits();
        let misses = self.misses();
        CacheTierStats {
            hits,
            misses,
            key_count,
            hit_rate: hit_rate(hits, misses),
            error_count: self.errors(),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// hits / (hits + misses), 0.0 when there were no lookups
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
