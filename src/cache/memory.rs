//! Memory Tier - In-Process Hot Cache
//!
//! Lowest-latency tier, bounded by both a key cap and a byte cap.
//!
//! # Design
//!
//! - `DashMap` storage for sharded concurrent access
//! - Expired entries are dropped lazily on read and by a periodic sweep
//! - When either cap is exceeded, entries are evicted by recency/frequency
//!   score (age / (accesses + 1)) until both are under the low watermark

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::entry::CacheEntry;
use super::tier::{CacheTier, CacheTierStats, TierCounters};
use crate::config::duration_serde;
use crate::error::Result;
use crate::scheduler::ScheduledTask;

/// Memory tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    /// Probe priority (lower = checked first)
    pub priority: u32,
    /// Maximum number of keys
    pub max_keys: usize,
    /// Maximum total payload size in bytes
    pub max_size_bytes: u64,
    /// Fraction of each cap to evict down to once a cap is exceeded
    pub low_watermark: f64,
    /// Interval between expiry sweeps
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            priority: 1,
            max_keys: 10_000,
            max_size_bytes: 256 * 1024 * 1024, // 256MB
            low_watermark: 0.90,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct MemoryEntry {
    entry: CacheEntry,
    expires_at: Option<Instant>,
    last_access: Instant,
    access_count: u64,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Higher = more evictable
    fn eviction_score(&self, now: Instant) -> f64 {
        if self.is_expired(now) {
            return f64::MAX;
        }
        let age = now.saturating_duration_since(self.last_access).as_secs_f64();
        age / (self.access_count as f64 + 1.0)
    }
}

/// In-process memory tier
pub struct MemoryTier {
    name: String,
    storage: DashMap<String, MemoryEntry>,
    config: MemoryTierConfig,
    current_size: AtomicU64,
    evictions: AtomicU64,
    counters: TierCounters,
}

impl MemoryTier {
    /// Create a memory tier with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryTierConfig::default())
    }

    /// Create a memory tier with custom configuration
    pub fn with_config(config: MemoryTierConfig) -> Self {
        Self::named("memory", config)
    }

    /// Create a memory tier with a custom name
    pub fn named(name: impl Into<String>, config: MemoryTierConfig) -> Self {
        let name = name.into();
        Self {
            counters: TierCounters::new(name.clone()),
            name,
            storage: DashMap::new(),
            config,
            current_size: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of stored entries (including not yet swept expired ones)
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Current payload size in bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Entries removed by capacity eviction
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .storage
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.remove_entry(&key, |e| e.is_expired(now)) {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Memory tier '{}' swept {} expired entries", self.name, removed);
        }
        removed
    }

    /// Start the periodic expiry sweep
    pub fn start_sweeper(self: &Arc<Self>) -> ScheduledTask {
        let tier = Arc::clone(self);
        ScheduledTask::spawn(
            format!("{}-sweeper", self.name),
            self.config.sweep_interval,
            move || {
                let tier = tier.clone();
                async move {
                    tier.sweep_expired();
                }
            },
        )
    }

    fn remove_entry(&self, key: &str, predicate: impl FnOnce(&MemoryEntry) -> bool) -> bool {
        match self.storage.remove_if(key, |_, e| predicate(e)) {
            Some((_, removed)) => {
                self.current_size
                    .fetch_sub(removed.entry.size(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn over_capacity(&self) -> bool {
        self.storage.len() > self.config.max_keys || self.size() > self.config.max_size_bytes
    }

    fn above_low_watermark(&self) -> bool {
        let key_floor = (self.config.max_keys as f64 * self.config.low_watermark) as usize;
        let size_floor = (self.config.max_size_bytes as f64 * self.config.low_watermark) as u64;
        self.storage.len() > key_floor || self.size() > size_floor
    }

    /// Evict until both caps are under the low watermark, sparing `keep`
    fn evict(&self, keep: &str) {
        let now = Instant::now();
        let mut candidates: Vec<(String, f64)> = self
            .storage
            .iter()
            .filter(|e| e.key() != keep)
            .map(|e| (e.key().clone(), e.value().eviction_score(now)))
            .collect();

        // Highest score first = most evictable
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = 0;
        for (key, _) in candidates {
            if !self.above_low_watermark() {
                break;
            }
            if self.remove_entry(&key, |_| true) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            }
        }

        debug!(
            "Memory tier '{}' evicted {} entries ({} keys, {} bytes remain)",
            self.name,
            evicted,
            self.storage.len(),
            self.size()
        );
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.config.priority
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = Instant::now();

        let found = match self.storage.get_mut(key) {
            Some(mut e) if !e.is_expired(now) => {
                e.last_access = now;
                e.access_count += 1;
                Some(e.entry.clone())
            }
            Some(_) => None,
            None => {
                self.counters.record_miss();
                return Ok(None);
            }
        };

        match found {
            Some(entry) => {
                self.counters.record_hit();
                Ok(Some(entry))
            }
            None => {
                // Expired: drop it now rather than waiting for the sweep
                self.remove_entry(key, |e| e.is_expired(now));
                self.counters.record_miss();
                Ok(None)
            }
        }
    }

    async fn peek(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = Instant::now();
        Ok(self
            .storage
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.entry.clone()))
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Option<Duration>) -> Result<()> {
        let size = entry.size();
        if size > self.config.max_size_bytes {
            debug!(
                "Memory tier '{}' skipping {} ({} bytes exceeds capacity)",
                self.name, key, size
            );
            return Ok(());
        }

        let now = Instant::now();
        let record = MemoryEntry {
            entry: entry.clone(),
            expires_at: ttl.map(|ttl| now + ttl),
            last_access: now,
            access_count: 0,
        };

        match self.storage.insert(key.to_string(), record) {
            Some(old) => {
                let old_size = old.entry.size();
                if size > old_size {
                    self.current_size
                        .fetch_add(size - old_size, Ordering::Relaxed);
                } else {
                    self.current_size
                        .fetch_sub(old_size - size, Ordering::Relaxed);
                }
            }
            None => {
                self.current_size.fetch_add(size, Ordering::Relaxed);
            }
        }

        if self.over_capacity() {
            self.evict(key);
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.remove_entry(key, |_| true))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .storage
            .get(key)
            .is_some_and(|e| !e.is_expired(now)))
    }

    async fn clear(&self) -> Result<()> {
        self.storage.clear();
        self.current_size.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self) -> CacheTierStats {
        self.counters.snapshot(self.storage.len() as u64)
    }

    fn reset_stats(&self) {
        self.counters.reset();
    }
}

// =============================================================================
// Tests
// =============================================================================
