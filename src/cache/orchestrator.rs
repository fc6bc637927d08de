//! Multi-Tier Cache Orchestrator
//!
//! Composes the key strategy, an ordered set of [`CacheTier`]s and popularity
//! tracking into the single get/set/delete/exists/clear surface used by the
//! serve path.
//!
//! # Read path
//!
//! Tiers are probed one at a time in ascending priority. The first hit is
//! returned immediately and copied into every faster tier in the background
//! (backfill). A tier that fails is logged and treated as a miss. A key
//! missing from every tier is dropped from the namespace index.
//!
//! # Write path
//!
//! Writes fan out to all tiers concurrently and wait for every tier. A tier
//! failure is logged and reported in the [`SetOutcome`]; the write as a whole
//! never fails.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::entry::CacheEntry;
use super::index::NamespaceIndex;
use super::key::{CacheKey, KeyStrategy, Params};
use super::popularity::PopularityCounter;
use super::tier::{hit_rate, CacheTier, CacheTierStats};
use crate::config::{PreloadConfig, TtlConfig};
use crate::error::Result;
use crate::scheduler::ScheduledTask;

/// Format tag used by the typed helpers
const JSON_FORMAT: &str = "json";

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The cached entry
    pub entry: CacheEntry,
    /// Name of the tier that served the entry
    pub tier: String,
    /// Lookup latency
    pub latency: Duration,
}

/// Result of a fan-out write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOutcome {
    /// Tiers that stored the entry
    pub succeeded: Vec<String>,
    /// Tiers that failed to store it
    pub failed: Vec<String>,
}

impl SetOutcome {
    /// True when every tier stored the entry
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of one preload pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
    /// Popular keys examined
    pub considered: usize,
    /// Keys copied into at least one faster tier
    pub warmed: usize,
    /// Individual tier writes performed
    pub copies: usize,
    /// Keys whose copy failed in at least one tier
    pub failed: usize,
}

/// Stats of one tier inside an [`AggregateStats`] snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TierReport {
    pub name: String,
    pub priority: u32,
    #[serde(flatten)]
    pub stats: CacheTierStats,
}

/// Orchestrator-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    /// Per-tier stats in probe order
    pub tiers: Vec<TierReport>,
    /// Lookups served by any tier
    pub hits: u64,
    /// Lookups that missed every tier
    pub misses: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
    /// Share of all lookups served by each tier
    pub hit_rate_by_tier: BTreeMap<String, f64>,
    /// Keys tracked for preloading
    pub popular_keys: usize,
    /// Keys tracked for namespace invalidation
    pub indexed_keys: usize,
}

/// Multi-tier cache
pub struct MultiTierCache {
    /// Tiers in ascending priority
    tiers: Vec<Arc<dyn CacheTier>>,
    /// Hits attributed to the tier at the same index
    tier_hits: Vec<AtomicU64>,
    keys: KeyStrategy,
    popularity: PopularityCounter,
    ttl: TtlConfig,
    preload: PreloadConfig,
    /// namespace -> keys written or served through this instance
    namespace_index: NamespaceIndex,
    hits: AtomicU64,
    misses: AtomicU64,
    backfills: TaskTracker,
}

impl MultiTierCache {
    /// Create an orchestrator over `tiers` (any order; sorted by priority)
    pub fn new(mut tiers: Vec<Arc<dyn CacheTier>>, ttl: TtlConfig, preload: PreloadConfig) -> Self {
        tiers.sort_by_key(|t| t.priority());
        info!(
            "Multi-tier cache over [{}]",
            tiers
                .iter()
                .map(|t| t.name().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let namespace_index = NamespaceIndex::new(preload.index_capacity, preload.index_retain);
        Self {
            tier_hits: tiers.iter().map(|_| AtomicU64::new(0)).collect(),
            tiers,
            keys: KeyStrategy::new(),
            popularity: PopularityCounter::new(preload.popularity_capacity, preload.popularity_retain),
            ttl,
            preload,
            namespace_index,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            backfills: TaskTracker::new(),
        }
    }

    /// Tiers in probe order
    pub fn tiers(&self) -> &[Arc<dyn CacheTier>] {
        &self.tiers
    }

    /// Popularity counter
    pub fn popularity(&self) -> &PopularityCounter {
        &self.popularity
    }

    /// Number of keys tracked for namespace invalidation
    pub fn indexed_keys(&self) -> usize {
        self.namespace_index.len()
    }

    /// Key for `(namespace, identifier, params)`
    pub fn key_for(&self, namespace: &str, identifier: &str, params: Option<&Params>) -> CacheKey {
        self.keys.generate_key(namespace, identifier, params)
    }

    /// TTL applied when a write does not name one
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.ttl.ttl_for(namespace)
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Get an entry, reporting which tier served it
    #[instrument(skip(self, params), fields(key = tracing::field::Empty))]
    pub async fn lookup(
        &self,
        namespace: &str,
        identifier: &str,
        params: Option<&Params>,
    ) -> Option<CacheHit> {
        let key = self.key_for(namespace, identifier, params);
        tracing::Span::current().record("key", key.as_str());
        self.lookup_key(&key).await
    }

    /// Get an entry
    pub async fn get(
        &self,
        namespace: &str,
        identifier: &str,
        params: Option<&Params>,
    ) -> Option<CacheEntry> {
        self.lookup(namespace, identifier, params)
            .await
            .map(|hit| hit.entry)
    }

    async fn lookup_key(&self, key: &CacheKey) -> Option<CacheHit> {
        let start = Instant::now();
        self.popularity.record(key.as_str());

        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.get(key.as_str()).await {
                Ok(Some(entry)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.tier_hits[index].fetch_add(1, Ordering::Relaxed);
                    self.index_key(key);
                    debug!("Cache hit for {} in tier '{}'", key, tier.name());

                    if index > 0 {
                        self.spawn_backfill(key, &entry, index);
                    }

                    return Some(CacheHit {
                        entry,
                        tier: tier.name().to_string(),
                        latency: start.elapsed(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Tier '{}' failed to read {}: {}", tier.name(), key, e);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.namespace_index.remove(key.namespace(), key.as_str());
        debug!("Cache miss for {} in all tiers", key);
        None
    }

    /// Copy `entry` into every tier faster than `found_at`, off the read path
    fn spawn_backfill(&self, key: &CacheKey, entry: &CacheEntry, found_at: usize) {
        let targets: Vec<Arc<dyn CacheTier>> = self.tiers[..found_at].to_vec();
        let ttl = self.ttl_for(key.namespace());
        let key = key.clone();
        let entry = entry.clone();

        self.backfills.spawn(async move {
            let writes = targets.iter().map(|tier| tier.set(key.as_str(), &entry, Some(ttl)));
            let results = join_all(writes).await;

            for (tier, result) in targets.iter().zip(results) {
                match result {
                    Ok(()) => debug!("Backfilled {} into tier '{}'", key, tier.name()),
                    Err(e) => warn!("Backfill of {} into tier '{}' failed: {}", key, tier.name(), e),
                }
            }
        });
    }

    /// Wait until every backfill spawned so far has finished
    pub async fn wait_for_backfills(&self) {
        self.backfills.close();
        self.backfills.wait().await;
        self.backfills.reopen();
    }

    /// Check whether any tier holds the entry
    pub async fn exists(&self, namespace: &str, identifier: &str, params: Option<&Params>) -> bool {
        let key = self.key_for(namespace, identifier, params);
        for tier in &self.tiers {
            match tier.exists(key.as_str()).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("Tier '{}' failed exists check for {}: {}", tier.name(), key, e),
            }
        }
        false
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Store an entry in every tier. `ttl` defaults to the namespace TTL.
    #[instrument(skip(self, entry, params), fields(key = tracing::field::Empty, size = entry.size()))]
    pub async fn set(
        &self,
        namespace: &str,
        identifier: &str,
        entry: &CacheEntry,
        ttl: Option<Duration>,
        params: Option<&Params>,
    ) -> SetOutcome {
        let key = self.key_for(namespace, identifier, params);
        tracing::Span::current().record("key", key.as_str());
        self.set_key(&key, entry, ttl).await
    }

    pub(crate) async fn set_key(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        ttl: Option<Duration>,
    ) -> SetOutcome {
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(key.namespace()));
        let writes = self
            .tiers
            .iter()
            .map(|tier| tier.set(key.as_str(), entry, Some(ttl)));
        let results = join_all(writes).await;

        let mut outcome = SetOutcome::default();
        for (tier, result) in self.tiers.iter().zip(results) {
            match result {
                Ok(()) => outcome.succeeded.push(tier.name().to_string()),
                Err(e) => {
                    warn!("Tier '{}' failed to store {}: {}", tier.name(), key, e);
                    outcome.failed.push(tier.name().to_string());
                }
            }
        }

        if !outcome.succeeded.is_empty() {
            self.index_key(key);
        }
        outcome
    }

    /// Delete an entry from every tier, returning whether any tier held it
    pub async fn delete(&self, namespace: &str, identifier: &str, params: Option<&Params>) -> bool {
        let key = self.key_for(namespace, identifier, params);
        self.popularity.remove(key.as_str());
        self.namespace_index.remove(key.namespace(), key.as_str());
        self.delete_everywhere(key.as_str()).await
    }

    async fn delete_everywhere(&self, key: &str) -> bool {
        let results = join_all(self.tiers.iter().map(|tier| tier.delete(key))).await;

        let mut existed = false;
        for (tier, result) in self.tiers.iter().zip(results) {
            match result {
                Ok(found) => existed |= found,
                Err(e) => warn!("Tier '{}' failed to delete {}: {}", tier.name(), key, e),
            }
        }
        existed
    }

    /// Clear every tier and forget popularity and namespace tracking
    pub async fn clear(&self) {
        let results = join_all(self.tiers.iter().map(|tier| tier.clear())).await;
        for (tier, result) in self.tiers.iter().zip(results) {
            if let Err(e) = result {
                warn!("Tier '{}' failed to clear: {}", tier.name(), e);
            }
        }

        self.popularity.clear();
        self.namespace_index.clear();
        info!("Cleared all cache tiers");
    }

    /// Delete every key of `namespace` written or served through this cache.
    ///
    /// Returns the number of keys removed from at least one tier. Keys placed
    /// in shared tiers by other processes, and keys compacted out of the
    /// bounded index, are not tracked and stay until they expire.
    pub async fn invalidate_namespace(&self, namespace: &str) -> usize {
        let keys = self.namespace_index.take_namespace(namespace);

        let mut removed = 0;
        for key in &keys {
            if self.delete_everywhere(key).await {
                removed += 1;
            }
        }
        self.popularity
            .remove_prefix(&KeyStrategy::namespace_prefix(namespace));

        info!(
            "Invalidated namespace '{}' ({} of {} tracked keys removed)",
            namespace,
            removed,
            keys.len()
        );
        removed
    }

    fn index_key(&self, key: &CacheKey) {
        self.namespace_index.insert(key.namespace(), key.as_str());
    }

    // =========================================================================
    // Typed helpers
    // =========================================================================

    /// Get a JSON-encoded value. Undecodable entries read as a miss.
    pub async fn get_typed<T: DeserializeOwned>(
        &self,
        namespace: &str,
        identifier: &str,
        params: Option<&Params>,
    ) -> Option<T> {
        let entry = self.get(namespace, identifier, params).await?;
        match serde_json::from_slice(entry.data()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cached value for {}:{} is not valid JSON: {}", namespace, identifier, e);
                None
            }
        }
    }

    /// Store a value as JSON
    pub async fn set_typed<T: Serialize>(
        &self,
        namespace: &str,
        identifier: &str,
        value: &T,
        ttl: Option<Duration>,
        params: Option<&Params>,
    ) -> Result<SetOutcome> {
        let entry = CacheEntry::with_format(serde_json::to_vec(value)?, JSON_FORMAT);
        Ok(self.set(namespace, identifier, &entry, ttl, params).await)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Snapshot of per-tier and overall statistics
    pub async fn get_stats(&self) -> AggregateStats {
        let stats = join_all(self.tiers.iter().map(|tier| tier.stats())).await;

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        let tiers: Vec<TierReport> = self
            .tiers
            .iter()
            .zip(stats)
            .map(|(tier, stats)| TierReport {
                name: tier.name().to_string(),
                priority: tier.priority(),
                stats,
            })
            .collect();

        let hit_rate_by_tier = self
            .tiers
            .iter()
            .zip(&self.tier_hits)
            .map(|(tier, served)| {
                let served = served.load(Ordering::Relaxed);
                let share = if lookups == 0 {
                    0.0
                } else {
                    served as f64 / lookups as f64
                };
                (tier.name().to_string(), share)
            })
            .collect();

        AggregateStats {
            tiers,
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            hit_rate_by_tier,
            popular_keys: self.popularity.len(),
            indexed_keys: self.namespace_index.len(),
        }
    }

    /// Reset overall and per-tier counters
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        for served in &self.tier_hits {
            served.store(0, Ordering::Relaxed);
        }
        for tier in &self.tiers {
            tier.reset_stats();
        }
    }

    // =========================================================================
    // Preloading
    // =========================================================================

    /// Copy the most popular keys into faster tiers that lack them
    #[instrument(skip(self))]
    pub async fn preload_popular_keys(&self) -> PreloadReport {
        let popular = self.popularity.top(self.preload.top_n);
        let mut report = PreloadReport {
            considered: popular.len(),
            ..Default::default()
        };

        for (key, _) in popular {
            match self.preload_key(&key).await {
                Ok(0) => {}
                Ok(copies) => {
                    report.warmed += 1;
                    report.copies += copies;
                }
                Err(copies) => {
                    report.copies += copies;
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Preload pass: {} considered, {} warmed, {} failed",
            report.considered, report.warmed, report.failed
        );
        report
    }

    /// Returns the number of tier copies made; `Err` carries the copies made
    /// before a failure.
    async fn preload_key(&self, key: &str) -> std::result::Result<usize, usize> {
        let mut absent: Vec<&Arc<dyn CacheTier>> = Vec::new();
        let mut source = None;

        for tier in &self.tiers {
            match tier.exists(key).await {
                Ok(false) => absent.push(tier),
                Ok(true) => match tier.peek(key).await {
                    Ok(Some(entry)) => {
                        source = Some(entry);
                        break;
                    }
                    Ok(None) => absent.push(tier),
                    Err(e) => debug!("Preload read of {} from '{}' failed: {}", key, tier.name(), e),
                },
                Err(e) => debug!("Preload probe of {} in '{}' failed: {}", key, tier.name(), e),
            }
        }

        // Gone from every tier: stop tracking it
        let Some(entry) = source else {
            self.popularity.remove(key);
            self.namespace_index
                .remove(KeyStrategy::namespace_of(key), key);
            return Ok(0);
        };
        if absent.is_empty() {
            return Ok(0);
        }

        let ttl = self.ttl_for(KeyStrategy::namespace_of(key));
        let results = join_all(absent.iter().map(|tier| tier.set(key, &entry, Some(ttl)))).await;

        let mut copies = 0;
        let mut failed = false;
        for (tier, result) in absent.iter().zip(results) {
            match result {
                Ok(()) => copies += 1,
                Err(e) => {
                    warn!("Preload of {} into '{}' failed: {}", key, tier.name(), e);
                    failed = true;
                }
            }
        }

        if failed {
            Err(copies)
        } else {
            Ok(copies)
        }
    }

    /// Start periodic preloading, if enabled
    pub fn start_preloading(self: &Arc<Self>) -> Option<ScheduledTask> {
        if !self.preload.enabled {
            return None;
        }

        let cache = Arc::clone(self);
        Some(ScheduledTask::spawn(
            "preload",
            self.preload.interval,
            move || {
                let cache = cache.clone();
                async move {
                    cache.preload_popular_keys().await;
                }
            },
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
