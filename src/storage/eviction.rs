//! Eviction Engine
//!
//! Removes files from the filesystem tier when storage runs high. Candidate
//! selection is delegated to the [`StorageMonitor`], which ranks files by the
//! active [`EvictionPolicy`]:
//!
//! | Policy        | Evicts first                                   |
//! |---------------|------------------------------------------------|
//! | `lru`         | least recently accessed                        |
//! | `size-based`  | largest                                        |
//! | `intelligent` | weighted mix of staleness, rarity and size     |
//!
//! With `preserve_popular` enabled, files accessed at least
//! `min_access_count` times are never candidates, whatever their score.

use std::fmt;
use std::io::ErrorKind;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::monitor::{AccessPattern, StorageMonitor, StorageStatus};
use crate::cache::filesystem::sidecar_for_data_file;
use crate::config::duration_serde;
use crate::error::{Error, Result};
use crate::metrics::{EVICTED_BYTES, EVICTED_FILES};
use crate::scheduler::ScheduledTask;

/// Share of total size reclaimed when no target is given
pub const DEFAULT_TARGET_RATIO: f64 = 0.20;

/// Share of total size reclaimed at warning level (before aggressiveness)
const WARNING_TARGET_RATIO: f64 = 0.20;

/// Share of total size reclaimed at critical level (before aggressiveness)
const CRITICAL_TARGET_RATIO: f64 = 0.40;

// =============================================================================
// Configuration
// =============================================================================

/// Eviction strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionStrategy {
    /// Least recently accessed first
    Lru,
    /// Largest first
    SizeBased,
    /// Weighted recency/frequency/size score
    Intelligent,
}

impl EvictionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionStrategy::Lru => "lru",
            EvictionStrategy::SizeBased => "size-based",
            EvictionStrategy::Intelligent => "intelligent",
        }
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "size-based" | "size_based" | "size" => Ok(EvictionStrategy::SizeBased),
            "intelligent" => Ok(EvictionStrategy::Intelligent),
            _ => Err(Error::UnknownEvictionPolicy(s.to_string())),
        }
    }
}

/// Eviction configuration.
///
/// `policy` stays a free-form string so a misconfigured name surfaces as a
/// reported eviction error instead of a startup failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Policy name: `lru`, `size-based` or `intelligent`
    pub policy: String,
    /// Multiplier on threshold-based targets
    pub aggressiveness: f64,
    /// Never evict files accessed at least `min_access_count` times
    pub preserve_popular: bool,
    /// Access count that makes a file popular
    pub min_access_count: u64,
    /// Files not modified for this long are reported by threshold checks
    #[serde(with = "duration_serde")]
    pub max_file_age: Duration,
    /// Weight of staleness in the intelligent score
    pub recency_weight: f64,
    /// Weight of rarity in the intelligent score
    pub frequency_weight: f64,
    /// Weight of size in the intelligent score
    pub size_weight: f64,
    /// Interval of threshold-based eviction runs
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: EvictionStrategy::Intelligent.as_str().to_string(),
            aggressiveness: 1.0,
            preserve_popular: true,
            min_access_count: 10,
            max_file_age: Duration::from_secs(7 * 86_400),
            recency_weight: 0.4,
            frequency_weight: 0.3,
            size_weight: 0.3,
            check_interval: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Scoring rule for one eviction strategy
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    strategy: EvictionStrategy,
    config: EvictionConfig,
}

impl EvictionPolicy {
    /// Build the policy named by `config.policy`
    pub fn from_config(config: &EvictionConfig) -> Result<Self> {
        Ok(Self {
            strategy: config.policy.parse()?,
            config: config.clone(),
        })
    }

    /// Active strategy
    pub fn strategy(&self) -> EvictionStrategy {
        self.strategy
    }

    /// Eviction score (higher = evicted first)
    pub fn calculate_score(&self, pattern: &AccessPattern, now: DateTime<Utc>) -> f64 {
        let idle_secs = (now - pattern.last_accessed_at).num_milliseconds().max(0) as f64 / 1000.0;

        match self.strategy {
            EvictionStrategy::Lru => idle_secs,
            EvictionStrategy::SizeBased => pattern.size_bytes as f64,
            EvictionStrategy::Intelligent => {
                // Each component is normalized to 0.0..=1.0
                let horizon = self.config.max_file_age.as_secs_f64();
                let recency = if horizon > 0.0 {
                    (idle_secs / horizon).min(1.0)
                } else {
                    1.0
                };
                let frequency = 1.0 / (pattern.access_count as f64 + 1.0);
                let size = ((pattern.size_bytes as f64 + 1.0).log2() / 30.0).min(1.0);

                self.config.recency_weight * recency
                    + self.config.frequency_weight * frequency
                    + self.config.size_weight * size
            }
        }
    }

    /// Check whether a file is exempt from eviction
    pub fn should_protect(&self, pattern: &AccessPattern) -> bool {
        self.config.preserve_popular && pattern.access_count >= self.config.min_access_count
    }

    /// Rank patterns for eviction, dropping protected files
    pub fn rank(&self, patterns: Vec<AccessPattern>, now: DateTime<Utc>) -> Vec<AccessPattern> {
        let mut scored: Vec<(f64, AccessPattern)> = patterns
            .into_iter()
            .filter(|p| !self.should_protect(p))
            .map(|p| (self.calculate_score(&p, now), p))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.file_id.cmp(&b.1.file_id))
        });
        scored.into_iter().map(|(_, p)| p).collect()
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of an eviction run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionResult {
    pub files_evicted: u64,
    pub size_freed: u64,
    pub strategy: String,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl EvictionResult {
    fn empty(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            ..Default::default()
        }
    }
}

/// Dry-run eviction plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvictionRecommendations {
    pub candidates: Vec<AccessPattern>,
    pub total_reclaimable: u64,
    pub policy: String,
    pub reasoning: Vec<String>,
}

// =============================================================================
// Engine
// =============================================================================

/// Deletes filesystem tier entries chosen by the storage monitor
pub struct EvictionEngine {
    monitor: Arc<StorageMonitor>,
}

impl EvictionEngine {
    pub fn new(monitor: Arc<StorageMonitor>) -> Self {
        Self { monitor }
    }

    /// Monitor this engine evicts for
    pub fn monitor(&self) -> &Arc<StorageMonitor> {
        &self.monitor
    }

    /// Evict until at least `target_bytes` are freed (default: 20% of the
    /// tracked size).
    ///
    /// Per-file failures are collected in the result. An unknown policy name
    /// evicts nothing and reports one error. Only a failed directory scan is
    /// returned as `Err`.
    #[instrument(skip(self))]
    pub async fn perform_eviction(&self, target_bytes: Option<u64>) -> Result<EvictionResult> {
        let start = Instant::now();
        let policy_name = self.monitor.eviction_config().policy.clone();

        let candidates = match self.monitor.get_eviction_candidates(target_bytes).await {
            Ok(candidates) => candidates,
            Err(Error::UnknownEvictionPolicy(name)) => {
                error!("Eviction skipped: unknown policy '{}'", name);
                let mut result = EvictionResult::empty(&policy_name);
                result
                    .errors
                    .push(Error::UnknownEvictionPolicy(name).to_string());
                return Ok(result);
            }
            Err(e) => return Err(e),
        };

        let mut result = EvictionResult::empty(&policy_name);
        for candidate in &candidates {
            match self.evict_file(candidate).await {
                Ok(true) => {
                    result.files_evicted += 1;
                    result.size_freed += candidate.size_bytes;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to evict {}: {}", candidate.file_id, e);
                    result
                        .errors
                        .push(format!("{}: {}", candidate.file_id, e));
                }
            }
        }
        result.duration_ms = start.elapsed().as_millis() as u64;

        EVICTED_FILES.inc_by(result.files_evicted);
        EVICTED_BYTES.inc_by(result.size_freed);
        info!(
            "Evicted {} files ({} bytes) with policy '{}' in {}ms, {} errors",
            result.files_evicted,
            result.size_freed,
            result.strategy,
            result.duration_ms,
            result.errors.len()
        );
        Ok(result)
    }

    /// Remove sidecar then data file. `Ok(false)` when already gone.
    async fn evict_file(&self, candidate: &AccessPattern) -> Result<bool> {
        let root = self.monitor.root();
        let sidecar = root.join(sidecar_for_data_file(&candidate.file_id));

        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let removed = match tokio::fs::remove_file(root.join(&candidate.file_id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} vanished before eviction", candidate.file_id);
                false
            }
            Err(e) => return Err(e.into()),
        };

        self.monitor.forget(&candidate.file_id);
        Ok(removed)
    }

    /// Evict in proportion to the current threshold status: nothing when
    /// healthy, 20% of total size at warning and 40% at critical, both scaled
    /// by `aggressiveness`.
    pub async fn perform_threshold_based_eviction(&self) -> Result<EvictionResult> {
        let report = self.monitor.check_thresholds().await?;
        let config = self.monitor.eviction_config();

        let ratio = match report.status {
            StorageStatus::Healthy => {
                debug!("Storage healthy; no eviction needed");
                return Ok(EvictionResult::empty(&config.policy));
            }
            StorageStatus::Warning => WARNING_TARGET_RATIO,
            StorageStatus::Critical => CRITICAL_TARGET_RATIO,
        };

        let target = (report.total_size as f64 * ratio * config.aggressiveness) as u64;
        info!(
            "Storage {}: evicting {} bytes ({})",
            report.status,
            target,
            report.issues.join("; ")
        );
        self.perform_eviction(Some(target)).await
    }

    /// Plan an eviction without deleting anything
    pub async fn get_eviction_recommendations(
        &self,
        target_bytes: Option<u64>,
    ) -> Result<EvictionRecommendations> {
        let config = self.monitor.eviction_config();
        let candidates = match self.monitor.get_eviction_candidates(target_bytes).await {
            Ok(candidates) => candidates,
            Err(Error::UnknownEvictionPolicy(name)) => {
                error!("No eviction plan: unknown policy '{}'", name);
                return Ok(EvictionRecommendations {
                    candidates: Vec::new(),
                    total_reclaimable: 0,
                    policy: config.policy.clone(),
                    reasoning: vec![Error::UnknownEvictionPolicy(name).to_string()],
                });
            }
            Err(e) => return Err(e),
        };

        let total_reclaimable: u64 = candidates.iter().map(|c| c.size_bytes).sum();
        let average_access = if candidates.is_empty() {
            0.0
        } else {
            candidates.iter().map(|c| c.access_count).sum::<u64>() as f64 / candidates.len() as f64
        };

        let mut reasoning = vec![
            format!(
                "{} files selected, {} bytes reclaimable",
                candidates.len(),
                total_reclaimable
            ),
            format!("Average access count of candidates: {:.1}", average_access),
            format!("Strategy: {}", config.policy),
        ];
        if config.preserve_popular {
            reasoning.push(format!(
                "Files accessed {} or more times are preserved",
                config.min_access_count
            ));
        }

        Ok(EvictionRecommendations {
            candidates,
            total_reclaimable,
            policy: config.policy.clone(),
            reasoning,
        })
    }

    /// Run threshold-based eviction every `check_interval`
    pub fn start_threshold_eviction(self: &Arc<Self>) -> ScheduledTask {
        let engine = Arc::clone(self);
        ScheduledTask::spawn(
            "threshold-eviction",
            self.monitor.eviction_config().check_interval,
            move || {
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine.perform_threshold_based_eviction().await {
                        error!("Threshold-based eviction failed: {}", e);
                    }
                }
            },
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
