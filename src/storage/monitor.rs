//! Storage Monitor
//!
//! Tracks the filesystem tier directory: totals, per-extension counts and a
//! per-file [`AccessPattern`], and classifies usage against the configured
//! size, file-count and age limits.
//!
//! Access patterns survive rescans (only size, extension and modification
//! time are refreshed), are created for new files and dropped for vanished
//! ones. Sidecar metadata files and in-progress writes are not tracked.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use super::eviction::{EvictionConfig, EvictionPolicy, DEFAULT_TARGET_RATIO};
use crate::cache::filesystem::is_data_file;
use crate::config::duration_serde;
use crate::error::{Error, Result};
use crate::scheduler::ScheduledTask;

const GIB: u64 = 1024 * 1024 * 1024;

/// Storage threshold configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Total size above which storage is in warning state
    pub warning_size_bytes: u64,
    /// Total size above which storage is critical
    pub critical_size_bytes: u64,
    /// File count above which storage is in warning state
    pub warning_file_count: u64,
    /// File count above which storage is critical
    pub critical_file_count: u64,
    /// Interval of the periodic directory scan
    #[serde(with = "duration_serde")]
    pub scan_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            warning_size_bytes: 8 * GIB,
            critical_size_bytes: 95 * GIB / 10,
            warning_file_count: 100_000,
            critical_file_count: 150_000,
            scan_interval: Duration::from_secs(300),
        }
    }
}

/// Access statistics of one tracked file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPattern {
    /// File name within the storage root
    pub file_id: String,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub size_bytes: u64,
    pub extension: String,
    pub modified_at: DateTime<Utc>,
}

/// Result of one directory scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_files: u64,
    pub total_size: u64,
    pub average_file_size: u64,
    pub oldest_file: Option<DateTime<Utc>>,
    pub newest_file: Option<DateTime<Utc>>,
    /// Extension -> file count
    pub file_types: BTreeMap<String, u64>,
    /// Sorted by file id
    pub access_patterns: Vec<AccessPattern>,
}

/// Storage health level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStatus {
    Healthy,
    Warning,
    Critical,
}

impl std::fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageStatus::Healthy => write!(f, "healthy"),
            StorageStatus::Warning => write!(f, "warning"),
            StorageStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Threshold classification with one issue per crossed dimension
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdReport {
    pub status: StorageStatus,
    pub issues: Vec<String>,
    pub total_size: u64,
    pub total_files: u64,
}

/// File facts collected by a scan, before they are merged into patterns
struct ScannedFile {
    file_id: String,
    size_bytes: u64,
    extension: String,
    modified_at: DateTime<Utc>,
}

/// Monitor of the filesystem tier directory
pub struct StorageMonitor {
    root: PathBuf,
    config: StorageConfig,
    eviction: EvictionConfig,
    patterns: DashMap<String, AccessPattern>,
}

impl StorageMonitor {
    pub fn new(root: impl AsRef<Path>, config: StorageConfig, eviction: EvictionConfig) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            config,
            eviction,
            patterns: DashMap::new(),
        }
    }

    /// Monitored directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Threshold configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Eviction configuration used for ranking and age checks
    pub fn eviction_config(&self) -> &EvictionConfig {
        &self.eviction
    }

    /// Current access pattern of a file
    pub fn access_pattern(&self, file_id: &str) -> Option<AccessPattern> {
        self.patterns.get(file_id).map(|p| p.value().clone())
    }

    /// Number of tracked files
    pub fn tracked_files(&self) -> usize {
        self.patterns.len()
    }

    /// Count one access of a tracked file. Unknown files are ignored.
    pub fn record_file_access(&self, file_id: &str) {
        if let Some(mut pattern) = self.patterns.get_mut(file_id) {
            pattern.access_count += 1;
            pattern.last_accessed_at = Utc::now();
        }
    }

    /// Stop tracking a file (after it was removed)
    pub fn forget(&self, file_id: &str) {
        self.patterns.remove(file_id);
    }

    fn scan_error(&self, source: std::io::Error) -> Error {
        Error::StorageScan {
            path: self.root.clone(),
            source,
        }
    }

    async fn scan(&self) -> Result<Vec<ScannedFile>> {
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| self.scan_error(e))?;

        while let Some(item) = dir.next_entry().await.map_err(|e| self.scan_error(e))? {
            let file_id = item.file_name().to_string_lossy().into_owned();
            if !is_data_file(&file_id) {
                continue;
            }

            let meta = match item.metadata().await {
                Ok(meta) => meta,
                // Removed between listing and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(self.scan_error(e)),
            };
            if !meta.is_file() {
                continue;
            }

            let modified_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let extension = Path::new(&file_id)
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();

            files.push(ScannedFile {
                file_id,
                size_bytes: meta.len(),
                extension,
                modified_at,
            });
        }

        Ok(files)
    }

    /// Merge scan results into the pattern map
    fn refresh(&self, files: &[ScannedFile]) {
        for file in files {
            self.patterns
                .entry(file.file_id.clone())
                .and_modify(|p| {
                    p.size_bytes = file.size_bytes;
                    p.extension = file.extension.clone();
                    p.modified_at = file.modified_at;
                })
                .or_insert_with(|| AccessPattern {
                    file_id: file.file_id.clone(),
                    last_accessed_at: file.modified_at,
                    access_count: 0,
                    size_bytes: file.size_bytes,
                    extension: file.extension.clone(),
                    modified_at: file.modified_at,
                });
        }

        let present: std::collections::HashSet<&str> =
            files.iter().map(|f| f.file_id.as_str()).collect();
        self.patterns.retain(|id, _| present.contains(id.as_str()));
    }

    /// Scan the directory once and summarize it
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        let files = self.scan().await?;
        self.refresh(&files);

        let total_files = files.len() as u64;
        let total_size: u64 = files.iter().map(|f| f.size_bytes).sum();
        let mut file_types = BTreeMap::new();
        for file in &files {
            *file_types.entry(file.extension.clone()).or_insert(0) += 1;
        }

        let mut access_patterns: Vec<AccessPattern> =
            self.patterns.iter().map(|p| p.value().clone()).collect();
        access_patterns.sort_by(|a, b| a.file_id.cmp(&b.file_id));

        Ok(StorageStats {
            total_files,
            total_size,
            average_file_size: if total_files == 0 {
                0
            } else {
                total_size / total_files
            },
            oldest_file: files.iter().map(|f| f.modified_at).min(),
            newest_file: files.iter().map(|f| f.modified_at).max(),
            file_types,
            access_patterns,
        })
    }

    /// Classify storage against the configured limits
    pub async fn check_thresholds(&self) -> Result<ThresholdReport> {
        let stats = self.get_storage_stats().await?;
        let mut status = StorageStatus::Healthy;
        let mut issues = Vec::new();

        if stats.total_size > self.config.critical_size_bytes {
            status = StorageStatus::Critical;
            issues.push(format!(
                "Storage size {} bytes exceeds critical limit {} bytes",
                stats.total_size, self.config.critical_size_bytes
            ));
        } else if stats.total_size > self.config.warning_size_bytes {
            status = StorageStatus::Warning;
            issues.push(format!(
                "Storage size {} bytes exceeds warning limit {} bytes",
                stats.total_size, self.config.warning_size_bytes
            ));
        }

        if stats.total_files > self.config.critical_file_count {
            status = StorageStatus::Critical;
            issues.push(format!(
                "File count {} exceeds critical limit {}",
                stats.total_files, self.config.critical_file_count
            ));
        } else if stats.total_files > self.config.warning_file_count {
            status = status.max(StorageStatus::Warning);
            issues.push(format!(
                "File count {} exceeds warning limit {}",
                stats.total_files, self.config.warning_file_count
            ));
        }

        let max_age = chrono::Duration::from_std(self.eviction.max_file_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let stale = stats
            .access_patterns
            .iter()
            .filter(|p| now - p.modified_at > max_age)
            .count();
        if stale > 0 {
            status = status.max(StorageStatus::Warning);
            issues.push(format!(
                "{} files older than {}",
                stale,
                crate::config::format_duration(self.eviction.max_file_age)
            ));
        }

        if status != StorageStatus::Healthy {
            debug!("Storage status {}: {:?}", status, issues);
        }

        Ok(ThresholdReport {
            status,
            issues,
            total_size: stats.total_size,
            total_files: stats.total_files,
        })
    }

    /// Rank files by the active policy and return them in order until their
    /// combined size reaches `target_bytes` (default: 20% of total size).
    /// Protected files are never returned.
    pub async fn get_eviction_candidates(&self, target_bytes: Option<u64>) -> Result<Vec<AccessPattern>> {
        let policy = EvictionPolicy::from_config(&self.eviction)?;
        let stats = self.get_storage_stats().await?;

        let target = target_bytes
            .unwrap_or_else(|| (stats.total_size as f64 * DEFAULT_TARGET_RATIO) as u64);
        if target == 0 {
            return Ok(Vec::new());
        }

        let mut selected = Vec::new();
        let mut cumulative = 0u64;
        for pattern in policy.rank(stats.access_patterns, Utc::now()) {
            if cumulative >= target {
                break;
            }
            cumulative += pattern.size_bytes;
            selected.push(pattern);
        }

        debug!(
            "Selected {} eviction candidates ({} of {} target bytes) with policy '{}'",
            selected.len(),
            cumulative,
            target,
            policy.strategy()
        );
        Ok(selected)
    }

    /// Rescan the directory, logging instead of returning errors
    pub async fn scan_storage_directory(&self) {
        match self.scan().await {
            Ok(files) => {
                self.refresh(&files);
                debug!("Storage scan tracked {} files", files.len());
            }
            Err(e) => error!("Storage scan failed: {}", e),
        }
    }

    /// Rescan every `scan_interval`
    pub fn start_periodic_scan(self: &Arc<Self>) -> ScheduledTask {
        let monitor = Arc::clone(self);
        ScheduledTask::spawn("storage-scan", self.config.scan_interval, move || {
            let monitor = monitor.clone();
            async move {
                monitor.scan_storage_directory().await;
            }
        })
    }
}

impl std::fmt::Debug for StorageMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageMonitor")
            .field("root", &self.root)
            .field("tracked_files", &self.patterns.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn write_file(dir: &TempDir, name: &str, size: u64, age: Duration) {
        let file = File::create(dir.path().join(name)).unwrap();
        file.set_len(size).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    fn monitor(dir: &TempDir, config: StorageConfig) -> StorageMonitor {
        StorageMonitor::new(dir.path(), config, EvictionConfig::default())
    }

    fn limits(warning: u64, critical: u64) -> StorageConfig {
        StorageConfig {
            warning_size_bytes: warning,
            critical_size_bytes: critical,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_storage_stats() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.webp", 100, Duration::from_secs(3600));
        write_file(&dir, "b.webp", 300, Duration::from_secs(60));
        write_file(&dir, "c.png", 200, Duration::ZERO);
        std::fs::write(dir.path().join("a.meta.json"), b"{}").unwrap();
        std::fs::write(dir.path().join(".tmp-1234"), b"partial").unwrap();

        let stats = monitor(&dir, StorageConfig::default())
            .get_storage_stats()
            .await
            .unwrap();

        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.total_size, 600);
        assert_eq!(stats.average_file_size, 200);
        assert_eq!(stats.file_types["webp"], 2);
        assert_eq!(stats.file_types["png"], 1);
        assert!(stats.oldest_file.unwrap() < stats.newest_file.unwrap());
        assert_eq!(stats.access_patterns.len(), 3);
        assert_eq!(stats.access_patterns[0].file_id, "a.webp");
    }

    #[tokio::test]
    async fn test_missing_directory_is_scan_error() {
        let dir = TempDir::new().unwrap();
        let monitor = StorageMonitor::new(
            dir.path().join("absent"),
            StorageConfig::default(),
            EvictionConfig::default(),
        );
        assert_matches!(
            monitor.get_storage_stats().await,
            Err(Error::StorageScan { .. })
        );

        // The periodic variant only logs
        monitor.scan_storage_directory().await;
    }

    #[tokio::test]
    async fn test_access_counts_survive_rescans() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.bin", 10, Duration::ZERO);
        let monitor = monitor(&dir, StorageConfig::default());

        // Unknown before the first scan: no-op
        monitor.record_file_access("a.bin");
        assert!(monitor.access_pattern("a.bin").is_none());

        monitor.scan_storage_directory().await;
        monitor.record_file_access("a.bin");
        monitor.record_file_access("a.bin");
        monitor.record_file_access("unknown.bin");

        monitor.scan_storage_directory().await;
        assert_eq!(monitor.access_pattern("a.bin").unwrap().access_count, 2);

        std::fs::remove_file(dir.path().join("a.bin")).unwrap();
        monitor.scan_storage_directory().await;
        assert_eq!(monitor.tracked_files(), 0);
    }

    #[tokio::test]
    async fn test_thresholds_healthy() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.bin", MB, Duration::ZERO);

        let report = monitor(&dir, limits(2 * MB, 4 * MB))
            .check_thresholds()
            .await
            .unwrap();
        assert_eq!(report.status, StorageStatus::Healthy);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn test_thresholds_warning_has_one_size_issue() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.bin", 3 * MB, Duration::ZERO);

        let report = monitor(&dir, limits(2 * MB, 4 * MB))
            .check_thresholds()
            .await
            .unwrap();
        assert_eq!(report.status, StorageStatus::Warning);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("size"));
    }

    #[tokio::test]
    async fn test_thresholds_critical() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "a.bin", 5 * MB, Duration::ZERO);

        let report = monitor(&dir, limits(2 * MB, 4 * MB))
            .check_thresholds()
            .await
            .unwrap();
        assert_eq!(report.status, StorageStatus::Critical);
        assert_eq!(report.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_thresholds_file_count_and_age() {
        let dir = TempDir::new().unwrap();
        for i in 0..4 {
            write_file(&dir, &format!("f{}.bin", i), 1, Duration::ZERO);
        }
        write_file(&dir, "ancient.bin", 1, Duration::from_secs(30 * 86_400));

        let report = monitor(
            &dir,
            StorageConfig {
                warning_file_count: 3,
                critical_file_count: 10,
                ..Default::default()
            },
        )
        .check_thresholds()
        .await
        .unwrap();

        assert_eq!(report.status, StorageStatus::Warning);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues.iter().any(|i| i.contains("File count 5")));
        assert!(report.issues.iter().any(|i| i.contains("1 files older than")));
    }

    #[tokio::test]
    async fn test_candidates_reach_target() {
        let dir = TempDir::new().unwrap();
        for i in 0..10 {
            write_file(&dir, &format!("f{}.bin", i), MB, Duration::from_secs(i * 10));
        }
        let monitor = monitor(&dir, StorageConfig::default());

        let candidates = monitor.get_eviction_candidates(Some(2 * MB)).await.unwrap();
        let total: u64 = candidates.iter().map(|c| c.size_bytes).sum();
        assert!(total >= 2 * MB);
        assert_eq!(candidates.len(), 2);

        assert!(monitor.get_eviction_candidates(Some(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_popular_file_never_a_candidate() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "popular.bin", 50 * MB, Duration::from_secs(20 * 86_400));
        write_file(&dir, "other.bin", MB, Duration::ZERO);
        let monitor = monitor(&dir, StorageConfig::default());

        monitor.scan_storage_directory().await;
        for _ in 0..11 {
            monitor.record_file_access("popular.bin");
        }

        // Even asking for everything leaves the popular file alone
        let candidates = monitor
            .get_eviction_candidates(Some(u64::MAX))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].file_id, "other.bin");
    }
}
