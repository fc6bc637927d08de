//! Filesystem Tier - Durable Disk Cache
//!
//! One data file per cached artifact plus a JSON sidecar carrying its
//! metadata, both named after the same stem:
//!
//! ```text
//! {root}/image%3Acat%2Ejpg%3A1f2e3d4c5b6a7988.webp
//! {root}/image%3Acat%2Ejpg%3A1f2e3d4c5b6a7988.meta.json
//! ```
//!
//! The stem is the URL-encoded key with `.` encoded as well, or the SHA-256
//! hex digest of the key when the encoded form would be too long for a file
//! name. Stems never contain a dot, so a data file name can never collide
//! with a sidecar name. Files are written to a
//! temporary name and renamed into place so readers never observe a partial
//! write. The sidecar is written after the data file and removed before it,
//! so a present sidecar always refers to a complete data file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::{CacheEntry, EntryMetadata};
use super::tier::{CacheTier, CacheTierStats, TierCounters};
use crate::error::Result;
use crate::storage::StorageMonitor;

/// Suffix of sidecar metadata files
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Prefix of in-progress writes
pub const TEMP_PREFIX: &str = ".tmp-";

/// Longest encoded key used verbatim as a file stem
const MAX_STEM_LEN: usize = 200;

/// Extension used when an entry carries no format
const DEFAULT_EXTENSION: &str = "bin";

/// Filesystem tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemTierConfig {
    /// Probe priority (lower = checked first)
    pub priority: u32,
    /// Directory holding data and sidecar files
    pub root: PathBuf,
    /// Advisory capacity of the directory in bytes
    pub max_size_bytes: u64,
}

impl Default for FilesystemTierConfig {
    fn default() -> Self {
        Self {
            priority: 3,
            root: PathBuf::from("/var/cache/morphcache"),
            max_size_bytes: 10 * 1024 * 1024 * 1024, // 10GB
        }
    }
}

/// File stem for a key (dot-free)
pub fn file_stem(key: &str) -> String {
    let encoded = urlencoding::encode(key).replace('.', "%2E");
    if encoded.len() > MAX_STEM_LEN {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    } else {
        encoded
    }
}

/// Data file name for a stem and an optional format
pub fn data_file_name(stem: &str, format: Option<&str>) -> String {
    let extension: String = format
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if extension.is_empty() {
        format!("{}.{}", stem, DEFAULT_EXTENSION)
    } else {
        format!("{}.{}", stem, extension.to_ascii_lowercase())
    }
}

/// Sidecar file name belonging to a data file
pub fn sidecar_for_data_file(data_file: &str) -> String {
    let stem = data_file.rsplit_once('.').map_or(data_file, |(stem, _)| stem);
    format!("{}{}", stem, SIDECAR_SUFFIX)
}

/// True for files that hold cached payloads (not sidecars or partial writes)
pub fn is_data_file(name: &str) -> bool {
    !name.ends_with(SIDECAR_SUFFIX) && !name.starts_with(TEMP_PREFIX)
}

/// Durable tier storing entries as files under a root directory
pub struct FilesystemTier {
    config: FilesystemTierConfig,
    monitor: Option<Arc<StorageMonitor>>,
    counters: TierCounters,
}

impl FilesystemTier {
    /// Create the tier, creating the root directory if needed
    pub async fn new(config: FilesystemTierConfig) -> Result<Self> {
        fs::create_dir_all(&config.root).await?;
        info!("Filesystem tier rooted at {}", config.root.display());
        Ok(Self {
            config,
            monitor: None,
            counters: TierCounters::new("filesystem"),
        })
    }

    /// Report every hit to a storage monitor
    pub fn with_access_monitor(mut self, monitor: Arc<StorageMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Advisory capacity in bytes
    pub fn max_size_bytes(&self) -> u64 {
        self.config.max_size_bytes
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.config
            .root
            .join(format!("{}{}", file_stem(key), SIDECAR_SUFFIX))
    }

    async fn read_metadata(&self, path: &Path) -> Result<Option<EntryMetadata>> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write bytes under a temporary name, then rename into place
    async fn write_atomic(&self, file_name: &str, data: &[u8]) -> Result<()> {
        let tmp = self
            .config
            .root
            .join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, self.config.root.join(file_name)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_if_present(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the sidecar first, then the data file
    async fn remove_entry(&self, sidecar: &Path, meta: &EntryMetadata) -> Result<()> {
        Self::remove_if_present(sidecar).await?;
        Self::remove_if_present(&self.config.root.join(&meta.data_file)).await?;
        Ok(())
    }

    /// Read an entry; `record_access` reports the hit to the monitor
    async fn load(&self, key: &str, record_access: bool) -> Result<Option<CacheEntry>> {
        let sidecar = self.sidecar_path(key);
        let Some(meta) = self.read_metadata(&sidecar).await? else {
            return Ok(None);
        };

        if meta.is_expired() {
            debug!("Filesystem tier dropping expired entry {}", key);
            self.remove_entry(&sidecar, &meta).await?;
            return Ok(None);
        }

        let data = match fs::read(self.config.root.join(&meta.data_file)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Data file evicted underneath the sidecar
                Self::remove_if_present(&sidecar).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if record_access {
            if let Some(monitor) = &self.monitor {
                monitor.record_file_access(&meta.data_file);
            }
        }

        let data = Bytes::from(data);
        Ok(Some(match meta.format {
            Some(format) => CacheEntry::with_format(data, format),
            None => CacheEntry::new(data),
        }))
    }

    async fn store(&self, key: &str, entry: &CacheEntry, ttl: Option<Duration>) -> Result<()> {
        let stem = file_stem(key);
        let data_file = data_file_name(&stem, entry.format());
        let sidecar = self.sidecar_path(key);

        // A previous value with another format lives in a differently named file
        if let Ok(Some(previous)) = self.read_metadata(&sidecar).await {
            if previous.data_file != data_file {
                self.remove_entry(&sidecar, &previous).await?;
            }
        }

        self.write_atomic(&data_file, entry.data()).await?;
        let meta = EntryMetadata::new(key, &data_file, entry, ttl);
        self.write_atomic(
            &format!("{}{}", stem, SIDECAR_SUFFIX),
            &serde_json::to_vec_pretty(&meta)?,
        )
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let sidecar = self.sidecar_path(key);
        match self.read_metadata(&sidecar).await? {
            Some(meta) => {
                self.remove_entry(&sidecar, &meta).await?;
                if let Some(monitor) = &self.monitor {
                    monitor.forget(&meta.data_file);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_entries(&self) -> Result<u64> {
        let mut count = 0;
        let mut dir = fs::read_dir(&self.config.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if item.file_name().to_string_lossy().ends_with(SIDECAR_SUFFIX) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn remove_all(&self) -> Result<usize> {
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.config.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if item.file_type().await?.is_file() && Self::remove_if_present(&item.path()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheTier for FilesystemTier {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn priority(&self) -> u32 {
        self.config.priority
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.load(key, true).await {
            Ok(Some(entry)) => {
                self.counters.record_hit();
                Ok(Some(entry))
            }
            Ok(None) => {
                self.counters.record_miss();
                Ok(None)
            }
            Err(e) => {
                self.counters.record_error("get");
                Err(e)
            }
        }
    }

    async fn peek(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.load(key, false)
            .await
            .inspect_err(|_| self.counters.record_error("peek"))
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Option<Duration>) -> Result<()> {
        self.store(key, entry, ttl).await.inspect_err(|_| {
            self.counters.record_error("set");
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.remove(key).await.inspect_err(|_| {
            self.counters.record_error("delete");
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let meta = self
            .read_metadata(&self.sidecar_path(key))
            .await
            .inspect_err(|_| self.counters.record_error("exists"))?;
        Ok(meta.is_some_and(|m| !m.is_expired()))
    }

    async fn clear(&self) -> Result<()> {
        let removed = self
            .remove_all()
            .await
            .inspect_err(|_| self.counters.record_error("clear"))?;
        info!(
            "Cleared {} files from filesystem tier {}",
            removed,
            self.config.root.display()
        );
        Ok(())
    }

    async fn stats(&self) -> CacheTierStats {
        let key_count = match self.count_entries().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Filesystem tier key count unavailable: {}", e);
                0
            }
        };
        self.counters.snapshot(key_count)
    }

    fn reset_stats(&self) {
        self.counters.reset();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn tier(dir: &TempDir) -> FilesystemTier {
        FilesystemTier::new(FilesystemTierConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    fn files_in(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_naming_helpers() {
        assert_eq!(file_stem("image:cat.jpg"), "image%3Acat%2Ejpg");
        assert_eq!(data_file_name("s", Some("WebP")), "s.webp");
        assert_eq!(data_file_name("s", None), "s.bin");
        assert_eq!(data_file_name("s", Some("../x")), "s.x");
        assert_eq!(
            sidecar_for_data_file("image%3Acat%2Ejpg.webp"),
            "image%3Acat%2Ejpg.meta.json"
        );
        assert!(is_data_file("a.png"));
        assert!(!is_data_file("a.meta.json"));
        assert!(!is_data_file(".tmp-1234"));
    }

    #[test]
    fn test_long_keys_are_hashed() {
        let key = format!("image:{}", "x".repeat(400));
        let stem = file_stem(&key);
        assert_eq!(stem.len(), 64);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_set_writes_data_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let tier = tier(&dir).await;

        tier.set(
            "image:cat.jpg",
            &CacheEntry::with_format(Bytes::from_static(b"webp-bytes"), "webp"),
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            files_in(&dir),
            vec!["image%3Acat%2Ejpg.meta.json", "image%3Acat%2Ejpg.webp"]
        );

        let got = tier.get("image:cat.jpg").await.unwrap().unwrap();
        assert_eq!(got.data().as_ref(), b"webp-bytes");
        assert_eq!(got.format(), Some("webp"));
    }

    #[tokio::test]
    async fn test_dotted_identifier_never_shadows_a_sidecar() {
        let dir = TempDir::new().unwrap();
        let tier = tier(&dir).await;

        tier.set("ns:x", &CacheEntry::with_format(vec![1u8], "bin"), None)
            .await
            .unwrap();
        tier.set("ns:x.meta", &CacheEntry::with_format(b"{}".to_vec(), "json"), None)
            .await
            .unwrap();

        let names = files_in(&dir);
        assert_eq!(names.len(), 4);
        assert_eq!(names.iter().filter(|n| is_data_file(n)).count(), 2);

        let x = tier.get("ns:x").await.unwrap().unwrap();
        assert_eq!(x.data().as_ref(), &[1u8]);
        assert_eq!(x.format(), Some("bin"));
        let meta = tier.get("ns:x.meta").await.unwrap().unwrap();
        assert_eq!(meta.data().as_ref(), b"{}");
    }

    #[tokio::test]
    async fn test_peek_does_not_count_access() {
        use crate::storage::{EvictionConfig, StorageConfig};

        let dir = TempDir::new().unwrap();
        let monitor = Arc::new(StorageMonitor::new(
            dir.path(),
            StorageConfig::default(),
            EvictionConfig::default(),
        ));
        let tier = tier(&dir).await.with_access_monitor(Arc::clone(&monitor));

        tier.set("k", &CacheEntry::new(vec![7u8; 4]), None)
            .await
            .unwrap();
        monitor.scan_storage_directory().await;

        assert!(tier.peek("k").await.unwrap().is_some());
        assert!(tier.peek("missing").await.unwrap().is_none());
        assert_eq!(monitor.access_pattern("k.bin").unwrap().access_count, 0);
        let stats = tier.stats().await;
        assert_eq!((stats.hits, stats.misses), (0, 0));

        tier.get("k").await.unwrap();
        assert_eq!(monitor.access_pattern("k.bin").unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn test_format_change_replaces_data_file() {
        let dir = TempDir::new().unwrap();
        let tier = tier(&dir).await;

        tier.set("k", &CacheEntry::with_format(vec![1u8], "png"), None)
            .await
            .unwrap();
        tier.set("k", &CacheEntry::with_format(vec![2u8], "avif"), None)
            .await
            .unwrap();

        assert_eq!(files_in(&dir), vec!["k.avif", "k.meta.json"]);
        assert_eq!(tier.get("k").await.unwrap().unwrap().format(), Some("avif"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_deleted_on_read() {
        let dir = TempDir::new().unwrap();
        let tier = tier(&dir).await;

        tier.set("k", &CacheEntry::new(vec![0u8; 8]), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!tier.exists("k").await.unwrap());
        assert!(tier.get("k").await.unwrap().is_none());
        assert!(files_in(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_missing_data_file_is_miss() {
        let dir = TempDir::new().unwrap();
        let tier = tier(&dir).await;

        tier.set("k", &CacheEntry::new(vec![0u8; 8]), None)
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("k.bin")).unwrap();

        assert!(tier.get("k").await.unwrap().is_none());
        assert!(files_in(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_delete_clear_and_stats() {
        let dir = TempDir::new().unwrap();
        let tier = tier(&dir).await;

        for i in 0..3 {
            tier.set(&format!("k{}", i), &CacheEntry::new(vec![i as u8]), None)
                .await
                .unwrap();
        }
        assert!(tier.delete("k0").await.unwrap());
        assert!(!tier.delete("k0").await.unwrap());

        tier.get("k1").await.unwrap();
        tier.get("k0").await.unwrap();

        let stats = tier.stats().await;
        assert_eq!(stats.key_count, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        tier.clear().await.unwrap();
        assert!(files_in(&dir).is_empty());
        assert_eq!(tier.stats().await.key_count, 0);
    }

    #[tokio::test]
    async fn test_corrupt_sidecar_is_tier_error() {
        let dir = TempDir::new().unwrap();
        let tier = tier(&dir).await;

        std::fs::write(dir.path().join("k.meta.json"), b"{not json").unwrap();
        assert!(tier.get("k").await.is_err());
        assert_eq!(tier.stats().await.error_count, 1);
    }
}
