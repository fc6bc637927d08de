//! Core Configuration
//!
//! Aggregates the per-component configuration sections into one document
//! that can be loaded from YAML. Every section has a sensible `Default`, so a
//! config file only needs to name the options it changes:
//!
//! ```yaml
//! ttl:
//!   default: 1h
//!   namespaces:
//!     thumbnails: 7d
//! filesystem:
//!   root: /var/cache/morphcache
//! eviction:
//!   policy: intelligent
//!   preserve_popular: true
//!   min_access_count: 10
//! circuit_breaker:
//!   failure_threshold: 50
//!   reset_timeout: 30s
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{FilesystemTierConfig, MemoryTierConfig, RedisTierConfig};
use crate::error::{Error, Result};
use crate::resilience::CircuitBreakerConfig;
use crate::storage::{EvictionConfig, EvictionStrategy, StorageConfig};

// =============================================================================
// TTL
// =============================================================================

/// Per-namespace time-to-live settings applied to every tier write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// TTL used when a namespace has no explicit entry
    #[serde(with = "duration_serde")]
    pub default: Duration,

    /// Namespace-specific TTLs
    #[serde(with = "duration_serde::map")]
    pub namespaces: HashMap<String, Duration>,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(3600),
            namespaces: HashMap::new(),
        }
    }
}

impl TtlConfig {
    /// Resolve the TTL for a namespace
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.namespaces
            .get(namespace)
            .copied()
            .unwrap_or(self.default)
    }
}

// =============================================================================
// Preloading
// =============================================================================

/// Popularity tracking and preloading configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Enable periodic preloading of popular keys
    pub enabled: bool,

    /// Interval between preload passes
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Number of most popular keys considered per pass
    pub top_n: usize,

    /// Maximum number of keys tracked by the popularity counter
    pub popularity_capacity: usize,

    /// Number of keys kept when the counter is compacted
    pub popularity_retain: usize,

    /// Maximum number of keys remembered for namespace invalidation
    pub index_capacity: usize,

    /// Number of most recently written or served keys kept when the
    /// namespace index is compacted
    pub index_retain: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(300),
            top_n: 50,
            popularity_capacity: 10_000,
            popularity_retain: 5_000,
            index_capacity: 100_000,
            index_retain: 50_000,
        }
    }
}

// =============================================================================
// Core Configuration
// =============================================================================

/// Complete configuration of the caching and resilience core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Tier TTLs
    pub ttl: TtlConfig,
    /// In-process memory tier
    pub memory: MemoryTierConfig,
    /// Networked key-value tier (disabled when absent)
    pub redis: Option<RedisTierConfig>,
    /// Filesystem tier
    pub filesystem: FilesystemTierConfig,
    /// Storage thresholds for the filesystem tier
    pub storage: StorageConfig,
    /// Eviction policy for the filesystem tier
    pub eviction: EvictionConfig,
    /// Circuit breaker protecting the producer path
    pub circuit_breaker: CircuitBreakerConfig,
    /// Popularity-based preloading
    pub preload: PreloadConfig,
}

impl CoreConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CoreConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Check cross-field invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let cb = &self.circuit_breaker;
        if !(0.0..=100.0).contains(&cb.failure_threshold) {
            return Err(Error::Config(format!(
                "circuit_breaker.failure_threshold must be within 0-100, got {}",
                cb.failure_threshold
            )));
        }
        if cb.minimum_requests == 0 {
            return Err(Error::Config(
                "circuit_breaker.minimum_requests must be at least 1".to_string(),
            ));
        }

        if self.storage.warning_size_bytes > self.storage.critical_size_bytes {
            return Err(Error::Config(
                "storage.warning_size_bytes must not exceed storage.critical_size_bytes"
                    .to_string(),
            ));
        }
        if self.storage.warning_file_count > self.storage.critical_file_count {
            return Err(Error::Config(
                "storage.warning_file_count must not exceed storage.critical_file_count"
                    .to_string(),
            ));
        }

        self.eviction.policy.parse::<EvictionStrategy>()?;
        if self.eviction.aggressiveness <= 0.0 || self.eviction.aggressiveness > 2.5 {
            return Err(Error::Config(format!(
                "eviction.aggressiveness must be within (0, 2.5], got {}",
                self.eviction.aggressiveness
            )));
        }

        if self.preload.popularity_retain >= self.preload.popularity_capacity {
            return Err(Error::Config(
                "preload.popularity_retain must be smaller than preload.popularity_capacity"
                    .to_string(),
            ));
        }
        if self.preload.index_retain >= self.preload.index_capacity {
            return Err(Error::Config(
                "preload.index_retain must be smaller than preload.index_capacity".to_string(),
            ));
        }
        if self.memory.max_keys == 0 || self.memory.max_size_bytes == 0 {
            return Err(Error::Config(
                "memory.max_keys and memory.max_size_bytes must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a human duration such as "500ms", "30s", "5m", "1h30m" or "7d".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier_ms = match c {
            'm' | 'M' if chars.peek().is_some_and(|n| *n == 's' || *n == 'S') => {
                chars.next();
                1
            }
            'd' | 'D' => 86_400_000,
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms += num * multiplier_ms;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms += num * 1_000;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Render a duration in the format accepted by [`parse_duration`]
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1_000 != 0 {
        format!("{}ms", ms)
    } else {
        format!("{}s", d.as_secs())
    }
}

/// Serde adapters for human-readable durations
pub mod duration_serde {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_duration, parse_duration};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    /// `Option<Duration>` where `null`/absent disables the setting
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&format_duration(*d)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            raw.map(|r| parse_duration(&r).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    /// `HashMap<String, Duration>` keyed by namespace
    pub mod map {
        use super::*;
        use serde::ser::SerializeMap;

        pub fn serialize<S: Serializer>(
            m: &HashMap<String, Duration>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            let mut map = s.serialize_map(Some(m.len()))?;
            for (k, v) in m {
                map.serialize_entry(k, &format_duration(*v))?;
            }
            map.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<HashMap<String, Duration>, D::Error> {
            let raw = HashMap::<String, String>::deserialize(d)?;
            raw.into_iter()
                .map(|(k, v)| {
                    parse_duration(&v)
                        .map(|d| (k, d))
                        .map_err(serde::de::Error::custom)
                })
                .collect()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m500ms").unwrap(), Duration::from_millis(60_500));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("h"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_format_duration_round_trips_through_parser() {
        for d in [Duration::from_millis(1500), Duration::from_secs(90)] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
ttl:
  default: 10m
  namespaces:
    thumbnails: 7d
eviction:
  policy: lru
circuit_breaker:
  failure_threshold: 60
  reset_timeout: 2s
preload:
  enabled: true
  interval: 30s
"#;
        let config = CoreConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.ttl.ttl_for("thumbnails"), Duration::from_secs(7 * 86400));
        assert_eq!(config.ttl.ttl_for("other"), Duration::from_secs(600));
        assert_eq!(config.eviction.policy, "lru");
        assert_eq!(config.circuit_breaker.failure_threshold, 60.0);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(2));
        assert_eq!(
            config.circuit_breaker.minimum_requests,
            CircuitBreakerConfig::default().minimum_requests
        );
        assert!(config.preload.enabled);
        assert!(config.redis.is_none());
    }

    #[test]
    fn test_validation_rejects_unknown_policy() {
        let yaml = "eviction:\n  policy: fifo\n";
        assert_matches!(
            CoreConfig::from_yaml_str(yaml),
            Err(Error::UnknownEvictionPolicy(name)) if name == "fifo"
        );
    }

    #[test]
    fn test_validation_rejects_inverted_size_limits() {
        let yaml = "storage:\n  warning_size_bytes: 100\n  critical_size_bytes: 50\n";
        assert_matches!(CoreConfig::from_yaml_str(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_index_retain_at_capacity() {
        let yaml = "preload:\n  index_capacity: 10\n  index_retain: 10\n";
        assert_matches!(CoreConfig::from_yaml_str(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_threshold_over_100() {
        let mut config = CoreConfig::default();
        config.circuit_breaker.failure_threshold = 120.0;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_config_serializes_back_to_yaml() {
        let config = CoreConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = CoreConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.ttl, config.ttl);
        assert_eq!(parsed.preload, config.preload);
    }
}
