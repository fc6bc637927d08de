//! Redis Tier - Networked Key-Value Cache
//!
//! Shared cache medium reachable over the network. The connection is
//! established lazily on first use and reused (multiplexed) afterwards; a
//! failed connect is retried on the next operation. Every command is bounded
//! by `command_timeout` and a timeout counts as a tier error.
//!
//! Entries are stored as a hash `{data, format}` under `key_prefix + key`,
//! with `EXPIRE` applied when a TTL is given.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::RedisResult;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::entry::CacheEntry;
use super::tier::{CacheTier, CacheTierStats, TierCounters};
use crate::config::duration_serde;
use crate::error::{Error, Result};

const DATA_FIELD: &str = "data";
const FORMAT_FIELD: &str = "format";

/// Keys requested per SCAN round trip
const SCAN_BATCH: usize = 500;

/// Redis tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisTierConfig {
    /// Probe priority (lower = checked first)
    pub priority: u32,
    /// Connection URL
    pub url: String,
    /// Prefix applied to every key owned by this tier
    pub key_prefix: String,
    /// Bound on establishing the connection
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// Bound on every individual command
    #[serde(with = "duration_serde")]
    pub command_timeout: Duration,
}

impl Default for RedisTierConfig {
    fn default() -> Self {
        Self {
            priority: 2,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "morphcache:".to_string(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// Networked key-value tier backed by Redis
pub struct RedisTier {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
    config: RedisTierConfig,
    counters: TierCounters,
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTier")
            .field("url", &self.config.url)
            .field("key_prefix", &self.config.key_prefix)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisTier {
    /// Create the tier. Only the URL is validated here; no connection is
    /// made until the first operation.
    pub fn new(config: RedisTierConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            counters: TierCounters::new("redis"),
            config,
        })
    }

    /// Tier configuration
    pub fn config(&self) -> &RedisTierConfig {
        &self.config
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>> {
        let full_key = self.full_key(key);
        let fields: HashMap<String, Vec<u8>> = self
            .run("get", |mut conn| async move {
                redis::cmd("HGETALL")
                    .arg(&full_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(decode_hash(fields))
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        let after = self.config.connect_timeout;
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let conn = tokio::time::timeout(
                    after,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                .map_err(|_| Error::Timeout {
                    operation: "redis connect".to_string(),
                    after,
                })??;
                info!("Redis tier connected to {}", self.config.url);
                Ok::<_, Error>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Run one command under the command timeout, counting failures
    async fn run<T, F, Fut>(&self, op: &str, command: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let result = async {
            let conn = self.conn().await?;
            let after = self.config.command_timeout;
            match tokio::time::timeout(after, command(conn)).await {
                Ok(reply) => reply.map_err(Error::from),
                Err(_) => Err(Error::Timeout {
                    operation: format!("redis {}", op),
                    after,
                }),
            }
        }
        .await;

        if result.is_err() {
            self.counters.record_error(op);
        }
        result
    }

    /// Count keys under the tier prefix
    async fn scan_keys(&self) -> Result<Vec<String>> {
        let pattern = format!("{}*", self.config.key_prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let pattern = pattern.as_str();
            let (next, batch): (u64, Vec<String>) = self
                .run("scan", |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}

/// Decode a `{data, format}` hash; an empty hash is a miss
fn decode_hash(mut fields: HashMap<String, Vec<u8>>) -> Option<CacheEntry> {
    let data = fields.remove(DATA_FIELD)?;
    let format = fields
        .remove(FORMAT_FIELD)
        .and_then(|raw| String::from_utf8(raw).ok())
        .filter(|f| !f.is_empty());

    Some(match format {
        Some(format) => CacheEntry::with_format(Bytes::from(data), format),
        None => CacheEntry::new(Bytes::from(data)),
    })
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &str {
        "redis"
    }

    fn priority(&self) -> u32 {
        self.config.priority
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.fetch(key).await? {
            Some(entry) => {
                self.counters.record_hit();
                Ok(Some(entry))
            }
            None => {
                self.counters.record_miss();
                Ok(None)
            }
        }
    }

    async fn peek(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.fetch(key).await
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Option<Duration>) -> Result<()> {
        let full_key = self.full_key(key);
        let data = entry.data().clone();
        let format = entry.format().unwrap_or_default().to_string();

        self.run("set", |mut conn| async move {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("DEL")
                .arg(&full_key)
                .ignore()
                .cmd("HSET")
                .arg(&full_key)
                .arg(DATA_FIELD)
                .arg(data.as_ref())
                .arg(FORMAT_FIELD)
                .arg(&format)
                .ignore();
            if let Some(ttl) = ttl {
                // EXPIRE has second granularity; never round a TTL down to 0
                pipe.cmd("EXPIRE")
                    .arg(&full_key)
                    .arg(ttl.as_secs().max(1))
                    .ignore();
            }
            pipe.query_async(&mut conn).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let removed: i64 = self
            .run("delete", |mut conn| async move {
                redis::cmd("DEL").arg(&full_key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        self.run("exists", |mut conn| async move {
            redis::cmd("EXISTS").arg(&full_key).query_async(&mut conn).await
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        let keys = self.scan_keys().await?;
        let mut removed: i64 = 0;

        for batch in keys.chunks(SCAN_BATCH) {
            let count: i64 = self
                .run("clear", |mut conn| async move {
                    redis::cmd("DEL").arg(batch).query_async(&mut conn).await
                })
                .await?;
            removed += count;
        }

        info!("Cleared {} Redis tier entries", removed);
        Ok(())
    }

    async fn stats(&self) -> CacheTierStats {
        let key_count = match self.scan_keys().await {
            Ok(keys) => keys.len() as u64,
            Err(e) => {
                debug!("Redis tier key count unavailable: {}", e);
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
    use assert_matches::assert_matches;

    fn unreachable_tier() -> RedisTier {
        // Port 1 is never a Redis server; connects fail fast
        RedisTier::new(RedisTierConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_full_key_applies_prefix() {
        let tier = RedisTier::new(RedisTierConfig::default()).unwrap();
        assert_eq!(tier.full_key("image:a.png"), "morphcache:image:a.png");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = RedisTier::new(RedisTierConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        assert_matches!(result, Err(Error::Redis(_)));
    }

    #[test]
    fn test_debug_omits_connection() {
        let tier = RedisTier::new(RedisTierConfig::default()).unwrap();
        let rendered = format!("{:?}", tier);
        assert!(rendered.starts_with("RedisTier"));
        assert!(rendered.contains("redis://127.0.0.1:6379"));
        assert!(rendered.contains("connected: false"));
    }

    #[test]
    fn test_decode_hash() {
        let mut fields = HashMap::new();
        fields.insert(DATA_FIELD.to_string(), b"payload".to_vec());
        fields.insert(FORMAT_FIELD.to_string(), b"webp".to_vec());
        let entry = decode_hash(fields).unwrap();
        assert_eq!(entry.data().as_ref(), b"payload");
        assert_eq!(entry.format(), Some("webp"));

        let mut fields = HashMap::new();
        fields.insert(DATA_FIELD.to_string(), b"raw".to_vec());
        fields.insert(FORMAT_FIELD.to_string(), Vec::new());
        assert_eq!(decode_hash(fields).unwrap().format(), None);

        assert!(decode_hash(HashMap::new()).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_tier_error() {
        let tier = unreachable_tier();

        assert!(tier.get("k").await.is_err());
        assert!(tier
            .set("k", &CacheEntry::new(Bytes::from_static(b"v")), None)
            .await
            .is_err());

        assert!(tier.peek("k").await.is_err());

        let stats = tier.stats().await;
        assert!(stats.error_count >= 3);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.key_count, 0);
    }
}
