//! Artifact Pipeline
//!
//! The serve path: answer from cache when possible, otherwise produce the
//! artifact once (however many callers miss at the same time), under
//! circuit-breaker protection, and write it through every tier.
//!
//! ```text
//! get_or_produce ──▶ MultiTierCache ──hit──▶ Served::Cache(tier)
//!                        │ miss
//!                        ▼
//!                 RequestCoalescer(key)
//!                        │ leader only
//!                        ▼
//!                 CircuitBreaker::execute(producer) ──▶ MultiTierCache::set
//!                        │
//!                        ▼
//!                 Served::Produced (every caller)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::cache::{
    CacheEntry, CacheTier, FilesystemTier, MemoryTier, MultiTierCache, Params, RedisTier,
};
use crate::config::CoreConfig;
use crate::error::Result;
use crate::resilience::{CircuitBreaker, RequestCoalescer};
use crate::scheduler::ScheduledTask;
use crate::storage::{EvictionEngine, StorageMonitor};

/// Where an artifact came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Served {
    /// Read from the named tier
    Cache(String),
    /// Produced for this request (or a request it was coalesced with)
    Produced,
}

/// Artifact returned to the caller
#[derive(Debug, Clone)]
pub struct Artifact {
    pub entry: CacheEntry,
    pub served: Served,
}

/// Cache-or-produce serve path
pub struct ArtifactPipeline {
    cache: Arc<MultiTierCache>,
    breaker: Arc<CircuitBreaker>,
    coalescer: RequestCoalescer<CacheEntry>,
}

impl ArtifactPipeline {
    pub fn new(cache: Arc<MultiTierCache>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            cache,
            breaker,
            coalescer: RequestCoalescer::new(),
        }
    }

    pub fn cache(&self) -> &Arc<MultiTierCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn coalescer(&self) -> &RequestCoalescer<CacheEntry> {
        &self.coalescer
    }

    /// Serve `(namespace, identifier, params)` from cache, or run `producer`.
    ///
    /// Concurrent misses for the same key share one producer run and one
    /// write-through. An open circuit fails with
    /// [`Error::CircuitOpen`](crate::Error::CircuitOpen) (check with
    /// [`Error::is_circuit_open`](crate::Error::is_circuit_open)); producer
    /// failures reach every coalesced caller. Nothing is cached on failure.
    #[instrument(skip(self, params, producer))]
    pub async fn get_or_produce<F, Fut>(
        &self,
        namespace: &str,
        identifier: &str,
        params: Option<&Params>,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Artifact>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry>> + Send + 'static,
    {
        if let Some(hit) = self.cache.lookup(namespace, identifier, params).await {
            return Ok(Artifact {
                entry: hit.entry,
                served: Served::Cache(hit.tier),
            });
        }

        let key = self.cache.key_for(namespace, identifier, params);
        let entry = self
            .coalescer
            .execute(key.as_str(), || {
                let cache = Arc::clone(&self.cache);
                let breaker = Arc::clone(&self.breaker);
                let key = key.clone();
                let run = producer();

                async move {
                    let entry = breaker.execute(|| run).await?;
                    let outcome = cache.set_key(&key, &entry, ttl).await;
                    debug!(
                        "Produced {} ({} bytes), stored in {} tiers",
                        key,
                        entry.size(),
                        outcome.succeeded.len()
                    );
                    Ok(entry)
                }
            })
            .await?;

        Ok(Artifact {
            entry,
            served: Served::Produced,
        })
    }
}

/// Every component of the core, assembled from one configuration
pub struct CacheCore {
    pub pipeline: ArtifactPipeline,
    pub cache: Arc<MultiTierCache>,
    pub memory: Arc<MemoryTier>,
    pub monitor: Arc<StorageMonitor>,
    pub eviction: Arc<EvictionEngine>,
}

impl CacheCore {
    /// Build tiers, monitor, eviction engine and serve path
    pub async fn from_config(config: &CoreConfig) -> Result<Self> {
        config.validate()?;

        let monitor = Arc::new(StorageMonitor::new(
            &config.filesystem.root,
            config.storage.clone(),
            config.eviction.clone(),
        ));
        let filesystem = FilesystemTier::new(config.filesystem.clone())
            .await?
            .with_access_monitor(Arc::clone(&monitor));
        let memory = Arc::new(MemoryTier::with_config(config.memory.clone()));

        let mut tiers: Vec<Arc<dyn CacheTier>> = vec![memory.clone(), Arc::new(filesystem)];
        if let Some(redis) = &config.redis {
            tiers.push(Arc::new(RedisTier::new(redis.clone())?));
        }

        let cache = Arc::new(MultiTierCache::new(
            tiers,
            config.ttl.clone(),
            config.preload.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            "producer",
            config.circuit_breaker.clone(),
        ));

        Ok(Self {
            pipeline: ArtifactPipeline::new(Arc::clone(&cache), breaker),
            cache,
            memory,
            eviction: Arc::new(EvictionEngine::new(Arc::clone(&monitor))),
            monitor,
        })
    }

    /// Start the memory sweep, storage scan, threshold eviction and (when
    /// enabled) preloading tasks
    pub fn start_background_tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks = vec![
            self.memory.start_sweeper(),
            self.monitor.start_periodic_scan(),
            self.eviction.start_threshold_eviction(),
        ];
        if let Some(preload) = self.cache.start_preloading() {
            tasks.push(preload);
        }
        info!("Started {} background tasks", tasks.len());
        tasks
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTierConfig;
    use crate::config::{PreloadConfig, TtlConfig};
    use crate::error::Error;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use bytes::Bytes;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(breaker: CircuitBreakerConfig) -> (ArtifactPipeline, Arc<MemoryTier>) {
        let memory = Arc::new(MemoryTier::with_config(MemoryTierConfig::default()));
        let cache = Arc::new(MultiTierCache::new(
            vec![memory.clone()],
            TtlConfig::default(),
            PreloadConfig::default(),
        ));
        let breaker = Arc::new(CircuitBreaker::new("producer", breaker));
        (ArtifactPipeline::new(cache, breaker), memory)
    }

    #[tokio::test]
    async fn test_miss_produces_then_hits() {
        let (pipeline, _) = pipeline(CircuitBreakerConfig::default());
        let params = crate::cache::KeyStrategy::params([("width", 64)]);

        let first = pipeline
            .get_or_produce("image", "cat.jpg", Some(&params), None, || async {
                Ok(CacheEntry::with_format(Bytes::from_static(b"small"), "webp"))
            })
            .await
            .unwrap();
        assert_eq!(first.served, Served::Produced);

        let second = pipeline
            .get_or_produce("image", "cat.jpg", Some(&params), None, || async {
                Err(Error::Producer("must not run".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(second.served, Served::Cache("memory".to_string()));
        assert_eq!(second.entry.data().as_ref(), b"small");
    }

    #[tokio::test]
    async fn test_concurrent_misses_produce_once() {
        let (pipeline, memory) = pipeline(CircuitBreakerConfig::default());
        let pipeline = Arc::new(pipeline);
        let runs = Arc::new(AtomicUsize::new(0));

        let callers = (0..10).map(|_| {
            let pipeline = pipeline.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                pipeline
                    .get_or_produce("image", "dog.jpg", None, None, move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(CacheEntry::new(Bytes::from_static(b"dog")))
                    })
                    .await
            })
        });

        for result in join_all(callers).await {
            let artifact = result.unwrap().unwrap();
            assert_eq!(artifact.entry.data().as_ref(), b"dog");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(memory.len(), 1);
        assert_eq!(pipeline.coalescer().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_still_caches_result() {
        let (pipeline, memory) = pipeline(CircuitBreakerConfig::default());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            pipeline.get_or_produce("image", "huge.tiff", None, None, || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(CacheEntry::new(Bytes::from_static(b"tiff")))
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pipeline.coalescer().in_flight(), 0);
        assert_eq!(memory.len(), 1);

        let artifact = pipeline
            .get_or_produce("image", "huge.tiff", None, None, || async {
                Err(Error::Producer("must not run".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(artifact.served, Served::Cache("memory".to_string()));
    }

    #[tokio::test]
    async fn test_failures_trip_breaker_and_are_not_cached() {
        let (pipeline, memory) = pipeline(CircuitBreakerConfig {
            minimum_requests: 2,
            reset_timeout: Duration::from_secs(60),
            ..Default::default()
        });

        for _ in 0..2 {
            let err = pipeline
                .get_or_produce("image", "broken.jpg", None, None, || async {
                    Err(Error::Producer("upstream 500".to_string()))
                })
                .await
                .unwrap_err();
            assert!(err.is_producer_failure());
        }
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);
        assert!(memory.is_empty());

        let err = pipeline
            .get_or_produce("image", "other.jpg", None, None, || async {
                Ok(CacheEntry::new(Bytes::from_static(b"x")))
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert!(!err.is_producer_failure());
    }
}
