//! Request Coalescer (single-flight)
//!
//! Collapses concurrent requests for the same key into one producer run.
//! The first caller registers a shared pending result; later callers for the
//! same key join it instead of starting another producer. The registration
//! is removed as soon as the producer settles, before any caller observes
//! the result, so the next request after completion starts a fresh run.
//!
//! The producer runs on its own task, so a caller that is dropped or times
//! out never strands the registration: the run completes, deregisters and
//! is still observed by every caller that joined it.
//!
//! A failure is handed to every joined caller as the same
//! `Arc`-shared error.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::{Error, Result};
use crate::metrics::COALESCED_REQUESTS;

type SharedResult<T> = Shared<BoxFuture<'static, std::result::Result<T, Arc<Error>>>>;

/// In-flight registration: generation id plus the shared pending result
struct InFlight<T: Clone> {
    generation: u64,
    result: SharedResult<T>,
}

/// Single-flight executor keyed by string
pub struct RequestCoalescer<T: Clone> {
    in_flight: Arc<DashMap<String, InFlight<T>>>,
    generation: AtomicU64,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty coalescer
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `producer` for `key`, or join the run already in flight.
    ///
    /// `producer` is only invoked by the caller that registers the run, and
    /// its future is spawned onto the runtime. Must be called from within a
    /// Tokio runtime.
    pub async fn execute<F, Fut>(&self, key: &str, producer: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let pending = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                COALESCED_REQUESTS.with_label_values(&["joined"]).inc();
                tracing::debug!("Joining in-flight request for {}", key);
                existing.get().result.clone()
            }
            Entry::Vacant(slot) => {
                COALESCED_REQUESTS.with_label_values(&["leader"]).inc();
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let registry = Arc::clone(&self.in_flight);
                let owned_key = key.to_string();
                let run = producer();

                let task = tokio::spawn(async move {
                    let outcome = run.await.map_err(Arc::new);
                    // Deregister before any waiter sees the outcome
                    registry.remove_if(&owned_key, |_, flight| flight.generation == generation);
                    outcome
                });

                let registry = Arc::clone(&self.in_flight);
                let owned_key = key.to_string();
                let result = async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            registry
                                .remove_if(&owned_key, |_, flight| flight.generation == generation);
                            Err(Arc::new(Error::Internal(format!(
                                "producer task for {} failed: {}",
                                owned_key, e
                            ))))
                        }
                    }
                }
                .boxed()
                .shared();

                slot.insert(InFlight {
                    generation,
                    result: result.clone(),
                });
                result
            }
        };

        pending.await.map_err(Error::Shared)
    }

    /// Number of keys with a producer currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Check whether a producer for `key` is running
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }
}

impl<T> Default for RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
