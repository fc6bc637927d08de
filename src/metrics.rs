//! Prometheus Metrics
//!
//! Process-wide counters for the cache tiers, circuit breakers, request
//! coalescing and disk eviction. Serving the exposition over HTTP is left to
//! the embedding application; [`render`] produces the text format.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Registry holding every morphcache metric
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Tier operations by tier name, operation and outcome (hit/miss/ok/error)
pub static TIER_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "morphcache_tier_operations_total",
            "Cache tier operations by tier, operation and outcome",
        ),
        &["tier", "op", "outcome"],
    ))
});

/// Circuit breaker state transitions
pub static BREAKER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "morphcache_circuit_transitions_total",
            "Circuit breaker state transitions by breaker and target state",
        ),
        &["breaker", "to"],
    ))
});

/// Coalesced requests by role (leader ran the producer, joined waited on it)
pub static COALESCED_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "morphcache_coalesced_requests_total",
            "Requests entering the coalescer by role",
        ),
        &["role"],
    ))
});

/// Files removed by the eviction engine
pub static EVICTED_FILES: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "morphcache_evicted_files_total",
        "Files removed from the filesystem tier by eviction",
    ))
});

/// Bytes reclaimed by the eviction engine
pub static EVICTED_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "morphcache_evicted_bytes_total",
        "Bytes reclaimed from the filesystem tier by eviction",
    ))
});

fn register<M>(metric: prometheus::Result<M>) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    // Metric names and labels are static, so construction cannot fail.
    let metric = metric.expect("static metric definition is valid");
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        tracing::warn!("Failed to register metric: {}", e);
    }
    metric
}

/// Record one tier operation outcome
pub fn record_tier_op(tier: &str, op: &str, outcome: &str) {
    TIER_OPERATIONS
        .with_label_values(&[tier, op, outcome])
        .inc();
}

/// Render all metrics in the Prometheus text exposition format
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics not UTF-8: {}", e)))
}
