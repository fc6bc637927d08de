//! Resilience primitives for the producer path
//!
//! - [`CircuitBreaker`]: stop calling a failing upstream, probe for recovery
//! - [`RequestCoalescer`]: run one producer per key no matter how many
//!   callers miss at once

pub mod circuit_breaker;
pub mod coalescer;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use coalescer::RequestCoalescer;
