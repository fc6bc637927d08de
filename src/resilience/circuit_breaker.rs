//! Circuit Breaker
//!
//! Protects calls to an unreliable dependency (the upstream fetch/transform
//! path). Outcomes are kept in a rolling time window; once the window holds
//! enough requests and the failure percentage reaches the threshold the
//! circuit opens and calls are rejected until the reset timeout has passed.
//! After that a single trial call is let through (half-open): success closes
//! the circuit, failure reopens it for another full timeout.
//!
//! All state lives behind one mutex, so pruning the window, evaluating the
//! failure rate and transitioning happen as one step. The lock is never held
//! while the protected call runs.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::duration_serde;
use crate::error::{Error, Result};
use crate::metrics::BREAKER_TRANSITIONS;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0-100) at or above which the circuit opens
    pub failure_threshold: f64,
    /// Time the circuit stays open before a trial call is allowed
    #[serde(with = "duration_serde")]
    pub reset_timeout: Duration,
    /// Span of the rolling outcome window
    #[serde(with = "duration_serde")]
    pub rolling_window: Duration,
    /// Outcomes required in the window before the rate is evaluated
    pub minimum_requests: usize,
    /// Calls running longer than this are abandoned and counted as failures
    #[serde(with = "duration_serde::option")]
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 50.0,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(60),
            minimum_requests: 5,
            call_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected
    Open,
    /// One trial call decides between closing and reopening
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Failures since the circuit last closed
    pub failures: u64,
    /// Successes since the circuit last closed
    pub successes: u64,
    /// Outcomes currently in the rolling window
    pub window_requests: usize,
    /// Failure percentage over the rolling window
    pub failure_rate: f64,
    /// Time left until a trial call is allowed (open circuits only)
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    window: VecDeque<(Instant, Outcome)>,
    reopen_at: Option<Instant>,
    trial_in_flight: bool,
    failures: u64,
    successes: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            reopen_at: None,
            trial_in_flight: false,
            failures: 0,
            successes: 0,
        }
    }

    fn prune(&mut self, now: Instant, span: Duration) {
        let Some(cutoff) = now.checked_sub(span) else {
            return;
        };
        while self.window.front().is_some_and(|(at, _)| *at < cutoff) {
            self.window.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failed = self
            .window
            .iter()
            .filter(|(_, outcome)| *outcome == Outcome::Failure)
            .count();
        failed as f64 / self.window.len() as f64 * 100.0
    }

    fn reopen_due(&self, now: Instant) -> bool {
        self.reopen_at.is_some_and(|at| now >= at)
    }
}

/// Circuit breaker guarding one dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, without triggering the open → half-open transition
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Check whether calls are currently rejected.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// here and reports "not open".
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if inner.reopen_due(Instant::now()) {
                self.transition(&mut inner, CircuitState::HalfOpen);
                return false;
            }
            return true;
        }
        false
    }

    /// Run `call` under protection.
    ///
    /// Fails with [`Error::CircuitOpen`] without running `call` while the
    /// circuit is open. Otherwise the call's outcome (including a timeout) is
    /// recorded and returned.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.admit()?;

        let result = match self.config.call_timeout {
            Some(after) => match tokio::time::timeout(after, call()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: format!("call through circuit '{}'", self.name),
                    after,
                }),
            },
            None => call().await,
        };

        permit.settle(result.is_ok());
        result
    }

    /// Run `call` under protection, answering with `fallback` when the
    /// circuit is open or the call fails. The failure is recorded before the
    /// fallback runs.
    pub async fn execute_with_fallback<T, F, Fut, FB, FutB>(&self, call: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(Error) -> FutB,
        FutB: Future<Output = Result<T>>,
    {
        match self.execute(call).await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Circuit '{}' falling back: {}", self.name, e);
                fallback(e).await
            }
        }
    }

    /// Record a successful call made outside [`execute`](Self::execute)
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.successes += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                self.close(&mut inner);
            }
            CircuitState::Closed | CircuitState::Open => {
                inner.window.push_back((now, Outcome::Success));
                inner.prune(now, self.config.rolling_window);
            }
        }
    }

    /// Record a failed call made outside [`execute`](Self::execute)
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.reopen_at = Some(now + self.config.reset_timeout);
                warn!("Circuit '{}' trial call failed; reopening", self.name);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.window.push_back((now, Outcome::Failure));
                inner.prune(now, self.config.rolling_window);

                let rate = inner.failure_rate();
                if inner.window.len() >= self.config.minimum_requests
                    && rate >= self.config.failure_threshold
                {
                    inner.reopen_at = Some(now + self.config.reset_timeout);
                    warn!(
                        "Circuit '{}' opening: {:.1}% of {} requests failed",
                        self.name,
                        rate,
                        inner.window.len()
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {
                // Late result of a call admitted before the circuit opened
                inner.window.push_back((now, Outcome::Failure));
                inner.prune(now, self.config.rolling_window);
            }
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.prune(now, self.config.rolling_window);

        CircuitBreakerStats {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            window_requests: inner.window.len(),
            failure_rate: inner.failure_rate(),
            retry_in: match inner.state {
                CircuitState::Open => inner
                    .reopen_at
                    .map(|at| at.saturating_duration_since(now)),
                _ => None,
            },
        }
    }

    /// Force the circuit closed and forget all history
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
        info!("Circuit '{}' manually reset", self.name);
    }

    fn admit(&self) -> Result<Permit<'_>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open && inner.reopen_due(now) {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!("Circuit '{}' admitting trial call", self.name);
                Ok(Permit::new(self, true))
            }
            _ => Err(Error::CircuitOpen {
                name: self.name.clone(),
            }),
        }
    }

    fn close(&self, inner: &mut BreakerState) {
        inner.window.clear();
        inner.reopen_at = None;
        inner.trial_in_flight = false;
        inner.failures = 0;
        inner.successes = 0;
        self.transition(inner, CircuitState::Closed);
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        if inner.state == to {
            return;
        }
        info!("Circuit '{}' {} -> {}", self.name, inner.state, to);
        inner.state = to;
        BREAKER_TRANSITIONS
            .with_label_values(&[self.name.as_str(), to.as_str()])
            .inc();
    }
}

/// Admission of one call. A trial permit dropped before its outcome is
/// recorded (the caller was cancelled) frees the trial slot again.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
