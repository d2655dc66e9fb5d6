//! Per-backend circuit breakers.
//!
//! Each backend gets a three-state breaker: Closed passes everything, Open
//! fails fast until a recovery timeout elapses, HalfOpen admits a bounded
//! number of probe requests. The circuit trips on consecutive failures or,
//! once enough requests have been seen, on the overall failure rate. Any
//! failure while half-open re-opens the circuit immediately.

use crate::metrics::Metrics;
use kortex_core::{CircuitBreakerConfig, KortexError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Failing fast, requests are rejected.
    Open,
    /// Recovery probing, a limited number of requests pass.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
}

struct BreakerInner {
    state: CircuitState,
    failures: u64,
    successes: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    half_open_requests: u32,
    opened_at: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            half_open_requests: 0,
            opened_at: None,
        }
    }
}

/// Circuit breaker for a single backend.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    metrics: Option<Arc<Metrics>>,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let name = name.into();
        if let Some(m) = &metrics {
            m.set_circuit_state(&name, CircuitState::Closed);
        }
        Self {
            name,
            config,
            metrics,
            inner: RwLock::new(BreakerInner::new()),
        }
    }

    /// Check whether a request may proceed. In the Open state the first
    /// call after the recovery timeout transitions to HalfOpen and counts
    /// as its first probe.
    pub fn allow(&self) -> Result<()> {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout() {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_requests = 1;
                    Ok(())
                } else {
                    if let Some(m) = &self.metrics {
                        m.record_circuit_rejection(&self.name);
                    }
                    Err(KortexError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests >= self.config.half_open_max_requests {
                    if let Some(m) = &self.metrics {
                        m.record_circuit_rejection(&self.name);
                    }
                    return Err(KortexError::HalfOpenSaturated);
                }
                inner.half_open_requests += 1;
                Ok(())
            }
        }
    }

    /// Record a successful request; may close a half-open circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        inner.successes += 1;
        inner.total_requests += 1;
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_requests = inner.half_open_requests.saturating_sub(1);
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Record a failed request; may open the circuit.
    pub fn record_failure(&self) {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        inner.failures += 1;
        inner.total_requests += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;

        match inner.state {
            CircuitState::Closed => {
                if self.should_trip(&inner) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_requests = inner.half_open_requests.saturating_sub(1);
                // Any failure while probing re-opens immediately
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        if inner.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        if self.config.failure_rate_threshold > 0.0
            && inner.total_requests >= u64::from(self.config.min_requests_for_rate)
            && inner.total_requests > 0
        {
            let rate = inner.failures as f64 / inner.total_requests as f64;
            if rate >= self.config.failure_rate_threshold {
                return true;
            }
        }
        false
    }

    fn transition(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;

        if let Some(m) = &self.metrics {
            m.set_circuit_state(&self.name, new_state);
        }

        match new_state {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                if let Some(m) = &self.metrics {
                    m.record_circuit_trip(&self.name);
                }
                info!(
                    backend = %self.name,
                    previous = %old_state,
                    consecutive_failures = inner.consecutive_failures,
                    timeout_ms = self.config.timeout_ms,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.half_open_requests = 0;
                inner.consecutive_successes = 0;
                info!(backend = %self.name, previous = %old_state, "circuit breaker half-open");
            }
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
                inner.total_requests = 0;
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
                info!(backend = %self.name, previous = %old_state, "circuit breaker closed");
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().expect("breaker lock poisoned").state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read().expect("breaker lock poisoned");
        CircuitBreakerStats {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: inner.total_requests,
        }
    }

    /// Force the breaker closed and zero all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        self.transition(&mut inner, CircuitState::Closed);
        info!(backend = %self.name, "circuit breaker manually reset");
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Lazily creates and holds one breaker per backend name.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            metrics,
        }
    }

    /// Fetch the breaker for a backend, creating it on first use.
    pub fn breaker(&self, backend_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .expect("manager lock poisoned")
            .get(backend_name)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().expect("manager lock poisoned");
        // Double-check after acquiring the write lock
        if let Some(breaker) = breakers.get(backend_name) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(
            backend_name,
            self.config.clone(),
            self.metrics.clone(),
        ));
        breakers.insert(backend_name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn allow(&self, backend_name: &str) -> Result<()> {
        self.breaker(backend_name).allow()
    }

    pub fn record_success(&self, backend_name: &str) {
        self.breaker(backend_name).record_success();
    }

    pub fn record_failure(&self, backend_name: &str) {
        self.breaker(backend_name).record_failure();
    }

    pub fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .read()
            .expect("manager lock poisoned")
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in self
            .breakers
            .read()
            .expect("manager lock poisoned")
            .values()
        {
            breaker.reset();
        }
    }

    /// Run a closure under circuit-breaker protection, recording the
    /// outcome.
    pub async fn execute<F, Fut, T>(&self, backend_name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.allow(backend_name)?;
        match f().await {
            Ok(value) => {
                self.record_success(backend_name);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(backend_name);
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
