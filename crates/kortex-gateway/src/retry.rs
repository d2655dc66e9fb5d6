//! Retry with exponential backoff, composable with the circuit breaker.
//!
//! The retrier drives a fallible attempt function. Transport errors are
//! classified through [`KortexError::Upstream`] flags (connection vs
//! timeout), HTTP statuses through the configured retryable set.
//! Cancellation wins over everything: it aborts the backoff sleep and is
//! never retried.

use crate::circuit_breaker::CircuitBreakerManager;
use crate::metrics::Metrics;
use kortex_core::{KortexError, Result, RetryConfig};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome {
    /// Total attempts made (at least 1 unless rejected before the first).
    pub attempts: u32,
    /// Terminal error, if the operation did not succeed.
    pub last_error: Option<KortexError>,
    /// Wall-clock time including backoff sleeps.
    pub duration: Duration,
    /// Last observed HTTP status (0 when no response was received).
    pub status_code: u16,
}

impl RetryOutcome {
    pub fn is_success(&self) -> bool {
        self.last_error.is_none()
    }
}

/// Executes attempt functions with exponential backoff and jitter.
pub struct Retrier {
    config: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Retrier {
    pub fn new(config: RetryConfig, metrics: Option<Arc<Metrics>>) -> Self {
        Self { config, metrics }
    }

    /// Run `f` for up to `max_retries + 1` attempts.
    ///
    /// `f` returns `Ok(status)` when a response was received (any status)
    /// and `Err` for transport failures. A terminal attempt that still
    /// ended on a retryable status surfaces as
    /// [`KortexError::BackendStatus`] so callers and the circuit breaker
    /// see a coherent failure.
    pub async fn run<F, Fut>(
        &self,
        backend_name: &str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<u16>>,
    {
        let start = Instant::now();
        let mut outcome = RetryOutcome {
            attempts: 0,
            last_error: None,
            duration: Duration::ZERO,
            status_code: 0,
        };

        for attempt in 0..=self.config.max_retries {
            outcome.attempts = attempt + 1;
            if let Some(m) = &self.metrics {
                m.record_retry_attempt(backend_name, attempt);
            }

            match f(attempt).await {
                Ok(status) => {
                    outcome.status_code = status;
                    if !self.is_retryable_status(status) {
                        outcome.last_error = None;
                        outcome.duration = start.elapsed();
                        if attempt > 0 {
                            if let Some(m) = &self.metrics {
                                m.record_retry_success(backend_name);
                            }
                            debug!(
                                backend = backend_name,
                                attempts = outcome.attempts,
                                "request succeeded after retry"
                            );
                        }
                        return outcome;
                    }
                    outcome.last_error = Some(KortexError::BackendStatus(status));
                }
                Err(e) => {
                    outcome.status_code = 0;
                    outcome.last_error = Some(e);
                }
            }

            if !self.should_retry(cancel, &outcome, attempt) {
                break;
            }

            let backoff = self.calculate_backoff(attempt);
            debug!(
                backend = backend_name,
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                status = outcome.status_code,
                "retrying request"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.last_error = Some(KortexError::Cancelled);
                    outcome.duration = start.elapsed();
                    return outcome;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        outcome.duration = start.elapsed();
        if let Some(m) = &self.metrics {
            m.record_retry_exhausted(backend_name);
        }
        info!(
            backend = backend_name,
            attempts = outcome.attempts,
            duration_ms = outcome.duration.as_millis() as u64,
            last_error = outcome.last_error.as_ref().map(|e| e.to_string()),
            "retries exhausted"
        );
        outcome
    }

    fn should_retry(&self, cancel: &CancellationToken, outcome: &RetryOutcome, attempt: u32) -> bool {
        if attempt >= self.config.max_retries {
            return false;
        }
        if cancel.is_cancelled() {
            return false;
        }
        if self.is_retryable_status(outcome.status_code) {
            return true;
        }
        outcome
            .last_error
            .as_ref()
            .is_some_and(|e| self.is_retryable_error(e))
    }

    fn is_retryable_status(&self, status: u16) -> bool {
        status != 0 && self.config.retryable_status_codes.contains(&status)
    }

    fn is_retryable_error(&self, error: &KortexError) -> bool {
        match error {
            KortexError::Cancelled => false,
            KortexError::Upstream {
                connect, timeout, ..
            } => {
                if *timeout {
                    return self.config.retry_on_timeout;
                }
                if *connect {
                    return self.config.retry_on_connection_error;
                }
                // Generic network failure
                self.config.retry_on_connection_error
            }
            KortexError::BackendStatus(status) => self.is_retryable_status(*status),
            _ => false,
        }
    }

    /// Backoff for an attempt: `initial · multiplierᵃ`, scaled by a jitter
    /// factor in `[1 − jitter/2, 1 + jitter/2]`, capped at the maximum.
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff().as_secs_f64()
            * self.config.backoff_multiplier.powi(attempt as i32);

        let jittered = if self.config.jitter > 0.0 {
            let factor = 1.0 - self.config.jitter / 2.0
                + rand::thread_rng().gen::<f64>() * self.config.jitter;
            base * factor
        } else {
            base
        };

        let capped = jittered.min(self.config.max_backoff().as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

// ---------------------------------------------------------------------------
// Retry + circuit breaker composition
// ---------------------------------------------------------------------------

/// Retry wrapped in a circuit-breaker gate: the breaker is consulted once
/// up front, the retrier runs the attempts, and the terminal outcome is
/// fed back into the breaker.
pub struct RetryWithCircuitBreaker {
    retrier: Retrier,
    breakers: Arc<CircuitBreakerManager>,
}

impl RetryWithCircuitBreaker {
    pub fn new(retrier: Retrier, breakers: Arc<CircuitBreakerManager>) -> Self {
        Self { retrier, breakers }
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    pub async fn execute<F, Fut>(
        &self,
        backend_name: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<u16>>,
    {
        if let Err(e) = self.breakers.allow(backend_name) {
            return RetryOutcome {
                attempts: 0,
                last_error: Some(e),
                duration: Duration::ZERO,
                status_code: 0,
            };
        }

        let outcome = self.retrier.run(backend_name, cancel, f).await;

        if outcome.is_success() {
            self.breakers.record_success(backend_name);
        } else {
            self.breakers.record_failure(backend_name);
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
