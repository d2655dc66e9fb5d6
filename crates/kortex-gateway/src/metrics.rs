//! Prometheus metrics for the gateway.
//!
//! A [`Metrics`] struct owns every collector on a private registry —
//! keeping tests deterministic and avoiding collisions with the global
//! default registry — and exposes `record_*` helpers used by the proxy,
//! reconcilers, circuit breakers, and retrier. `/metrics` renders the
//! registry in Prometheus text exposition format.

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::circuit_breaker::CircuitState;

/// Holds all Prometheus collectors for the gateway.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Total requests, labelled by route, backend, and HTTP status.
    pub requests_total: IntCounterVec,
    /// Request duration in seconds, labelled by route and backend.
    pub request_duration_seconds: HistogramVec,
    /// Request errors, labelled by route, backend, and error type.
    pub request_errors_total: IntCounterVec,
    /// Backend health gauge (1 = healthy, 0 = not), labelled by backend
    /// and namespace.
    pub backend_health: GaugeVec,
    /// In-flight requests per backend.
    pub active_requests: IntGaugeVec,
    /// Rate-limit rejections, labelled by route.
    pub rate_limit_hits_total: IntCounterVec,
    /// Experiment variant assignments.
    pub experiment_assignments_total: IntCounterVec,
    /// Cost incurred, labelled by route and backend.
    pub cost_total: prometheus::CounterVec,
    /// Tokens processed, labelled by route, backend, and direction.
    pub tokens_total: IntCounterVec,
    /// Fallback activations, labelled by route and the from/to pair.
    pub fallbacks_total: IntCounterVec,
    /// Non-healthy last-resort backend uses, labelled by route and backend.
    pub last_resort_total: IntCounterVec,
    /// Circuit state gauge (0 = closed, 1 = open, 2 = half-open).
    pub circuit_breaker_state: GaugeVec,
    pub circuit_breaker_trips_total: IntCounterVec,
    pub circuit_breaker_rejections_total: IntCounterVec,
    /// Retry attempts, labelled by backend and attempt index.
    pub retry_attempts_total: IntCounterVec,
    pub retry_successes_total: IntCounterVec,
    pub retry_exhausted_total: IntCounterVec,
}

impl Metrics {
    /// Create a `Metrics` instance with all collectors registered.
    ///
    /// # Panics
    ///
    /// Panics if a collector fails to register; this runs once at startup
    /// where a panic means misconfiguration.
    pub fn new() -> Self {
        let registry = Registry::new();

        fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
            let vec = IntCounterVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|e| panic!("metric {name}: {e}"));
            registry
                .register(Box::new(vec.clone()))
                .unwrap_or_else(|e| panic!("register {name}: {e}"));
            vec
        }

        fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
            let vec = GaugeVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|e| panic!("metric {name}: {e}"));
            registry
                .register(Box::new(vec.clone()))
                .unwrap_or_else(|e| panic!("register {name}: {e}"));
            vec
        }

        let requests_total = counter(
            &registry,
            "kortex_requests_total",
            "Total inference requests processed",
            &["route", "backend", "status"],
        );

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kortex_request_duration_seconds",
                "Request duration in seconds",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["route", "backend"],
        )
        .expect("metric: request_duration_seconds");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");

        let request_errors_total = counter(
            &registry,
            "kortex_request_errors_total",
            "Total request errors",
            &["route", "backend", "error_type"],
        );

        let backend_health = gauge(
            &registry,
            "kortex_backend_health",
            "Backend health status (1=healthy, 0=unhealthy)",
            &["backend", "namespace"],
        );

        let active_requests = IntGaugeVec::new(
            Opts::new("kortex_active_requests", "Currently active requests"),
            &["backend"],
        )
        .expect("metric: active_requests");
        registry
            .register(Box::new(active_requests.clone()))
            .expect("register active_requests");

        let rate_limit_hits_total = counter(
            &registry,
            "kortex_rate_limit_hits_total",
            "Total rate limit rejections",
            &["route"],
        );

        let experiment_assignments_total = counter(
            &registry,
            "kortex_experiment_assignments_total",
            "Total experiment variant assignments",
            &["experiment", "variant"],
        );

        let cost_total = prometheus::CounterVec::new(
            Opts::new("kortex_cost_total", "Total cost incurred"),
            &["route", "backend"],
        )
        .expect("metric: cost_total");
        registry
            .register(Box::new(cost_total.clone()))
            .expect("register cost_total");

        let tokens_total = counter(
            &registry,
            "kortex_tokens_total",
            "Total tokens processed",
            &["route", "backend", "direction"],
        );

        let fallbacks_total = counter(
            &registry,
            "kortex_fallbacks_total",
            "Total fallback chain activations",
            &["route", "from_backend", "to_backend"],
        );

        let last_resort_total = counter(
            &registry,
            "kortex_last_resort_total",
            "Requests sent to a non-healthy last-resort backend",
            &["route", "backend"],
        );

        let circuit_breaker_state = gauge(
            &registry,
            "kortex_circuit_breaker_state",
            "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            &["backend"],
        );

        let circuit_breaker_trips_total = counter(
            &registry,
            "kortex_circuit_breaker_trips_total",
            "Total circuit breaker trips",
            &["backend"],
        );

        let circuit_breaker_rejections_total = counter(
            &registry,
            "kortex_circuit_breaker_rejections_total",
            "Requests rejected by an open or saturated circuit breaker",
            &["backend"],
        );

        let retry_attempts_total = counter(
            &registry,
            "kortex_retry_attempts_total",
            "Total retry attempts",
            &["backend", "attempt"],
        );

        let retry_successes_total = counter(
            &registry,
            "kortex_retry_successes_total",
            "Requests that succeeded after at least one retry",
            &["backend"],
        );

        let retry_exhausted_total = counter(
            &registry,
            "kortex_retry_exhausted_total",
            "Requests that exhausted all retries",
            &["backend"],
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            request_errors_total,
            backend_health,
            active_requests,
            rate_limit_hits_total,
            experiment_assignments_total,
            cost_total,
            tokens_total,
            fallbacks_total,
            last_resort_total,
            circuit_breaker_state,
            circuit_breaker_trips_total,
            circuit_breaker_rejections_total,
            retry_attempts_total,
            retry_successes_total,
            retry_exhausted_total,
        }
    }

    // --- Recording helpers ---

    pub fn record_request(&self, route: &str, backend: &str, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[route, backend, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[route, backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_error(&self, route: &str, backend: &str, error_type: &str) {
        self.request_errors_total
            .with_label_values(&[route, backend, error_type])
            .inc();
    }

    pub fn set_backend_health(&self, backend: &str, namespace: &str, healthy: bool) {
        self.backend_health
            .with_label_values(&[backend, namespace])
            .set(if healthy { 1.0 } else { 0.0 });
    }

    pub fn inc_active_requests(&self, backend: &str) {
        self.active_requests.with_label_values(&[backend]).inc();
    }

    pub fn dec_active_requests(&self, backend: &str) {
        self.active_requests.with_label_values(&[backend]).dec();
    }

    pub fn record_rate_limit_hit(&self, route: &str) {
        self.rate_limit_hits_total.with_label_values(&[route]).inc();
    }

    pub fn record_experiment_assignment(&self, experiment: &str, variant: &str) {
        self.experiment_assignments_total
            .with_label_values(&[experiment, variant])
            .inc();
    }

    pub fn record_cost(&self, route: &str, backend: &str, cost: f64) {
        if cost > 0.0 {
            self.cost_total
                .with_label_values(&[route, backend])
                .inc_by(cost);
        }
    }

    pub fn record_tokens(&self, route: &str, backend: &str, input: u64, output: u64) {
        self.tokens_total
            .with_label_values(&[route, backend, "input"])
            .inc_by(input);
        self.tokens_total
            .with_label_values(&[route, backend, "output"])
            .inc_by(output);
    }

    pub fn record_fallback(&self, route: &str, from_backend: &str, to_backend: &str) {
        self.fallbacks_total
            .with_label_values(&[route, from_backend, to_backend])
            .inc();
    }

    pub fn record_last_resort(&self, route: &str, backend: &str) {
        self.last_resort_total
            .with_label_values(&[route, backend])
            .inc();
    }

    pub fn set_circuit_state(&self, backend: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        self.circuit_breaker_state
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn record_circuit_trip(&self, backend: &str) {
        self.circuit_breaker_trips_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn record_circuit_rejection(&self, backend: &str) {
        self.circuit_breaker_rejections_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn record_retry_attempt(&self, backend: &str, attempt: u32) {
        self.retry_attempts_total
            .with_label_values(&[backend, &attempt.to_string()])
            .inc();
    }

    pub fn record_retry_success(&self, backend: &str) {
        self.retry_successes_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn record_retry_exhausted(&self, backend: &str) {
        self.retry_exhausted_total
            .with_label_values(&[backend])
            .inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
