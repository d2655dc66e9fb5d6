//! Per-route and per-backend cost aggregation.
//!
//! For each tracked request the cost is
//! `(input_tokens / 1000) · input_cost + (output_tokens / 1000) ·
//! output_cost + request_cost`, with unset terms omitted. Aggregates are
//! in-memory only; they reset with the process.

use crate::metrics::Metrics;
use crate::provider::TokenUsage;
use chrono::{DateTime, Utc};
use kortex_core::CostSpec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Aggregated cost statistics for one route or backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostStats {
    pub total_cost: f64,
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub currency: String,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Tracks request costs per route and per backend.
pub struct CostTracker {
    inner: Mutex<Aggregates>,
    metrics: Option<Arc<Metrics>>,
}

#[derive(Default)]
struct Aggregates {
    routes: HashMap<String, CostStats>,
    backends: HashMap<String, CostStats>,
}

impl CostTracker {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            inner: Mutex::new(Aggregates::default()),
            metrics,
        }
    }

    /// Record one request's usage against both the route and backend
    /// aggregates.
    pub fn track_request(&self, route: &str, backend: &str, usage: TokenUsage, cost_spec: &CostSpec) {
        let cost = calculate_cost(usage, cost_spec);
        let currency = if cost_spec.currency.is_empty() {
            "USD"
        } else {
            &cost_spec.currency
        };
        let now = Utc::now();

        {
            let mut inner = self.inner.lock().expect("cost tracker lock poisoned");
            update_stats(&mut inner.routes, route, usage, cost, currency, now);
            update_stats(&mut inner.backends, backend, usage, cost, currency, now);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_cost(route, backend, cost);
            metrics.record_tokens(route, backend, usage.input_tokens, usage.output_tokens);
        }
    }

    /// Cost statistics for a route, if any requests were tracked.
    pub fn route_costs(&self, route: &str) -> Option<CostStats> {
        self.inner
            .lock()
            .expect("cost tracker lock poisoned")
            .routes
            .get(route)
            .cloned()
    }

    /// Cost statistics for a backend, if any requests were tracked.
    pub fn backend_costs(&self, backend: &str) -> Option<CostStats> {
        self.inner
            .lock()
            .expect("cost tracker lock poisoned")
            .backends
            .get(backend)
            .cloned()
    }

    /// Copies of all aggregates, for the costs endpoint.
    pub fn all_stats(&self) -> (HashMap<String, CostStats>, HashMap<String, CostStats>) {
        let inner = self.inner.lock().expect("cost tracker lock poisoned");
        (inner.routes.clone(), inner.backends.clone())
    }

    /// Discard all aggregates.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("cost tracker lock poisoned");
        inner.routes.clear();
        inner.backends.clear();
    }
}

fn update_stats(
    stats: &mut HashMap<String, CostStats>,
    key: &str,
    usage: TokenUsage,
    cost: f64,
    currency: &str,
    timestamp: DateTime<Utc>,
) {
    let entry = stats.entry(key.to_string()).or_insert_with(|| CostStats {
        currency: currency.to_string(),
        ..CostStats::default()
    });
    entry.total_cost += cost;
    entry.total_requests += 1;
    entry.total_input_tokens += usage.input_tokens;
    entry.total_output_tokens += usage.output_tokens;
    entry.last_updated = Some(timestamp);
}

/// Compute the cost of one request. Unset pricing terms contribute
/// nothing.
pub fn calculate_cost(usage: TokenUsage, spec: &CostSpec) -> f64 {
    let mut cost = 0.0;
    if let Some(input_cost) = spec.input_token_cost {
        cost += (usage.input_tokens as f64 / 1000.0) * input_cost;
    }
    if let Some(output_cost) = spec.output_token_cost {
        cost += (usage.output_tokens as f64 / 1000.0) * output_cost;
    }
    if let Some(request_cost) = spec.request_cost {
        cost += request_cost;
    }
    cost
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
