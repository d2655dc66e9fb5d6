//! Token-estimation-based routing.
//!
//! Estimates the input token count from an OpenAI-compatible request body
//! and buckets the request into short / medium / long categories, each of
//! which can map to a dedicated backend. Optional cost- and
//! latency-optimised selection modes pick among candidate backends by
//! estimated request cost or observed average latency.

use kortex_core::{BackendRef, CostSpec, Route, SmartRouterConfig};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Request size category derived from the token estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCategory {
    Short,
    Medium,
    Long,
}

impl RequestCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCategory::Short => "short",
            RequestCategory::Medium => "medium",
            RequestCategory::Long => "long",
        }
    }
}

/// A smart routing decision.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Selected backend name, empty when nothing applied.
    pub backend: String,
    pub reason: String,
    pub estimated_tokens: u32,
    pub category: RequestCategory,
}

/// Subset of an OpenAI-compatible request body used for estimation.
#[derive(Debug, Deserialize)]
struct ChatRequestBody {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Routes requests by estimated size, cost, or latency.
pub struct SmartRouter {
    config: SmartRouterConfig,
}

impl SmartRouter {
    pub fn new(config: SmartRouterConfig) -> Self {
        Self { config }
    }

    /// Analyze the request body and pick a backend by category, falling
    /// back to the route's default backend when no category backend is
    /// configured.
    pub fn select_backend(&self, body: &[u8], route: &Route) -> RouteDecision {
        let estimated_tokens = estimate_request_tokens(body);

        let category = if estimated_tokens > self.config.long_context_threshold {
            RequestCategory::Long
        } else if estimated_tokens < self.config.fast_model_threshold {
            RequestCategory::Short
        } else {
            RequestCategory::Medium
        };

        let (backend, reason) = match category {
            RequestCategory::Long => (
                self.config.long_context_backend.clone(),
                "token count exceeds long-context threshold",
            ),
            RequestCategory::Short => (
                self.config.fast_model_backend.clone(),
                "token count below fast-model threshold",
            ),
            RequestCategory::Medium => (
                self.config.default_backend.clone(),
                "standard routing for medium-length requests",
            ),
        };

        let (backend, reason) = match backend {
            Some(name) => (name, reason.to_string()),
            None => match &route.spec.default_backend {
                Some(default) => (
                    default.name.clone(),
                    "fallback to route default backend".to_string(),
                ),
                None => (String::new(), String::new()),
            },
        };

        debug!(
            estimated_tokens,
            category = category.as_str(),
            backend = %backend,
            "smart routing decision"
        );

        RouteDecision {
            backend,
            reason,
            estimated_tokens,
            category,
        }
    }

    /// Pick the candidate minimizing estimated request cost:
    /// `(tokens / 1000) · input_cost + request_cost`. Candidates without a
    /// cost config are skipped. Empty result when cost optimization is
    /// disabled or nothing qualifies.
    pub fn cost_based_selection(
        &self,
        backends: &[BackendRef],
        estimated_tokens: u32,
        backend_costs: &HashMap<String, CostSpec>,
    ) -> Option<String> {
        if backends.is_empty() || !self.config.enable_cost_optimization {
            return None;
        }

        let mut best: Option<(String, f64)> = None;
        for backend in backends {
            let Some(cost) = backend_costs.get(&backend.name) else {
                continue;
            };

            let input_cost = cost.input_token_cost.unwrap_or(0.0);
            let request_cost = cost.request_cost.unwrap_or(0.0);
            let estimated_cost =
                (f64::from(estimated_tokens) * input_cost / 1000.0) + request_cost;

            match &best {
                Some((_, best_cost)) if estimated_cost >= *best_cost => {}
                _ => best = Some((backend.name.clone(), estimated_cost)),
            }
        }

        if let Some((name, cost)) = &best {
            debug!(backend = %name, estimated_cost = cost, "cost-optimized selection");
        }
        best.map(|(name, _)| name)
    }

    /// Pick the candidate with the lowest observed average latency.
    /// Candidates with no recorded latency are skipped.
    pub fn latency_based_selection(
        &self,
        backends: &[BackendRef],
        backend_latency_ms: &HashMap<String, i64>,
    ) -> Option<String> {
        let mut best: Option<(String, i64)> = None;
        for backend in backends {
            let Some(latency) = backend_latency_ms.get(&backend.name) else {
                continue;
            };
            match &best {
                Some((_, best_latency)) if latency >= best_latency => {}
                _ => best = Some((backend.name.clone(), *latency)),
            }
        }

        if let Some((name, latency)) = &best {
            debug!(backend = %name, latency_ms = latency, "latency-optimized selection");
        }
        best.map(|(name, _)| name)
    }

    /// Whether a backend's context window can hold the estimated tokens,
    /// leaving 25% headroom for the response. Backends without a known
    /// limit are assumed capable.
    pub fn context_length_capable(
        &self,
        backend_name: &str,
        estimated_tokens: u32,
        context_limits: &HashMap<String, u32>,
    ) -> bool {
        let Some(limit) = context_limits.get(backend_name) else {
            return true;
        };
        let effective = (f64::from(*limit) * 0.75) as u32;
        estimated_tokens <= effective
    }
}

/// Estimate input tokens from an OpenAI-compatible body: all message
/// contents plus the `prompt` field, estimated from the raw body when it
/// isn't parseable JSON.
pub fn estimate_request_tokens(body: &[u8]) -> u32 {
    if body.is_empty() {
        return 0;
    }

    match serde_json::from_slice::<ChatRequestBody>(body) {
        Ok(chat) => {
            let mut text = String::new();
            for message in &chat.messages {
                text.push_str(&message.content);
                text.push(' ');
            }
            if let Some(prompt) = &chat.prompt {
                text.push_str(prompt);
            }
            estimate_tokens_from_text(&text)
        }
        Err(_) => estimate_tokens_from_text(&String::from_utf8_lossy(body)),
    }
}

/// Blended token estimate: the average of a word-based estimate
/// (words · 1.3) and a character-based estimate (chars / 4), which tracks
/// reasonably across prose and code.
pub fn estimate_tokens_from_text(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count();
    let chars = text.len();

    let word_estimate = (words as f64 * 1.3) as u32;
    let char_estimate = (chars / 4) as u32;
    (word_estimate + char_estimate) / 2
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
