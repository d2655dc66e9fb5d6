//! Core types, configuration, and errors for Kortex
//!
//! This crate contains the foundational types shared between the Kortex
//! control plane (reconcilers) and data plane (proxy): the `Backend` and
//! `Route` resource model with specs, statuses, and conditions, the gateway
//! configuration tree, the shared error enum, the in-memory resource
//! registry, and the secret store interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

pub mod registry;
pub mod secrets;

pub use registry::{ResourceEvent, ResourceKind, ResourceRegistry};
pub use secrets::{MemorySecretStore, SecretStore};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A namespace-scoped resource name. The cache, registry, and reconcilers
/// are all keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Tri-state status of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A structured observation about a resource, mirroring the familiar
/// Kubernetes condition shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Upsert a condition by type. The transition time is preserved when the
/// status does not change, so repeated reconciles don't churn timestamps.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

/// Look up a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

// ---------------------------------------------------------------------------
// Backend resource
// ---------------------------------------------------------------------------

/// Observed health of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "Healthy"),
            HealthState::Unhealthy => write!(f, "Unhealthy"),
            HealthState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Reference to a key inside a named secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// An external API backend (OpenAI, Anthropic, Cohere, or any custom
/// OpenAI-compatible endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalBackend {
    pub url: String,
    /// Provider name used for credential injection and usage parsing.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_secret: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

/// A cluster-local Kubernetes Service backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesBackend {
    pub service_name: String,
    /// Defaults to the backend's own namespace when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_service_port")]
    pub port: u16,
}

fn default_service_port() -> u16 {
    8080
}

/// A KServe InferenceService backend, addressed via its predictor service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KServeBackend {
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// The three backend kinds, tagged by `type`. Exactly one configuration
/// payload exists per backend by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendVariant {
    External(ExternalBackend),
    Kubernetes(KubernetesBackend),
    KServe(KServeBackend),
}

impl BackendVariant {
    /// Short type name, used in the `X-Backend-Type` response header and
    /// metric labels.
    pub fn type_name(&self) -> &'static str {
        match self {
            BackendVariant::External(_) => "external",
            BackendVariant::Kubernetes(_) => "kubernetes",
            BackendVariant::KServe(_) => "kserve",
        }
    }

    /// Provider string for external backends, empty otherwise.
    pub fn provider(&self) -> &str {
        match self {
            BackendVariant::External(ext) => &ext.provider,
            _ => "",
        }
    }
}

/// Active health probing configuration for a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Probe path. Defaults per backend type: `/health` for Kubernetes,
    /// `/v1/models` for KServe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_probe_interval")]
    pub interval_seconds: u32,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
    /// Consecutive failures before the backend is marked Unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_probe_interval() -> u32 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: None,
            interval_seconds: default_probe_interval(),
            timeout_seconds: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Per-token and per-request pricing for cost accounting. Unset terms are
/// omitted from the cost sum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSpec {
    /// Cost per 1000 input tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token_cost: Option<f64>,
    /// Cost per 1000 output tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_cost: Option<f64>,
    /// Fixed cost per request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_cost: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Desired state of a [`Backend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    #[serde(flatten)]
    pub variant: BackendVariant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostSpec>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_seconds: u64,
    /// Priority for fallback ordering (higher = preferred).
    #[serde(default)]
    pub priority: i32,
}

fn default_backend_timeout() -> u64 {
    60
}

impl BackendSpec {
    /// Validate the required sub-fields of the configured variant.
    pub fn validate(&self) -> Result<()> {
        match &self.variant {
            BackendVariant::External(ext) => {
                if ext.url.is_empty() {
                    return Err(KortexError::Config(
                        "external.url is required for backend type 'external'".to_string(),
                    ));
                }
            }
            BackendVariant::Kubernetes(k8s) => {
                if k8s.service_name.is_empty() {
                    return Err(KortexError::Config(
                        "kubernetes.service_name is required for backend type 'kubernetes'"
                            .to_string(),
                    ));
                }
            }
            BackendVariant::KServe(kserve) => {
                if kserve.service_name.is_empty() {
                    return Err(KortexError::Config(
                        "kserve.service_name is required for backend type 'kserve'".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Effective failure threshold, applying the default when no health
    /// check block is configured.
    pub fn failure_threshold(&self) -> u32 {
        self.health_check
            .as_ref()
            .map(|h| h.failure_threshold)
            .filter(|t| *t > 0)
            .unwrap_or_else(default_failure_threshold)
    }

    /// Effective probe interval in seconds.
    pub fn probe_interval_seconds(&self) -> u32 {
        self.health_check
            .as_ref()
            .map(|h| h.interval_seconds)
            .filter(|i| *i > 0)
            .unwrap_or_else(default_probe_interval)
    }

    /// Effective probe timeout in seconds.
    pub fn probe_timeout_seconds(&self) -> u64 {
        self.health_check
            .as_ref()
            .map(|h| h.timeout_seconds)
            .filter(|t| *t > 0)
            .unwrap_or_else(default_probe_timeout)
    }
}

/// Observed state of a [`Backend`], written only by the backend reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub average_latency_ms: i64,
    /// Last *successful* probe time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// An addressable inference endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub namespace: String,
    pub name: String,
    pub spec: BackendSpec,
    #[serde(default)]
    pub status: BackendStatus,
}

impl Backend {
    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }

    /// Namespace the backend's service resolves in: the variant override
    /// when present, otherwise the backend's own namespace.
    pub fn service_namespace(&self) -> &str {
        match &self.spec.variant {
            BackendVariant::Kubernetes(k8s) => k8s.namespace.as_deref().unwrap_or(&self.namespace),
            BackendVariant::KServe(kserve) => {
                kserve.namespace.as_deref().unwrap_or(&self.namespace)
            }
            BackendVariant::External(_) => &self.namespace,
        }
    }
}

// ---------------------------------------------------------------------------
// Route resource
// ---------------------------------------------------------------------------

/// Coarse lifecycle state of a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutePhase {
    #[default]
    Pending,
    Active,
    Degraded,
    Failed,
}

impl fmt::Display for RoutePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutePhase::Pending => write!(f, "Pending"),
            RoutePhase::Active => write!(f, "Active"),
            RoutePhase::Degraded => write!(f, "Degraded"),
            RoutePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// A weighted reference from a route to a backend in the same namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRef {
    pub name: String,
    /// Weight for weighted routing (0-100). Zero is treated as the default
    /// weight of 100 during selection.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    100
}

impl BackendRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: default_weight(),
        }
    }

    pub fn with_weight(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Conditions a request must satisfy to match a rule. All present
/// conditions must hold; an absent match block matches every request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMatch {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Shell-glob pattern matched against the `X-Model` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_pattern: Option<String>,
}

/// A single routing rule: optional match conditions plus one or more
/// weighted backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_: Option<RouteMatch>,
    pub backends: Vec<BackendRef>,
}

/// Ordered failover chain tried after the selected backend fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackChain {
    pub backends: Vec<String>,
    /// Deadline per backend attempt.
    #[serde(default = "default_fallback_timeout")]
    pub timeout_seconds: u64,
}

fn default_fallback_timeout() -> u64 {
    30
}

/// Token-bucket rate limiting, per route or per (route, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub requests_per_minute: u32,
    #[serde(default)]
    pub per_user: bool,
    /// Header identifying the user when `per_user` is set.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

/// An A/B experiment overlaying the weighted backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbExperiment {
    pub name: String,
    pub control: String,
    pub treatment: String,
    /// Percentage of traffic assigned to the treatment (0-100).
    #[serde(default = "default_traffic_percent")]
    pub traffic_percent: i32,
    #[serde(default = "default_experiment_metric")]
    pub metric: String,
}

fn default_traffic_percent() -> i32 {
    10
}

fn default_experiment_metric() -> String {
    "latency_p95".to_string()
}

/// Desired state of a [`Route`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<BackendRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackChain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experiments: Vec<AbExperiment>,
    #[serde(default = "default_cost_tracking")]
    pub cost_tracking: bool,
}

fn default_cost_tracking() -> bool {
    true
}

impl Default for RouteSpec {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_backend: None,
            fallback: None,
            rate_limit: None,
            experiments: Vec::new(),
            cost_tracking: default_cost_tracking(),
        }
    }
}

impl RouteSpec {
    /// All distinct backend names referenced by rules, the default backend,
    /// the fallback chain, and experiments. Sorted for deterministic
    /// iteration.
    pub fn collect_backend_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for rule in &self.rules {
            for backend in &rule.backends {
                names.insert(backend.name.clone());
            }
        }
        if let Some(default) = &self.default_backend {
            names.insert(default.name.clone());
        }
        if let Some(fallback) = &self.fallback {
            for name in &fallback.backends {
                names.insert(name.clone());
            }
        }
        for exp in &self.experiments {
            names.insert(exp.control.clone());
            names.insert(exp.treatment.clone());
        }
        names
    }

    pub fn validate(&self) -> Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.backends.is_empty() {
                return Err(KortexError::Config(format!(
                    "rule {i} has no backends; each rule requires at least one"
                )));
            }
            for backend in &rule.backends {
                if backend.weight > 100 {
                    return Err(KortexError::Config(format!(
                        "backend {} weight {} exceeds 100",
                        backend.name, backend.weight
                    )));
                }
            }
        }
        if let Some(limit) = &self.rate_limit {
            if limit.requests_per_minute == 0 {
                return Err(KortexError::Config(
                    "rate_limit.requests_per_minute must be at least 1".to_string(),
                ));
            }
        }
        if let Some(fallback) = &self.fallback {
            if fallback.backends.is_empty() {
                return Err(KortexError::Config(
                    "fallback.backends must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Observed state of a [`Route`], written only by the route reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteStatus {
    #[serde(default)]
    pub phase: RoutePhase,
    #[serde(default)]
    pub active_backends: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A named routing policy referencing one or more backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub namespace: String,
    pub name: String,
    pub spec: RouteSpec,
    #[serde(default)]
    pub status: RouteStatus,
}

impl Route {
    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}

// ---------------------------------------------------------------------------
// Gateway configuration
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Circuit breaker tuning, shared by every per-backend breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub timeout_ms: u64,
    /// Max concurrent probes in half-open state.
    pub half_open_max_requests: u32,
    /// Failure rate (0.0-1.0) that trips the circuit when enough requests
    /// have been observed. Zero disables rate-based tripping.
    pub failure_rate_threshold: f64,
    pub min_requests_for_rate: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 30_000,
            half_open_max_requests: 3,
            failure_rate_threshold: 0.5,
            min_requests_for_rate: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Retry behavior for upstream attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial try (0 = no retries).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Jitter fraction in [0, 1]; the backoff is scaled by a factor drawn
    /// from [1 - jitter/2, 1 + jitter/2].
    pub jitter: f64,
    pub retryable_status_codes: Vec<u16>,
    pub retry_on_connection_error: bool,
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: 0.3,
            retryable_status_codes: vec![502, 503, 504],
            retry_on_connection_error: true,
            retry_on_timeout: true,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max_backoff_ms)
    }
}

/// Rate limiter housekeeping: how often to sweep per-user buckets and how
/// long an idle bucket survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub cleanup_interval_seconds: u64,
    pub user_bucket_ttl_seconds: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 300,
            user_bucket_ttl_seconds: 1800,
        }
    }
}

/// Token-estimation routing thresholds and optional category backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartRouterConfig {
    /// Token count above which requests are routed to the long-context
    /// backend.
    pub long_context_threshold: u32,
    /// Token count below which requests are routed to the fast backend.
    pub fast_model_threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_context_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_model_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<String>,
    #[serde(default)]
    pub enable_cost_optimization: bool,
}

impl Default for SmartRouterConfig {
    fn default() -> Self {
        Self {
            long_context_threshold: 4000,
            fast_model_threshold: 500,
            long_context_backend: None,
            fast_model_backend: None,
            default_backend: None,
            enable_cost_optimization: false,
        }
    }
}

/// Top-level gateway configuration, loaded from YAML with env and CLI
/// overrides applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    /// Maximum request body size in bytes (0 = unlimited).
    pub max_request_body_size: u64,
    pub connect_timeout_ms: u64,
    /// Total upstream request timeout.
    pub request_timeout_ms: u64,
    pub logging: LoggingConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub rate_limiter: RateLimiterConfig,
    pub smart_router: SmartRouterConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            max_request_body_size: 10 * 1024 * 1024,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 120_000,
            logging: LoggingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            smart_router: SmartRouterConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Core error types shared across the gateway.
#[derive(thiserror::Error, Debug)]
pub enum KortexError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend {0} not found")]
    BackendNotFound(String),

    /// A transport-level upstream failure. The flags drive retry
    /// classification.
    #[error("upstream request failed: {message}")]
    Upstream {
        message: String,
        connect: bool,
        timeout: bool,
    },

    #[error("backend returned status {0}")]
    BackendStatus(u16),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("too many requests in half-open state")]
    HalfOpenSaturated,

    #[error("request cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KortexError {
    /// Build an [`KortexError::Upstream`] from a transport error, carrying
    /// whether it was a connection or timeout failure.
    pub fn upstream(message: impl Into<String>, connect: bool, timeout: bool) -> Self {
        Self::Upstream {
            message: message.into(),
            connect,
            timeout,
        }
    }
}

pub type Result<T> = std::result::Result<T, KortexError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn external_backend(url: &str) -> Backend {
        Backend {
            namespace: "default".to_string(),
            name: "openai".to_string(),
            spec: BackendSpec {
                variant: BackendVariant::External(ExternalBackend {
                    url: url.to_string(),
                    provider: "openai".to_string(),
                    api_key_secret: None,
                    model: None,
                }),
                health_check: None,
                cost: None,
                timeout_seconds: 60,
                priority: 0,
            },
            status: BackendStatus::default(),
        }
    }

    #[test]
    fn test_namespaced_name_display() {
        let key = NamespacedName::new("prod", "gpt4");
        assert_eq!(key.to_string(), "prod/gpt4");
    }

    #[test]
    fn test_backend_variant_serde_tag() {
        let backend = external_backend("https://api.openai.com/v1");
        let json = serde_json::to_value(&backend).unwrap();
        assert_eq!(json["spec"]["type"], "external");
        assert_eq!(json["spec"]["url"], "https://api.openai.com/v1");

        let parsed: Backend = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.spec.variant.type_name(), "external");
    }

    #[test]
    fn test_backend_variant_kserve_tag() {
        let yaml = r#"
namespace: ml
name: llama
spec:
  type: kserve
  service_name: llama-70b
"#;
        let backend: Backend = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(backend.spec.variant.type_name(), "kserve");
        match &backend.spec.variant {
            BackendVariant::KServe(kserve) => {
                assert_eq!(kserve.service_name, "llama-70b");
                assert!(kserve.namespace.is_none());
            }
            other => panic!("expected kserve variant, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_external_empty_url() {
        let backend = external_backend("");
        let err = backend.spec.validate().unwrap_err();
        assert!(matches!(err, KortexError::Config(_)));
    }

    #[test]
    fn test_validate_kubernetes_empty_service() {
        let spec = BackendSpec {
            variant: BackendVariant::Kubernetes(KubernetesBackend {
                service_name: String::new(),
                namespace: None,
                port: 8080,
            }),
            health_check: None,
            cost: None,
            timeout_seconds: 60,
            priority: 0,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_health_check_defaults() {
        let spec = external_backend("https://api.openai.com").spec;
        assert_eq!(spec.failure_threshold(), 3);
        assert_eq!(spec.probe_interval_seconds(), 30);
        assert_eq!(spec.probe_timeout_seconds(), 5);
    }

    #[test]
    fn test_health_check_overrides() {
        let mut backend = external_backend("https://api.openai.com");
        backend.spec.health_check = Some(HealthCheckSpec {
            path: Some("/status".to_string()),
            interval_seconds: 10,
            timeout_seconds: 2,
            failure_threshold: 5,
        });
        assert_eq!(backend.spec.failure_threshold(), 5);
        assert_eq!(backend.spec.probe_interval_seconds(), 10);
        assert_eq!(backend.spec.probe_timeout_seconds(), 2);
    }

    #[test]
    fn test_service_namespace_defaults_to_own() {
        let backend = Backend {
            namespace: "ml".to_string(),
            name: "svc".to_string(),
            spec: BackendSpec {
                variant: BackendVariant::Kubernetes(KubernetesBackend {
                    service_name: "svc".to_string(),
                    namespace: None,
                    port: 8080,
                }),
                health_check: None,
                cost: None,
                timeout_seconds: 60,
                priority: 0,
            },
            status: BackendStatus::default(),
        };
        assert_eq!(backend.service_namespace(), "ml");
    }

    #[test]
    fn test_service_namespace_override() {
        let backend = Backend {
            namespace: "ml".to_string(),
            name: "svc".to_string(),
            spec: BackendSpec {
                variant: BackendVariant::KServe(KServeBackend {
                    service_name: "svc".to_string(),
                    namespace: Some("serving".to_string()),
                }),
                health_check: None,
                cost: None,
                timeout_seconds: 60,
                priority: 0,
            },
            status: BackendStatus::default(),
        };
        assert_eq!(backend.service_namespace(), "serving");
    }

    #[test]
    fn test_set_condition_upsert() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "Pending", "starting up"),
        );
        assert_eq!(conditions.len(), 1);
        let first_transition = conditions[0].last_transition_time;

        // Same status: transition time preserved
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "Pending", "still starting"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].message, "still starting");

        // Status change: transition time moves
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Up", "ready"),
        );
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].last_transition_time >= first_transition);
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_collect_backend_names_deduplicates() {
        let spec = RouteSpec {
            rules: vec![RouteRule {
                match_: None,
                backends: vec![BackendRef::new("a"), BackendRef::new("b")],
            }],
            default_backend: Some(BackendRef::new("a")),
            fallback: Some(FallbackChain {
                backends: vec!["b".to_string(), "c".to_string()],
                timeout_seconds: 30,
            }),
            rate_limit: None,
            experiments: vec![AbExperiment {
                name: "exp".to_string(),
                control: "a".to_string(),
                treatment: "d".to_string(),
                traffic_percent: 10,
                metric: "latency_p95".to_string(),
            }],
            cost_tracking: true,
        };

        let names: Vec<String> = spec.collect_backend_names().into_iter().collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_route_spec_validate_empty_rule() {
        let spec = RouteSpec {
            rules: vec![RouteRule {
                match_: None,
                backends: vec![],
            }],
            ..RouteSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_route_spec_validate_weight_range() {
        let spec = RouteSpec {
            rules: vec![RouteRule {
                match_: None,
                backends: vec![BackendRef::with_weight("a", 101)],
            }],
            ..RouteSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_route_spec_defaults() {
        let yaml = r#"
rules:
  - backends:
      - name: primary
"#;
        let spec: RouteSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.cost_tracking);
        assert_eq!(spec.rules[0].backends[0].weight, 100);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_rate_limit_spec_defaults() {
        let yaml = "requests_per_minute: 60";
        let spec: RateLimitSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(!spec.per_user);
        assert_eq!(spec.user_header, "x-user-id");
    }

    #[test]
    fn test_experiment_defaults() {
        let yaml = r#"
name: faster-model
control: gpt4
treatment: gpt4-mini
"#;
        let exp: AbExperiment = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(exp.traffic_percent, 10);
        assert_eq!(exp.metric, "latency_p95");
    }

    #[test]
    fn test_gateway_config_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.max_request_body_size, 10 * 1024 * 1024);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.retryable_status_codes, vec![502, 503, 504]);
        assert_eq!(config.rate_limiter.user_bucket_ttl_seconds, 1800);
    }

    #[test]
    fn test_gateway_config_partial_yaml() {
        let yaml = r#"
listen_addr: "127.0.0.1:9090"
circuit_breaker:
  failure_threshold: 2
  success_threshold: 1
  timeout_ms: 100
  half_open_max_requests: 1
  failure_rate_threshold: 0.0
  min_requests_for_rate: 0
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        // Untouched sections keep defaults
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_upstream_error_flags() {
        let err = KortexError::upstream("connection refused", true, false);
        match err {
            KortexError::Upstream {
                connect, timeout, ..
            } => {
                assert!(connect);
                assert!(!timeout);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
