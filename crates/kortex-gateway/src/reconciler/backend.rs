//! Backend reconciliation: validate, probe, apply the failure threshold,
//! write status, publish to the cache.
//!
//! Health follows a quarantine ladder: a backend becomes `Healthy` on any
//! successful probe, `Unhealthy` only after `failure_threshold`
//! consecutive failures, and sits at `Unknown` in between. Consecutive
//! failure counts are process-local; after a restart the threshold has to
//! be re-earned from zero.

use super::Reconcile;
use crate::cache::ConfigCache;
use crate::health::{ProbeResult, Prober};
use crate::metrics::Metrics;
use async_trait::async_trait;
use kortex_core::{
    set_condition, Backend, BackendStatus, Condition, ConditionStatus, HealthState,
    NamespacedName, ResourceEvent, ResourceKind, ResourceRegistry,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error};

const CONDITION_HEALTHY: &str = "Healthy";
const CONDITION_READY: &str = "Ready";

/// Reconciles Backend resources against live probe results.
pub struct BackendReconciler {
    registry: Arc<ResourceRegistry>,
    prober: Arc<Prober>,
    cache: Arc<ConfigCache>,
    metrics: Option<Arc<Metrics>>,
    /// Consecutive probe failures per backend key.
    failure_counts: RwLock<HashMap<NamespacedName, u32>>,
}

impl BackendReconciler {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        prober: Arc<Prober>,
        cache: Arc<ConfigCache>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            registry,
            prober,
            cache,
            metrics,
            failure_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Remove per-key state for a deleted backend.
    fn cleanup(&self, key: &NamespacedName) {
        self.failure_counts
            .write()
            .expect("failure count lock poisoned")
            .remove(key);
        self.cache.delete_backend(key);
    }

    fn bump_failures(&self, key: &NamespacedName, healthy: bool) -> u32 {
        let mut counts = self
            .failure_counts
            .write()
            .expect("failure count lock poisoned");
        let entry = counts.entry(key.clone()).or_insert(0);
        if healthy {
            *entry = 0;
        } else {
            *entry += 1;
        }
        *entry
    }

    /// Current consecutive-failure count, for tests and introspection.
    pub fn failure_count(&self, key: &NamespacedName) -> u32 {
        self.failure_counts
            .read()
            .expect("failure count lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn apply_probe_outcome(&self, backend: &mut Backend, result: &ProbeResult, failures: u32) {
        let threshold = backend.spec.failure_threshold();
        let health = if result.healthy {
            HealthState::Healthy
        } else if failures >= threshold {
            HealthState::Unhealthy
        } else {
            HealthState::Unknown
        };

        backend.status.health = health;
        backend.status.average_latency_ms = result.latency.as_millis() as i64;
        if result.healthy {
            backend.status.last_health_check = Some(result.timestamp);
        }

        let healthy_condition = match health {
            HealthState::Healthy => Condition::new(
                CONDITION_HEALTHY,
                ConditionStatus::True,
                "HealthCheckPassed",
                "Backend is responding to health checks",
            ),
            HealthState::Unhealthy => Condition::new(
                CONDITION_HEALTHY,
                ConditionStatus::False,
                "HealthCheckFailed",
                match &result.error {
                    Some(e) => format!("Health check failed: {e}"),
                    None => "Backend failed health check threshold".to_string(),
                },
            ),
            HealthState::Unknown => Condition::new(
                CONDITION_HEALTHY,
                ConditionStatus::Unknown,
                "HealthCheckPending",
                match &result.error {
                    Some(e) => format!("Health check in progress: {e}"),
                    None => "Health check status pending".to_string(),
                },
            ),
        };
        set_condition(&mut backend.status.conditions, healthy_condition);

        let ready_condition = if health == HealthState::Healthy {
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "BackendReady",
                "Backend is configured and healthy",
            )
        } else {
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "BackendNotReady",
                format!("Backend health status is {health}"),
            )
        };
        set_condition(&mut backend.status.conditions, ready_condition);

        if let Some(m) = &self.metrics {
            m.set_backend_health(&backend.name, &backend.namespace, result.healthy);
        }
    }
}

#[async_trait]
impl Reconcile for BackendReconciler {
    fn name(&self) -> &'static str {
        "backend"
    }

    fn keys_for_event(&self, event: &ResourceEvent) -> Vec<NamespacedName> {
        // Status writes come from this reconciler itself; reacting to them
        // would loop forever.
        if event.kind == ResourceKind::Backend && !event.status_only {
            vec![event.key.clone()]
        } else {
            Vec::new()
        }
    }

    fn initial_keys(&self) -> Vec<NamespacedName> {
        self.registry
            .list_backends()
            .into_iter()
            .map(|b| b.key())
            .collect()
    }

    async fn reconcile(&self, key: &NamespacedName) -> Option<Duration> {
        let Some(mut backend) = self.registry.get_backend(key) else {
            debug!(%key, "backend deleted, purging state");
            self.cleanup(key);
            return None;
        };

        // Configuration errors are terminal until the spec changes, but a
        // short requeue catches out-of-band fixes.
        if let Err(e) = backend.spec.validate() {
            error!(%key, error = %e, "invalid backend configuration");
            let mut status = backend.status.clone();
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    "ConfigurationError",
                    e.to_string(),
                ),
            );
            status.health = HealthState::Unhealthy;
            self.registry.update_backend_status(key, status);
            return Some(Duration::from_secs(30));
        }

        let result = self.prober.probe(&backend).await;
        let failures = self.bump_failures(key, result.healthy);

        self.apply_probe_outcome(&mut backend, &result, failures);

        debug!(
            %key,
            health = %backend.status.health,
            latency_ms = backend.status.average_latency_ms,
            failures,
            "reconciled backend"
        );

        self.registry
            .update_backend_status(key, backend.status.clone());
        self.cache.set_backend(key.clone(), backend.clone());

        Some(Duration::from_secs(u64::from(
            backend.spec.probe_interval_seconds(),
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use kortex_core::{
        find_condition, BackendSpec, BackendVariant, ExternalBackend, HealthCheckSpec,
    };

    fn external_backend(name: &str, url: &str, threshold: u32) -> Backend {
        Backend {
            namespace: "default".to_string(),
            name: name.to_string(),
            spec: BackendSpec {
                variant: BackendVariant::External(ExternalBackend {
                    url: url.to_string(),
                    provider: "openai".to_string(),
                    api_key_secret: None,
                    model: None,
                }),
                health_check: Some(HealthCheckSpec {
                    path: None,
                    interval_seconds: 15,
                    timeout_seconds: 1,
                    failure_threshold: threshold,
                }),
                cost: None,
                timeout_seconds: 60,
                priority: 0,
            },
            status: BackendStatus::default(),
        }
    }

    async fn spawn_upstream(status: StatusCode) -> String {
        let app = axum::Router::new()
            .route("/health", get(move || async move { status }))
            .fallback(move || async move { status });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn reconciler(
        registry: Arc<ResourceRegistry>,
        cache: Arc<ConfigCache>,
    ) -> BackendReconciler {
        BackendReconciler::new(registry, Arc::new(Prober::new()), cache, None)
    }

    #[tokio::test]
    async fn test_healthy_on_first_success() {
        let registry = Arc::new(ResourceRegistry::new());
        let cache = Arc::new(ConfigCache::new());
        let url = spawn_upstream(StatusCode::OK).await;
        let backend = external_backend("up", &url, 3);
        let key = backend.key();
        registry.apply_backend(backend);

        let reconciler = reconciler(Arc::clone(&registry), Arc::clone(&cache));
        let requeue = reconciler.reconcile(&key).await;

        assert_eq!(requeue, Some(Duration::from_secs(15)));

        let cached = cache.get_backend(&key).unwrap();
        assert_eq!(cached.status.health, HealthState::Healthy);
        assert!(cached.status.last_health_check.is_some());

        let healthy = find_condition(&cached.status.conditions, "Healthy").unwrap();
        assert_eq!(healthy.status, ConditionStatus::True);
        assert_eq!(healthy.reason, "HealthCheckPassed");
        let ready = find_condition(&cached.status.conditions, "Ready").unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_quarantine_before_threshold() {
        let registry = Arc::new(ResourceRegistry::new());
        let cache = Arc::new(ConfigCache::new());
        // Nothing listens on port 1: every probe fails
        let backend = external_backend("down", "http://127.0.0.1:1", 3);
        let key = backend.key();
        registry.apply_backend(backend);

        let reconciler = reconciler(Arc::clone(&registry), Arc::clone(&cache));

        // Failures 1 and 2: Unknown (quarantine)
        reconciler.reconcile(&key).await;
        assert_eq!(
            cache.get_backend(&key).unwrap().status.health,
            HealthState::Unknown
        );
        reconciler.reconcile(&key).await;
        assert_eq!(
            cache.get_backend(&key).unwrap().status.health,
            HealthState::Unknown
        );

        // Failure 3 crosses the threshold
        reconciler.reconcile(&key).await;
        let cached = cache.get_backend(&key).unwrap();
        assert_eq!(cached.status.health, HealthState::Unhealthy);
        assert!(cached.status.last_health_check.is_none());

        let healthy = find_condition(&cached.status.conditions, "Healthy").unwrap();
        assert_eq!(healthy.status, ConditionStatus::False);
        assert_eq!(healthy.reason, "HealthCheckFailed");
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let registry = Arc::new(ResourceRegistry::new());
        let cache = Arc::new(ConfigCache::new());
        let backend = external_backend("flaky", "http://127.0.0.1:1", 3);
        let key = backend.key();
        registry.apply_backend(backend.clone());

        let reconciler = reconciler(Arc::clone(&registry), Arc::clone(&cache));
        reconciler.reconcile(&key).await;
        reconciler.reconcile(&key).await;
        assert_eq!(reconciler.failure_count(&key), 2);

        // Point the backend at a live upstream and reconcile again
        let url = spawn_upstream(StatusCode::OK).await;
        let mut fixed = backend;
        fixed.spec.variant = BackendVariant::External(ExternalBackend {
            url,
            provider: "openai".to_string(),
            api_key_secret: None,
            model: None,
        });
        registry.apply_backend(fixed);
        reconciler.reconcile(&key).await;

        assert_eq!(reconciler.failure_count(&key), 0);
        assert_eq!(
            cache.get_backend(&key).unwrap().status.health,
            HealthState::Healthy
        );
    }

    #[tokio::test]
    async fn test_configuration_error() {
        let registry = Arc::new(ResourceRegistry::new());
        let cache = Arc::new(ConfigCache::new());
        let backend = external_backend("bad", "", 3);
        let key = backend.key();
        registry.apply_backend(backend);

        let reconciler = reconciler(Arc::clone(&registry), Arc::clone(&cache));
        let requeue = reconciler.reconcile(&key).await;

        assert_eq!(requeue, Some(Duration::from_secs(30)));

        // Status recorded in the registry with the ConfigurationError reason
        let stored = registry.get_backend(&key).unwrap();
        let ready = find_condition(&stored.status.conditions, "Ready").unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "ConfigurationError");

        // Invalid backends are not published
        assert!(cache.get_backend(&key).is_none());
    }

    #[tokio::test]
    async fn test_deletion_purges_state() {
        let registry = Arc::new(ResourceRegistry::new());
        let cache = Arc::new(ConfigCache::new());
        let backend = external_backend("gone", "http://127.0.0.1:1", 3);
        let key = backend.key();
        registry.apply_backend(backend);

        let reconciler = reconciler(Arc::clone(&registry), Arc::clone(&cache));
        reconciler.reconcile(&key).await;
        assert_eq!(reconciler.failure_count(&key), 1);
        assert!(cache.get_backend(&key).is_some());

        registry.delete_backend(&key);
        let requeue = reconciler.reconcile(&key).await;

        assert_eq!(requeue, None);
        assert_eq!(reconciler.failure_count(&key), 0);
        assert!(cache.get_backend(&key).is_none());
    }

    #[tokio::test]
    async fn test_latency_recorded() {
        let registry = Arc::new(ResourceRegistry::new());
        let cache = Arc::new(ConfigCache::new());
        let url = spawn_upstream(StatusCode::OK).await;
        let backend = external_backend("timed", &url, 3);
        let key = backend.key();
        registry.apply_backend(backend);

        let reconciler = reconciler(Arc::clone(&registry), Arc::clone(&cache));
        reconciler.reconcile(&key).await;

        let cached = cache.get_backend(&key).unwrap();
        assert!(cached.status.average_latency_ms >= 0);
    }

    #[tokio::test]
    async fn test_default_requeue_interval() {
        let registry = Arc::new(ResourceRegistry::new());
        let cache = Arc::new(ConfigCache::new());
        let url = spawn_upstream(StatusCode::OK).await;
        let mut backend = external_backend("plain", &url, 3);
        backend.spec.health_check = None;
        let key = backend.key();
        registry.apply_backend(backend);

        let reconciler = reconciler(Arc::clone(&registry), Arc::clone(&cache));
        let requeue = reconciler.reconcile(&key).await;
        assert_eq!(requeue, Some(Duration::from_secs(30)));
    }
}
