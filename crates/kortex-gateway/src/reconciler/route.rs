//! Route reconciliation: resolve referenced backends, compute the phase,
//! set conditions, publish to the cache.
//!
//! The phase table: no references at all is `Pending`; any missing
//! backend or zero healthy backends is `Failed`; some but not all healthy
//! is `Degraded`; all healthy is `Active`. Backend changes fan into route
//! reconciles through [`RouteReconciler::keys_for_event`], which re-scans
//! the referenced-name sets of routes in the backend's namespace.

use super::Reconcile;
use crate::cache::ConfigCache;
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use chrono::Utc;
use kortex_core::{
    set_condition, Condition, ConditionStatus, HealthState, NamespacedName, ResourceEvent,
    ResourceKind, ResourceRegistry, Route, RoutePhase,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CONDITION_READY: &str = "Ready";
const CONDITION_BACKENDS_READY: &str = "BackendsReady";
const CONDITION_ROUTE_VALID: &str = "RouteValid";

/// Reconciles Route resources against the observed state of their
/// backends.
pub struct RouteReconciler {
    registry: Arc<ResourceRegistry>,
    cache: Arc<ConfigCache>,
    rate_limiter: Arc<RateLimiter>,
}

impl RouteReconciler {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        cache: Arc<ConfigCache>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            registry,
            cache,
            rate_limiter,
        }
    }

    /// Routes in the backend's namespace whose referenced-backend set
    /// contains it.
    fn routes_referencing(&self, backend_key: &NamespacedName) -> Vec<NamespacedName> {
        self.registry
            .list_routes_in_namespace(&backend_key.namespace)
            .into_iter()
            .filter(|route| {
                route
                    .spec
                    .collect_backend_names()
                    .contains(&backend_key.name)
            })
            .map(|route| route.key())
            .collect()
    }

    fn determine_phase(total: usize, healthy: usize, missing: usize) -> RoutePhase {
        if total == 0 {
            return RoutePhase::Pending;
        }
        if missing > 0 {
            return RoutePhase::Failed;
        }
        if healthy == 0 {
            return RoutePhase::Failed;
        }
        if healthy < total {
            return RoutePhase::Degraded;
        }
        RoutePhase::Active
    }

    fn set_conditions(route: &mut Route, phase: RoutePhase, missing: &[String], unhealthy: &[String]) {
        let backends_condition = if missing.is_empty() && unhealthy.is_empty() {
            Condition::new(
                CONDITION_BACKENDS_READY,
                ConditionStatus::True,
                "AllBackendsReady",
                "All referenced backends are healthy",
            )
        } else if !missing.is_empty() {
            Condition::new(
                CONDITION_BACKENDS_READY,
                ConditionStatus::False,
                "BackendsMissing",
                format!("Missing backends: {missing:?}"),
            )
        } else {
            Condition::new(
                CONDITION_BACKENDS_READY,
                ConditionStatus::False,
                "BackendsUnhealthy",
                format!("Unhealthy backends: {unhealthy:?}"),
            )
        };
        set_condition(&mut route.status.conditions, backends_condition);

        let valid_condition = if missing.is_empty() {
            Condition::new(
                CONDITION_ROUTE_VALID,
                ConditionStatus::True,
                "RouteValid",
                "Route configuration is valid",
            )
        } else {
            Condition::new(
                CONDITION_ROUTE_VALID,
                ConditionStatus::False,
                "InvalidBackendReferences",
                format!("Referenced backends do not exist: {missing:?}"),
            )
        };
        set_condition(&mut route.status.conditions, valid_condition);

        let ready_condition = match phase {
            RoutePhase::Active => Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "RouteReady",
                "Route is active and all backends are healthy",
            ),
            RoutePhase::Degraded => Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "RouteDegraded",
                "Route is operational but some backends are unhealthy",
            ),
            RoutePhase::Pending => Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "RoutePending",
                "Route has no backends configured",
            ),
            RoutePhase::Failed => Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "RouteFailed",
                "Route is not operational due to backend issues",
            ),
        };
        set_condition(&mut route.status.conditions, ready_condition);
    }
}

#[async_trait]
impl Reconcile for RouteReconciler {
    fn name(&self) -> &'static str {
        "route"
    }

    fn keys_for_event(&self, event: &ResourceEvent) -> Vec<NamespacedName> {
        match event.kind {
            ResourceKind::Route => vec![event.key.clone()],
            // Any backend change (including status writes from the backend
            // reconciler) fans into the routes that reference it.
            ResourceKind::Backend => self.routes_referencing(&event.key),
        }
    }

    fn initial_keys(&self) -> Vec<NamespacedName> {
        self.registry
            .list_routes()
            .into_iter()
            .map(|r| r.key())
            .collect()
    }

    async fn reconcile(&self, key: &NamespacedName) -> Option<Duration> {
        let Some(mut route) = self.registry.get_route(key) else {
            debug!(%key, "route deleted, purging state");
            self.cache.delete_route(key);
            self.rate_limiter.remove_route(&key.name);
            return None;
        };

        let backend_names = route.spec.collect_backend_names();
        let total = backend_names.len();
        let mut healthy = 0usize;
        let mut missing = Vec::new();
        let mut unhealthy = Vec::new();

        for name in &backend_names {
            let backend_key = NamespacedName::new(route.namespace.clone(), name.clone());
            match self.registry.get_backend(&backend_key) {
                None => missing.push(name.clone()),
                Some(backend) => {
                    if backend.status.health == HealthState::Healthy {
                        healthy += 1;
                    } else {
                        unhealthy.push(name.clone());
                    }
                }
            }
        }

        let phase = Self::determine_phase(total, healthy, missing.len());
        route.status.phase = phase;
        route.status.active_backends = healthy as u32;
        route.status.last_updated = Some(Utc::now());
        Self::set_conditions(&mut route, phase, &missing, &unhealthy);

        debug!(
            %key,
            phase = %phase,
            active_backends = healthy,
            total_backends = total,
            ?missing,
            ?unhealthy,
            "reconciled route"
        );

        self.registry.update_route_status(key, route.status.clone());
        self.cache.set_route(key.clone(), route.clone());

        // Keep the limiter in sync with the declared rate limit
        self.rate_limiter
            .update_route_limit(&key.name, route.spec.rate_limit.as_ref());

        // Safety-net resync; the backend watch delivers faster updates
        Some(Duration::from_secs(30))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
