//! In-memory registry of declared Route and Backend resources.
//!
//! The registry is the desired-state store the reconcilers observe. It
//! stands in for whatever persistence feeds the control plane (CRDs, config
//! files); the reconcilers only ever see this interface. Every apply,
//! delete, and status write emits a [`ResourceEvent`] on a broadcast
//! channel so reconcile loops can react without polling.

use crate::{Backend, BackendStatus, NamespacedName, Route, RouteStatus};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Which resource kind an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Backend,
    Route,
}

/// A change notification emitted by the registry.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub key: NamespacedName,
    pub deleted: bool,
    /// True when only the observed status changed. Reconcilers use this to
    /// avoid re-triggering themselves from their own status writes, while
    /// watchers of *other* kinds (the route reconciler watching backends)
    /// still react.
    pub status_only: bool,
}

/// Thread-safe store of declared resources plus a change stream.
///
/// Values are cloned at both boundaries so callers can never mutate stored
/// state in place; status updates go through the dedicated
/// `update_*_status` methods, which only the reconcilers call.
pub struct ResourceRegistry {
    backends: RwLock<HashMap<NamespacedName, Backend>>,
    routes: RwLock<HashMap<NamespacedName, Route>>,
    events: broadcast::Sender<ResourceEvent>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            backends: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the change stream. Slow consumers may observe
    /// `Lagged` errors and should resync by listing.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: ResourceKind, key: NamespacedName, deleted: bool, status_only: bool) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.events.send(ResourceEvent {
            kind,
            key,
            deleted,
            status_only,
        });
    }

    // --- Backends ---

    pub fn apply_backend(&self, backend: Backend) {
        let key = backend.key();
        self.backends
            .write()
            .expect("registry lock poisoned")
            .insert(key.clone(), backend);
        self.emit(ResourceKind::Backend, key, false, false);
    }

    pub fn delete_backend(&self, key: &NamespacedName) {
        let removed = self
            .backends
            .write()
            .expect("registry lock poisoned")
            .remove(key)
            .is_some();
        if removed {
            self.emit(ResourceKind::Backend, key.clone(), true, false);
        }
    }

    pub fn get_backend(&self, key: &NamespacedName) -> Option<Backend> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn list_backends(&self) -> Vec<Backend> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn list_backends_in_namespace(&self, namespace: &str) -> Vec<Backend> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|b| b.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Write a backend's observed state. Returns false when the backend no
    /// longer exists (deleted between reconcile steps).
    pub fn update_backend_status(&self, key: &NamespacedName, status: BackendStatus) -> bool {
        let updated = {
            let mut backends = self.backends.write().expect("registry lock poisoned");
            match backends.get_mut(key) {
                Some(backend) => {
                    backend.status = status;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit(ResourceKind::Backend, key.clone(), false, true);
        }
        updated
    }

    // --- Routes ---

    pub fn apply_route(&self, route: Route) {
        let key = route.key();
        self.routes
            .write()
            .expect("registry lock poisoned")
            .insert(key.clone(), route);
        self.emit(ResourceKind::Route, key, false, false);
    }

    pub fn delete_route(&self, key: &NamespacedName) {
        let removed = self
            .routes
            .write()
            .expect("registry lock poisoned")
            .remove(key)
            .is_some();
        if removed {
            self.emit(ResourceKind::Route, key.clone(), true, false);
        }
    }

    pub fn get_route(&self, key: &NamespacedName) -> Option<Route> {
        self.routes
            .read()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn list_routes(&self) -> Vec<Route> {
        self.routes
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn list_routes_in_namespace(&self, namespace: &str) -> Vec<Route> {
        self.routes
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|r| r.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Write a route's observed state without touching the event stream for
    /// routes that were deleted concurrently.
    pub fn update_route_status(&self, key: &NamespacedName, status: RouteStatus) -> bool {
        let mut routes = self.routes.write().expect("registry lock poisoned");
        match routes.get_mut(key) {
            Some(route) => {
                route.status = status;
                true
            }
            None => false,
        }
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackendSpec, BackendVariant, ExternalBackend, HealthState, RouteSpec};

    fn backend(namespace: &str, name: &str) -> Backend {
        Backend {
            namespace: namespace.to_string(),
            name: name.to_string(),
            spec: BackendSpec {
                variant: BackendVariant::External(ExternalBackend {
                    url: "https://api.example.com".to_string(),
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

    fn route(namespace: &str, name: &str) -> Route {
        Route {
            namespace: namespace.to_string(),
            name: name.to_string(),
            spec: RouteSpec::default(),
            status: RouteStatus::default(),
        }
    }

    #[test]
    fn test_apply_and_get_backend() {
        let registry = ResourceRegistry::new();
        registry.apply_backend(backend("default", "gpt4"));

        let key = NamespacedName::new("default", "gpt4");
        let fetched = registry.get_backend(&key).unwrap();
        assert_eq!(fetched.name, "gpt4");
    }

    #[test]
    fn test_get_returns_clone() {
        let registry = ResourceRegistry::new();
        registry.apply_backend(backend("default", "gpt4"));

        let key = NamespacedName::new("default", "gpt4");
        let mut fetched = registry.get_backend(&key).unwrap();
        fetched.status.health = HealthState::Healthy;

        // Mutating the returned value does not affect the store
        let fresh = registry.get_backend(&key).unwrap();
        assert_eq!(fresh.status.health, HealthState::Unknown);
    }

    #[test]
    fn test_delete_backend() {
        let registry = ResourceRegistry::new();
        registry.apply_backend(backend("default", "gpt4"));

        let key = NamespacedName::new("default", "gpt4");
        registry.delete_backend(&key);
        assert!(registry.get_backend(&key).is_none());
    }

    #[test]
    fn test_list_in_namespace() {
        let registry = ResourceRegistry::new();
        registry.apply_backend(backend("prod", "a"));
        registry.apply_backend(backend("prod", "b"));
        registry.apply_backend(backend("staging", "c"));

        assert_eq!(registry.list_backends_in_namespace("prod").len(), 2);
        assert_eq!(registry.list_backends_in_namespace("staging").len(), 1);
        assert_eq!(registry.list_backends().len(), 3);
    }

    #[test]
    fn test_update_backend_status() {
        let registry = ResourceRegistry::new();
        registry.apply_backend(backend("default", "gpt4"));

        let key = NamespacedName::new("default", "gpt4");
        let status = BackendStatus {
            health: HealthState::Healthy,
            average_latency_ms: 42,
            ..BackendStatus::default()
        };
        assert!(registry.update_backend_status(&key, status));

        let fetched = registry.get_backend(&key).unwrap();
        assert_eq!(fetched.status.health, HealthState::Healthy);
        assert_eq!(fetched.status.average_latency_ms, 42);
    }

    #[test]
    fn test_update_status_missing_backend() {
        let registry = ResourceRegistry::new();
        let key = NamespacedName::new("default", "ghost");
        assert!(!registry.update_backend_status(&key, BackendStatus::default()));
    }

    #[tokio::test]
    async fn test_events_on_apply_and_delete() {
        let registry = ResourceRegistry::new();
        let mut events = registry.subscribe();

        registry.apply_backend(backend("default", "gpt4"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ResourceKind::Backend);
        assert!(!event.deleted);
        assert_eq!(event.key, NamespacedName::new("default", "gpt4"));

        registry.delete_backend(&NamespacedName::new("default", "gpt4"));
        let event = events.recv().await.unwrap();
        assert!(event.deleted);
    }

    #[tokio::test]
    async fn test_status_update_emits_event() {
        let registry = ResourceRegistry::new();
        registry.apply_backend(backend("default", "gpt4"));

        let mut events = registry.subscribe();
        let key = NamespacedName::new("default", "gpt4");
        registry.update_backend_status(
            &key,
            BackendStatus {
                health: HealthState::Healthy,
                ..BackendStatus::default()
            },
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ResourceKind::Backend);
        assert!(!event.deleted);
        assert!(event.status_only);
    }

    #[test]
    fn test_delete_missing_is_silent() {
        let registry = ResourceRegistry::new();
        let mut events = registry.subscribe();
        registry.delete_route(&NamespacedName::new("default", "ghost"));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_routes_round_trip() {
        let registry = ResourceRegistry::new();
        registry.apply_route(route("default", "chat"));

        let key = NamespacedName::new("default", "chat");
        assert!(registry.get_route(&key).is_some());
        assert_eq!(registry.list_routes_in_namespace("default").len(), 1);

        registry.delete_route(&key);
        assert!(registry.get_route(&key).is_none());
    }
}
