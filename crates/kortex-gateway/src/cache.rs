//! Shared configuration cache between the control plane and the proxy.
//!
//! Reconcilers publish Routes and Backends here after every reconcile; the
//! proxy reads from it on every request instead of consulting the resource
//! registry. Values are cloned on both boundaries so callers can never
//! observe or cause partial writes. This cache is the only mutable surface
//! shared between the two planes.

use kortex_core::{Backend, HealthState, NamespacedName, Route};
use std::collections::HashMap;
use std::sync::RwLock;

/// Cache statistics, exposed on the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub route_count: usize,
    pub backend_count: usize,
}

/// Thread-safe snapshot of all Routes and Backends, keyed by
/// (namespace, name).
pub struct ConfigCache {
    routes: RwLock<HashMap<NamespacedName, Route>>,
    backends: RwLock<HashMap<NamespacedName, Backend>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            backends: RwLock::new(HashMap::new()),
        }
    }

    // --- Route operations ---

    pub fn set_route(&self, key: NamespacedName, route: Route) {
        self.routes
            .write()
            .expect("cache lock poisoned")
            .insert(key, route);
    }

    pub fn get_route(&self, key: &NamespacedName) -> Option<Route> {
        self.routes
            .read()
            .expect("cache lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn delete_route(&self, key: &NamespacedName) {
        self.routes
            .write()
            .expect("cache lock poisoned")
            .remove(key);
    }

    pub fn list_routes(&self) -> Vec<Route> {
        self.routes
            .read()
            .expect("cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn list_routes_in_namespace(&self, namespace: &str) -> Vec<Route> {
        self.routes
            .read()
            .expect("cache lock poisoned")
            .values()
            .filter(|r| r.namespace == namespace)
            .cloned()
            .collect()
    }

    // --- Backend operations ---

    pub fn set_backend(&self, key: NamespacedName, backend: Backend) {
        self.backends
            .write()
            .expect("cache lock poisoned")
            .insert(key, backend);
    }

    pub fn get_backend(&self, key: &NamespacedName) -> Option<Backend> {
        self.backends
            .read()
            .expect("cache lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn delete_backend(&self, key: &NamespacedName) {
        self.backends
            .write()
            .expect("cache lock poisoned")
            .remove(key);
    }

    pub fn list_backends(&self) -> Vec<Backend> {
        self.backends
            .read()
            .expect("cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn list_backends_in_namespace(&self, namespace: &str) -> Vec<Backend> {
        self.backends
            .read()
            .expect("cache lock poisoned")
            .values()
            .filter(|b| b.namespace == namespace)
            .cloned()
            .collect()
    }

    // --- Convenience methods for the proxy ---

    pub fn get_backend_by_name(&self, namespace: &str, name: &str) -> Option<Backend> {
        self.get_backend(&NamespacedName::new(namespace, name))
    }

    pub fn get_route_by_name(&self, namespace: &str, name: &str) -> Option<Route> {
        self.get_route(&NamespacedName::new(namespace, name))
    }

    /// Retrieve a backend only if its observed health is `Healthy`.
    pub fn get_healthy_backend(&self, namespace: &str, name: &str) -> Option<Backend> {
        self.get_backend_by_name(namespace, name)
            .filter(|b| b.status.health == HealthState::Healthy)
    }

    // --- Stats ---

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            route_count: self.routes.read().expect("cache lock poisoned").len(),
            backend_count: self.backends.read().expect("cache lock poisoned").len(),
        }
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
