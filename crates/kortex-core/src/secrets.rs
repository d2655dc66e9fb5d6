//! Secret resolution for external backend credentials.
//!
//! External backends reference API keys by secret name and key. The store
//! behind that lookup is pluggable; the gateway ships an in-memory
//! implementation fed from configuration. Resolution failures are soft:
//! the proxy forwards the request without credentials and lets the backend
//! reject it.

use async_trait::async_trait;
use dashmap::DashMap;

/// Resolves a secret value by (namespace, secret name, key).
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str, key: &str) -> Option<String>;
}

/// In-memory secret store backed by a concurrent map.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: DashMap<(String, String, String), String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.entries
            .insert((namespace.into(), name.into(), key.into()), value.into());
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        self.entries
            .get(&(namespace.to_string(), name.to_string(), key.to_string()))
            .map(|v| v.clone())
    }
}
