//! Gateway configuration loading.
//!
//! YAML file into [`GatewayConfig`], environment-variable overrides on
//! top, and a validation pass that rejects nonsensical settings before
//! the server starts. A separate resources file declares the initial
//! Backends, Routes, and secrets fed into the registry at startup.

use kortex_core::{Backend, GatewayConfig, Route};
use serde::Deserialize;
use std::path::Path;

/// Load a [`GatewayConfig`] from a YAML file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or the YAML is invalid.
pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let config: GatewayConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config YAML: {}", e))?;
    Ok(config)
}

/// Apply `KORTEX_*` environment-variable overrides.
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(addr) = std::env::var("KORTEX_LISTEN_ADDR") {
        if !addr.is_empty() {
            config.listen_addr = addr;
        }
    }
    if let Ok(size) = std::env::var("KORTEX_MAX_REQUEST_BODY_SIZE") {
        if let Ok(size) = size.parse() {
            config.max_request_body_size = size;
        }
    }
    if let Ok(level) = std::env::var("KORTEX_LOG_LEVEL") {
        if !level.is_empty() {
            config.logging.level = level;
        }
    }
    if let Ok(format) = std::env::var("KORTEX_LOG_FORMAT") {
        if !format.is_empty() {
            config.logging.format = format;
        }
    }
}

/// A secret entry in the resources file.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretEntry {
    pub namespace: String,
    pub name: String,
    pub key: String,
    pub value: String,
}

/// Declared resources loaded at startup. This is the file-based stand-in
/// for whatever system normally feeds the resource registry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourcesFile {
    pub backends: Vec<Backend>,
    pub routes: Vec<Route>,
    pub secrets: Vec<SecretEntry>,
}

/// Load declared Backends, Routes, and secrets from a YAML file,
/// validating every spec before returning.
///
/// # Errors
///
/// Returns an error when the file cannot be read, the YAML is invalid,
/// or any resource spec fails validation.
pub fn load_resources(path: &Path) -> anyhow::Result<ResourcesFile> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read resources file {}: {}", path.display(), e))?;
    let resources: ResourcesFile = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse resources YAML: {}", e))?;

    for backend in &resources.backends {
        backend
            .spec
            .validate()
            .map_err(|e| anyhow::anyhow!("backend {}: {}", backend.key(), e))?;
    }
    for route in &resources.routes {
        route
            .spec
            .validate()
            .map_err(|e| anyhow::anyhow!("route {}: {}", route.key(), e))?;
    }
    Ok(resources)
}

/// Reject configurations that cannot work.
pub fn validate_config(config: &GatewayConfig) -> anyhow::Result<()> {
    if config.listen_addr.is_empty() {
        anyhow::bail!("listen_addr must not be empty");
    }
    if config.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        anyhow::bail!("listen_addr {:?} is not a valid socket address", config.listen_addr);
    }
    if !matches!(config.logging.format.as_str(), "text" | "json") {
        anyhow::bail!(
            "logging.format must be \"text\" or \"json\", got {:?}",
            config.logging.format
        );
    }
    if config.circuit_breaker.failure_threshold == 0 {
        anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
    }
    if config.circuit_breaker.success_threshold == 0 {
        anyhow::bail!("circuit_breaker.success_threshold must be at least 1");
    }
    if !(0.0..=1.0).contains(&config.circuit_breaker.failure_rate_threshold) {
        anyhow::bail!("circuit_breaker.failure_rate_threshold must be within [0, 1]");
    }
    if !(0.0..=1.0).contains(&config.retry.jitter) {
        anyhow::bail!("retry.jitter must be within [0, 1]");
    }
    if config.retry.backoff_multiplier < 1.0 {
        anyhow::bail!("retry.backoff_multiplier must be at least 1.0");
    }
    if config.smart_router.fast_model_threshold > config.smart_router.long_context_threshold {
        anyhow::bail!(
            "smart_router.fast_model_threshold must not exceed long_context_threshold"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
