//! Deterministic A/B experiment assignment.
//!
//! Users are bucketed into `[0, 100)` with a stable FNV-1a hash of
//! `user_id:experiment_name`, so the same user lands in the same variant
//! for the life of the experiment, across restarts and across replicas.
//! The user identity is the first non-empty of the `X-User-ID` header, the
//! `Authorization` header, or the client's remote address.

use crate::metrics::Metrics;
use axum::http::HeaderMap;
use kortex_core::AbExperiment;
use std::sync::Arc;
use tracing::debug;

pub const VARIANT_CONTROL: &str = "control";
pub const VARIANT_TREATMENT: &str = "treatment";

/// Default header carrying the user identity.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The assignment produced for a request that fell under an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentResult {
    pub backend: String,
    pub variant: String,
    pub experiment: String,
}

/// Assigns requests to experiment variants via consistent hashing.
pub struct ExperimentManager {
    metrics: Option<Arc<Metrics>>,
}

impl ExperimentManager {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self { metrics }
    }

    /// Compute the variant assignment for one experiment.
    pub fn assign(
        &self,
        experiment: &AbExperiment,
        headers: &HeaderMap,
        remote_addr: &str,
    ) -> ExperimentResult {
        let user_id = user_identity(headers, remote_addr);
        let bucket = calculate_bucket(&user_id, &experiment.name);

        let traffic_percent = if experiment.traffic_percent <= 0 {
            10
        } else {
            experiment.traffic_percent
        };

        let (backend, variant) = if i32::from(bucket) < traffic_percent {
            (experiment.treatment.clone(), VARIANT_TREATMENT)
        } else {
            (experiment.control.clone(), VARIANT_CONTROL)
        };

        debug!(
            experiment = %experiment.name,
            bucket,
            variant,
            backend = %backend,
            "experiment assignment"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_experiment_assignment(&experiment.name, variant);
        }

        ExperimentResult {
            backend,
            variant: variant.to_string(),
            experiment: experiment.name.clone(),
        }
    }

    /// Overlay the first applicable experiment onto an already-selected
    /// backend. An experiment applies when the selected backend is its
    /// control or its treatment; otherwise the selection passes through.
    pub fn apply_experiment(
        &self,
        experiments: &[AbExperiment],
        selected_backend: &str,
        headers: &HeaderMap,
        remote_addr: &str,
    ) -> (String, Option<ExperimentResult>) {
        let Some(experiment) = experiments
            .iter()
            .find(|e| e.control == selected_backend || e.treatment == selected_backend)
        else {
            return (selected_backend.to_string(), None);
        };

        let result = self.assign(experiment, headers, remote_addr);
        (result.backend.clone(), Some(result))
    }
}

/// Derive a stable user identity from the request.
fn user_identity(headers: &HeaderMap, remote_addr: &str) -> String {
    if let Some(user) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        if !user.is_empty() {
            return user.to_string();
        }
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if !auth.is_empty() {
            return auth.to_string();
        }
    }
    remote_addr.to_string()
}

/// FNV-1a 32-bit over `user:experiment`, reduced mod 100.
///
/// FNV-1a is used deliberately instead of the std hasher: assignments must
/// be identical across process restarts and across replicas, and the std
/// `RandomState` is seeded per process.
fn calculate_bucket(user_id: &str, experiment_name: &str) -> u8 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in user_id.bytes().chain(b":".iter().copied()).chain(experiment_name.bytes()) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % 100) as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
