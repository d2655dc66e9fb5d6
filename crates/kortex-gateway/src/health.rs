//! Active health probing for inference backends.
//!
//! The prober synthesizes a probe URL from the backend type and performs a
//! bounded HTTP check. External endpoints get a lightweight HEAD request —
//! a 401/403 still means the service is reachable, so anything below 500
//! counts as healthy. Cluster-local services get a GET against their
//! health path and must answer in the 2xx/3xx band.

use chrono::{DateTime, Utc};
use kortex_core::{Backend, BackendVariant, KortexError, Result};
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of a single health probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    fn unhealthy(error: impl Into<String>, latency: Duration) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Performs health checks against inference backends.
pub struct Prober {
    client: Client,
}

impl Prober {
    /// Create a prober with a dedicated HTTP client. The per-probe deadline
    /// comes from each backend's health-check spec; the client-level
    /// timeout is only a generous upper bound.
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Probe a backend, bounded by its configured health-check timeout.
    pub async fn probe(&self, backend: &Backend) -> ProbeResult {
        let timeout = Duration::from_secs(backend.spec.probe_timeout_seconds());

        let url = match build_probe_url(backend) {
            Ok(url) => url,
            Err(e) => return ProbeResult::unhealthy(e.to_string(), Duration::ZERO),
        };

        match &backend.spec.variant {
            BackendVariant::External(_) => self.probe_external(&url, timeout).await,
            BackendVariant::Kubernetes(_) | BackendVariant::KServe(_) => {
                self.probe_service(&url, timeout).await
            }
        }
    }

    /// HEAD the external URL. Reachability is the signal: even an
    /// authentication rejection proves the endpoint is up.
    async fn probe_external(&self, url: &str, timeout: Duration) -> ProbeResult {
        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.client.head(url).send()).await;
        let latency = start.elapsed();

        match outcome {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let healthy = status < 500;
                debug!(url, status, healthy, latency_ms = latency.as_millis() as u64, "external probe");
                ProbeResult {
                    healthy,
                    latency,
                    error: if healthy {
                        None
                    } else {
                        Some(format!("external API returned status {status}"))
                    },
                    timestamp: Utc::now(),
                }
            }
            Ok(Err(e)) => ProbeResult::unhealthy(format!("health check failed: {e}"), latency),
            Err(_) => ProbeResult::unhealthy(
                format!("health check timed out after {}ms", timeout.as_millis()),
                latency,
            ),
        }
    }

    /// GET the service health path; 2xx/3xx is healthy.
    async fn probe_service(&self, url: &str, timeout: Duration) -> ProbeResult {
        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.client.get(url).send()).await;
        let latency = start.elapsed();

        match outcome {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let healthy = (200..400).contains(&status);
                debug!(url, status, healthy, latency_ms = latency.as_millis() as u64, "service probe");
                ProbeResult {
                    healthy,
                    latency,
                    error: if healthy {
                        None
                    } else {
                        Some(format!("health check returned status {status}"))
                    },
                    timestamp: Utc::now(),
                }
            }
            Ok(Err(e)) => ProbeResult::unhealthy(format!("health check failed: {e}"), latency),
            Err(_) => ProbeResult::unhealthy(
                format!("health check timed out after {}ms", timeout.as_millis()),
                latency,
            ),
        }
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

/// Construct the probe URL for a backend.
///
/// External backends are probed at their configured URL verbatim. Cluster
/// services resolve through the cluster DNS with the health path appended:
/// `/health` by default for Kubernetes services, `/v1/models` for KServe
/// predictors.
pub fn build_probe_url(backend: &Backend) -> Result<String> {
    match &backend.spec.variant {
        BackendVariant::External(ext) => {
            if ext.url.is_empty() {
                return Err(KortexError::Config(
                    "external backend URL is not configured".to_string(),
                ));
            }
            Ok(ext.url.clone())
        }
        BackendVariant::Kubernetes(k8s) => {
            if k8s.service_name.is_empty() {
                return Err(KortexError::Config(
                    "kubernetes backend service_name is not configured".to_string(),
                ));
            }
            let namespace = backend.service_namespace();
            let path = probe_path(backend, "/health");
            Ok(format!(
                "http://{}.{}.svc.cluster.local:{}{}",
                k8s.service_name, namespace, k8s.port, path
            ))
        }
        BackendVariant::KServe(kserve) => {
            if kserve.service_name.is_empty() {
                return Err(KortexError::Config(
                    "kserve backend service_name is not configured".to_string(),
                ));
            }
            let namespace = backend.service_namespace();
            let path = probe_path(backend, "/v1/models");
            Ok(format!(
                "http://{}-predictor.{}.svc.cluster.local{}",
                kserve.service_name, namespace, path
            ))
        }
    }
}

fn probe_path<'a>(backend: &'a Backend, default: &'a str) -> &'a str {
    backend
        .spec
        .health_check
        .as_ref()
        .and_then(|h| h.path.as_deref())
        .filter(|p| !p.is_empty())
        .unwrap_or(default)
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
        BackendSpec, BackendStatus, ExternalBackend, HealthCheckSpec, KServeBackend,
        KubernetesBackend,
    };

    fn make_backend(variant: BackendVariant, health_check: Option<HealthCheckSpec>) -> Backend {
        Backend {
            namespace: "default".to_string(),
            name: "test".to_string(),
            spec: BackendSpec {
                variant,
                health_check,
                cost: None,
                timeout_seconds: 60,
                priority: 0,
            },
            status: BackendStatus::default(),
        }
    }

    fn external(url: &str) -> BackendVariant {
        BackendVariant::External(ExternalBackend {
            url: url.to_string(),
            provider: "openai".to_string(),
            api_key_secret: None,
            model: None,
        })
    }

    /// Spin up a local axum server answering `status` on every path.
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

    // ---- URL synthesis ------------------------------------------------------

    #[test]
    fn test_probe_url_external_verbatim() {
        let backend = make_backend(external("https://api.openai.com/v1"), None);
        assert_eq!(
            build_probe_url(&backend).unwrap(),
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn test_probe_url_external_empty_is_error() {
        let backend = make_backend(external(""), None);
        assert!(build_probe_url(&backend).is_err());
    }

    #[test]
    fn test_probe_url_kubernetes_default_path() {
        let backend = make_backend(
            BackendVariant::Kubernetes(KubernetesBackend {
                service_name: "vllm".to_string(),
                namespace: None,
                port: 8080,
            }),
            None,
        );
        assert_eq!(
            build_probe_url(&backend).unwrap(),
            "http://vllm.default.svc.cluster.local:8080/health"
        );
    }

    #[test]
    fn test_probe_url_kubernetes_custom_path_and_port() {
        let backend = make_backend(
            BackendVariant::Kubernetes(KubernetesBackend {
                service_name: "vllm".to_string(),
                namespace: Some("serving".to_string()),
                port: 9000,
            }),
            Some(HealthCheckSpec {
                path: Some("/status".to_string()),
                ..HealthCheckSpec::default()
            }),
        );
        assert_eq!(
            build_probe_url(&backend).unwrap(),
            "http://vllm.serving.svc.cluster.local:9000/status"
        );
    }

    #[test]
    fn test_probe_url_kserve_default_path() {
        let backend = make_backend(
            BackendVariant::KServe(KServeBackend {
                service_name: "llama".to_string(),
                namespace: None,
            }),
            None,
        );
        assert_eq!(
            build_probe_url(&backend).unwrap(),
            "http://llama-predictor.default.svc.cluster.local/v1/models"
        );
    }

    #[test]
    fn test_probe_url_kserve_namespace_override() {
        let backend = make_backend(
            BackendVariant::KServe(KServeBackend {
                service_name: "llama".to_string(),
                namespace: Some("models".to_string()),
            }),
            None,
        );
        assert_eq!(
            build_probe_url(&backend).unwrap(),
            "http://llama-predictor.models.svc.cluster.local/v1/models"
        );
    }

    #[test]
    fn test_probe_path_empty_string_uses_default() {
        let backend = make_backend(
            BackendVariant::Kubernetes(KubernetesBackend {
                service_name: "svc".to_string(),
                namespace: None,
                port: 8080,
            }),
            Some(HealthCheckSpec {
                path: Some(String::new()),
                ..HealthCheckSpec::default()
            }),
        );
        assert!(build_probe_url(&backend).unwrap().ends_with("/health"));
    }

    // ---- Probing ------------------------------------------------------------

    #[tokio::test]
    async fn test_external_probe_200_healthy() {
        let url = spawn_upstream(StatusCode::OK).await;
        let backend = make_backend(external(&url), None);

        let result = Prober::new().probe(&backend).await;
        assert!(result.healthy);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_external_probe_401_still_healthy() {
        let url = spawn_upstream(StatusCode::UNAUTHORIZED).await;
        let backend = make_backend(external(&url), None);

        let result = Prober::new().probe(&backend).await;
        assert!(result.healthy, "401 means reachable, hence healthy");
    }

    #[tokio::test]
    async fn test_external_probe_500_unhealthy() {
        let url = spawn_upstream(StatusCode::INTERNAL_SERVER_ERROR).await;
        let backend = make_backend(external(&url), None);

        let result = Prober::new().probe(&backend).await;
        assert!(!result.healthy);
        assert!(result.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_external_probe_connection_refused() {
        // Port 1 is essentially never listening
        let backend = make_backend(
            external("http://127.0.0.1:1"),
            Some(HealthCheckSpec {
                timeout_seconds: 1,
                ..HealthCheckSpec::default()
            }),
        );

        let result = Prober::new().probe(&backend).await;
        assert!(!result.healthy);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_service_probe_band() {
        // A kubernetes-type backend can't resolve cluster DNS in tests, so
        // drive the band check through the service prober directly.
        let prober = Prober::new();

        let ok = spawn_upstream(StatusCode::NO_CONTENT).await;
        let result = prober
            .probe_service(&format!("{ok}/health"), Duration::from_secs(2))
            .await;
        assert!(result.healthy);

        let missing = spawn_upstream(StatusCode::NOT_FOUND).await;
        let result = prober
            .probe_service(&format!("{missing}/health"), Duration::from_secs(2))
            .await;
        assert!(!result.healthy, "404 is outside the 2xx/3xx healthy band");
    }

    #[tokio::test]
    async fn test_probe_latency_recorded() {
        let url = spawn_upstream(StatusCode::OK).await;
        let backend = make_backend(external(&url), None);

        let result = Prober::new().probe(&backend).await;
        assert!(result.latency > Duration::ZERO);
    }
}
