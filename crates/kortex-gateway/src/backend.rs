//! Backend execution: reverse proxy over an ordered fallback chain.
//!
//! The selected backend is tried first, then the route's fallback chain
//! (deduplicated, order preserved). Each backend is gated by its circuit
//! breaker and executed through the retrier under a per-attempt deadline.
//! Success means a response below 500; anything else advances the chain
//! after a short exponential backoff. Non-Healthy backends are skipped
//! except as last resort, which is surfaced with its own log and counter.
//!
//! Non-streaming responses are buffered so provider token usage can be
//! parsed for cost accounting; streaming responses (no content length or
//! SSE) are forwarded chunk-by-chunk untouched.

use crate::cache::ConfigCache;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::costs::CostTracker;
use crate::metrics::Metrics;
use crate::provider::parse_token_usage;
use crate::retry::Retrier;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Response, StatusCode};
use bytes::Bytes;
use futures_util::TryStreamExt;
use kortex_core::{
    Backend, BackendRef, BackendVariant, HealthState, KortexError, Result, Route, SecretStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The request material carried through routing into backend execution.
/// The body is fully read by the server (for the size guard), so attempts
/// can be replayed byte-identically across retries and fallbacks.
#[derive(Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: String,
    pub cancel: CancellationToken,
}

impl ProxyRequest {
    /// Convenience constructor for tests and embedding.
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers,
            body,
            remote_addr: String::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// An upstream response captured by one attempt.
enum Upstream {
    /// Fully buffered: usage parsing and cost accounting are possible.
    Buffered {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    /// Streaming: forwarded transparently, cost accounting skipped.
    Streaming {
        status: u16,
        headers: HeaderMap,
        response: reqwest::Response,
    },
}

impl Upstream {
    fn status(&self) -> u16 {
        match self {
            Upstream::Buffered { status, .. } | Upstream::Streaming { status, .. } => *status,
        }
    }
}

/// Executes requests against backends with fallback, breaker, retry, and
/// cost capture.
pub struct BackendHandler {
    cache: Arc<ConfigCache>,
    client: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
    breakers: Arc<CircuitBreakerManager>,
    retrier: Retrier,
    cost_tracker: Arc<CostTracker>,
    metrics: Option<Arc<Metrics>>,
}

impl BackendHandler {
    pub fn new(
        cache: Arc<ConfigCache>,
        client: reqwest::Client,
        secrets: Arc<dyn SecretStore>,
        breakers: Arc<CircuitBreakerManager>,
        retrier: Retrier,
        cost_tracker: Arc<CostTracker>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            cache,
            client,
            secrets,
            breakers,
            retrier,
            cost_tracker,
            metrics,
        }
    }

    /// Try the primary backend, then each fallback in order.
    pub async fn execute_with_fallback(
        &self,
        route: &Route,
        primary: &BackendRef,
        req: &ProxyRequest,
    ) -> Response<Body> {
        let chain = build_fallback_chain(route, primary);
        let attempt_timeout = Duration::from_secs(
            route
                .spec
                .fallback
                .as_ref()
                .map(|f| f.timeout_seconds)
                .filter(|t| *t > 0)
                .unwrap_or(30),
        );

        let mut last_error: Option<KortexError> = None;
        let mut previous_backend: Option<String> = None;

        for (i, backend_name) in chain.iter().enumerate() {
            let is_last = i == chain.len() - 1;

            let Some(backend) = self.cache.get_backend_by_name(&route.namespace, backend_name)
            else {
                debug!(backend = %backend_name, "backend not found in cache");
                self.record_error(&route.name, backend_name, "not_found");
                last_error = Some(KortexError::BackendNotFound(backend_name.clone()));
                continue;
            };

            if backend.status.health != HealthState::Healthy {
                if !is_last {
                    debug!(
                        backend = %backend_name,
                        health = %backend.status.health,
                        "skipping unhealthy backend"
                    );
                    continue;
                }
                // Last resort: used despite its health, with a distinct
                // signal so silent degradation is visible.
                warn!(
                    route = %route.name,
                    backend = %backend_name,
                    health = %backend.status.health,
                    "using non-healthy backend as last resort"
                );
                if let Some(m) = &self.metrics {
                    m.record_last_resort(&route.name, backend_name);
                }
            }

            if let Err(e) = self.breakers.allow(backend_name) {
                debug!(backend = %backend_name, error = %e, "circuit breaker rejected backend");
                self.record_error(&route.name, backend_name, "circuit_open");
                last_error = Some(e);
                continue;
            }

            if let Some(prev) = &previous_backend {
                if let Some(m) = &self.metrics {
                    m.record_fallback(&route.name, prev, backend_name);
                }
            }

            if let Some(m) = &self.metrics {
                m.inc_active_requests(backend_name);
            }
            let start = Instant::now();
            let result = self.attempt_backend(&backend, req, attempt_timeout).await;
            let duration = start.elapsed();
            if let Some(m) = &self.metrics {
                m.dec_active_requests(backend_name);
            }

            match result {
                Ok(upstream) => {
                    let status = upstream.status();
                    if let Some(m) = &self.metrics {
                        m.record_request(&route.name, backend_name, status, duration);
                    }

                    if status < 500 {
                        self.breakers.record_success(backend_name);
                        return self.finalize_response(route, &backend, upstream).await;
                    }

                    // Server error after all retries: count it and move on
                    self.breakers.record_failure(backend_name);
                    self.record_error(&route.name, backend_name, "server_error");
                    last_error = Some(KortexError::BackendStatus(status));
                }
                Err(KortexError::Cancelled) => {
                    return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Request cancelled");
                }
                Err(e) => {
                    self.breakers.record_failure(backend_name);
                    if let Some(m) = &self.metrics {
                        m.record_request(&route.name, backend_name, 0, duration);
                    }
                    self.record_error(&route.name, backend_name, "request_failed");
                    info!(
                        backend = %backend_name,
                        error = %e,
                        attempt = i + 1,
                        total = chain.len(),
                        "backend request failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
            previous_backend = Some(backend_name.clone());

            // Exponential backoff between fallback attempts, capped at 2s
            if !is_last {
                let backoff = Duration::from_millis(100u64 << i.min(6)).min(Duration::from_secs(2));
                tokio::select! {
                    _ = req.cancel.cancelled() => {
                        return plain_response(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "Request cancelled",
                        );
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        let message = match &last_error {
            Some(e) => format!("All backends failed: {e}"),
            None => "All backends failed".to_string(),
        };
        error!(route = %route.name, %message, "fallback chain exhausted");
        plain_response(StatusCode::SERVICE_UNAVAILABLE, &message)
    }

    /// Execute one backend through the retrier under the per-attempt
    /// deadline, returning the captured upstream response.
    async fn attempt_backend(
        &self,
        backend: &Backend,
        req: &ProxyRequest,
        attempt_timeout: Duration,
    ) -> Result<Upstream> {
        let target = build_target_url(backend)?;
        let captured: Arc<Mutex<Option<Upstream>>> = Arc::new(Mutex::new(None));

        let outcome = self
            .retrier
            .run(&backend.name, &req.cancel, |_attempt| {
                let captured = Arc::clone(&captured);
                let target = target.clone();
                async move {
                    let forward = self.forward_once(backend, req, &target);
                    let upstream = match tokio::time::timeout(attempt_timeout, forward).await {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(KortexError::upstream(
                                format!(
                                    "attempt deadline of {}s exceeded",
                                    attempt_timeout.as_secs()
                                ),
                                false,
                                true,
                            ))
                        }
                    };
                    let status = upstream.status();
                    *captured.lock().await = Some(upstream);
                    Ok(status)
                }
            })
            .await;

        if let Some(e) = outcome.last_error {
            return Err(e);
        }

        let upstream = captured.lock().await.take();
        upstream.ok_or_else(|| KortexError::upstream("no response captured", false, false))
    }

    /// One reverse-proxied request to the backend.
    async fn forward_once(
        &self,
        backend: &Backend,
        req: &ProxyRequest,
        target: &reqwest::Url,
    ) -> Result<Upstream> {
        let mut url = target.clone();
        // Preserve the original request path under the target's base path
        let base = url.path().trim_end_matches('/');
        let path = if base.is_empty() || base == "/" {
            req.path.clone()
        } else {
            format!("{base}{}", req.path)
        };
        url.set_path(&path);
        url.set_query(req.query.as_deref());

        let mut request = self
            .client
            .request(req.method.clone(), url.clone())
            .body(req.body.clone());

        // Forward headers except Host; reqwest derives it from the URL
        let mut forwarded = HeaderMap::new();
        for (name, value) in req.headers.iter() {
            if name == "host" || name == "content-length" {
                continue;
            }
            forwarded.insert(name.clone(), value.clone());
        }
        request = request.headers(forwarded);

        if let BackendVariant::External(_) = &backend.spec.variant {
            request = self.inject_api_key(request, backend).await;
        }

        debug!(target = %url, backend = %backend.name, "proxying request");

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if is_streaming(&headers) {
            return Ok(Upstream::Streaming {
                status,
                headers,
                response,
            });
        }

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(Upstream::Buffered {
            status,
            headers,
            body,
        })
    }

    /// Inject provider credentials for an external backend. A missing
    /// secret is logged and the request proceeds bare; the backend's
    /// rejection is the client's answer.
    async fn inject_api_key(
        &self,
        request: reqwest::RequestBuilder,
        backend: &Backend,
    ) -> reqwest::RequestBuilder {
        let BackendVariant::External(ext) = &backend.spec.variant else {
            return request;
        };
        let Some(secret_ref) = &ext.api_key_secret else {
            return request;
        };

        let Some(api_key) = self
            .secrets
            .get(&backend.namespace, &secret_ref.name, &secret_ref.key)
            .await
        else {
            warn!(
                backend = %backend.name,
                secret = %secret_ref.name,
                key = %secret_ref.key,
                "API key secret not resolvable, forwarding without credentials"
            );
            return request;
        };

        match ext.provider.as_str() {
            "anthropic" => request
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
            // openai, cohere, and anything else use a bearer token
            _ => request.header("authorization", format!("Bearer {api_key}")),
        }
    }

    /// Turn the captured upstream response into the client response,
    /// accounting costs for buffered bodies on cost-tracked routes.
    async fn finalize_response(
        &self,
        route: &Route,
        backend: &Backend,
        upstream: Upstream,
    ) -> Response<Body> {
        match upstream {
            Upstream::Buffered {
                status,
                headers,
                body,
            } => {
                if route.spec.cost_tracking {
                    if let Some(cost_spec) = &backend.spec.cost {
                        let usage =
                            parse_token_usage(backend.spec.variant.provider(), &headers, &body);
                        if !usage.is_empty() {
                            self.cost_tracker.track_request(
                                &route.name,
                                &backend.name,
                                usage,
                                cost_spec,
                            );
                        }
                    }
                }
                self.build_response(backend, status, &headers, Body::from(body))
            }
            Upstream::Streaming {
                status,
                headers,
                response,
            } => {
                // Forward chunks as they arrive; buffering an SSE stream
                // would stall the client, so cost capture is skipped.
                let stream = response
                    .bytes_stream()
                    .map_err(|e| std::io::Error::other(e.to_string()));
                self.build_response(backend, status, &headers, Body::from_stream(stream))
            }
        }
    }

    fn build_response(
        &self,
        backend: &Backend,
        status: u16,
        headers: &HeaderMap,
        body: Body,
    ) -> Response<Body> {
        let mut builder =
            Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));

        for (name, value) in headers.iter() {
            // The body may be re-framed (buffered or re-chunked)
            if name == "transfer-encoding" || name == "content-length" {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder
            .header("x-served-by", &backend.name)
            .header("x-backend-type", backend.spec.variant.type_name());

        builder.body(body).unwrap_or_else(|_| {
            plain_response(StatusCode::BAD_GATEWAY, "Failed to build response")
        })
    }

    fn record_error(&self, route: &str, backend: &str, error_type: &str) {
        if let Some(m) = &self.metrics {
            m.record_error(route, backend, error_type);
        }
    }
}

/// Ordered fallback chain: the primary first, then the route's fallback
/// backends with duplicates removed.
pub fn build_fallback_chain(route: &Route, primary: &BackendRef) -> Vec<String> {
    let mut chain = vec![primary.name.clone()];
    if let Some(fallback) = &route.spec.fallback {
        for name in &fallback.backends {
            if !chain.contains(name) {
                chain.push(name.clone());
            }
        }
    }
    chain
}

/// Construct the base URL for a backend from its type.
pub fn build_target_url(backend: &Backend) -> Result<reqwest::Url> {
    let raw = match &backend.spec.variant {
        BackendVariant::External(ext) => {
            if ext.url.is_empty() {
                return Err(KortexError::Config(
                    "external backend URL is not configured".to_string(),
                ));
            }
            ext.url.clone()
        }
        BackendVariant::Kubernetes(k8s) => {
            if k8s.service_name.is_empty() {
                return Err(KortexError::Config(
                    "kubernetes backend service_name is not configured".to_string(),
                ));
            }
            format!(
                "http://{}.{}.svc.cluster.local:{}",
                k8s.service_name,
                backend.service_namespace(),
                k8s.port
            )
        }
        BackendVariant::KServe(kserve) => {
            if kserve.service_name.is_empty() {
                return Err(KortexError::Config(
                    "kserve backend service_name is not configured".to_string(),
                ));
            }
            format!(
                "http://{}-predictor.{}.svc.cluster.local",
                kserve.service_name,
                backend.service_namespace()
            )
        }
    };

    reqwest::Url::parse(&raw)
        .map_err(|e| KortexError::Config(format!("invalid backend URL {raw}: {e}")))
}

/// A response is treated as streaming when it carries no fixed content
/// length (chunked semantics) or announces itself as server-sent events.
fn is_streaming(headers: &HeaderMap) -> bool {
    let sse = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));
    sse || !headers.contains_key("content-length")
}

fn map_reqwest_error(e: reqwest::Error) -> KortexError {
    KortexError::upstream(e.to_string(), e.is_connect(), e.is_timeout())
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
