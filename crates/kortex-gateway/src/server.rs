//! Top-level HTTP surface: the proxy handler plus admin endpoints.
//!
//! Every proxied request passes the body-size guard (both the declared
//! `Content-Length` and the actual read are capped), then rate limiting,
//! then dispatch through the [`Router`]. Admin endpoints expose health,
//! Prometheus metrics, cost aggregates, and cache statistics.

use crate::backend::ProxyRequest;
use crate::cache::ConfigCache;
use crate::costs::CostTracker;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::router::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::routing::{any, get};
use kortex_core::GatewayConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shared state threaded through axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub cache: Arc<ConfigCache>,
    pub router: Router,
    pub rate_limiter: Arc<RateLimiter>,
    pub cost_tracker: Arc<CostTracker>,
    pub metrics: Option<Arc<Metrics>>,
    /// Root token; each request gets a child so shutdown aborts in-flight
    /// fallback chains.
    pub shutdown: CancellationToken,
}

/// Build the axum router with the proxy fallback and admin routes.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/costs", get(costs_handler))
        .route("/api/v1/cache/stats", get(cache_stats_handler))
        .fallback(any(gateway_handler))
        .with_state(state)
}

/// The proxy entrypoint for every non-admin request.
async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let max_body = state.config.max_request_body_size;

    // Fast reject on the declared length; the capped read below catches
    // chunked transfers that never declare one.
    if max_body > 0 {
        if let Some(length) = req
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length > max_body {
                debug!(length, max_body, "request rejected: body too large");
                return plain_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Request body too large",
                );
            }
        }
    }

    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_default();

    let (parts, body) = req.into_parts();
    let limit = if max_body > 0 {
        max_body as usize
    } else {
        usize::MAX
    };
    let body = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return plain_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };

    // Rate limiting happens before dispatch, keyed by the route that will
    // serve the request.
    let mut limit_headers: Option<(u32, u32)> = None;
    if let Some(route) = state.router.find_route(&parts.headers) {
        if let Some(rate_limit) = &route.spec.rate_limit {
            let user_header = if rate_limit.user_header.is_empty() {
                "x-user-id"
            } else {
                rate_limit.user_header.as_str()
            };
            let user_id = parts
                .headers
                .get(user_header)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            let decision = state.rate_limiter.allow(&route.name, user_id, rate_limit);
            if !decision.allowed {
                if let Some(m) = &state.metrics {
                    m.record_rate_limit_hit(&route.name);
                }
                debug!(
                    route = %route.name,
                    user = user_id,
                    retry_after_secs = decision.retry_after.as_secs(),
                    "rate limit exceeded"
                );
                let mut response =
                    plain_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
                set_header(&mut response, "x-ratelimit-limit", decision.limit);
                set_header(&mut response, "x-ratelimit-remaining", 0u32);
                set_header(
                    &mut response,
                    "retry-after",
                    decision.retry_after.as_secs() + 1,
                );
                return response;
            }
            limit_headers = Some((decision.limit, decision.remaining));
        }
    }

    let proxy_req = ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(|q| q.to_string()),
        headers: parts.headers,
        body,
        remote_addr,
        cancel: state.shutdown.child_token(),
    };

    let mut response = state.router.handle_request(proxy_req).await;

    if let Some((limit, remaining)) = limit_headers {
        set_header(&mut response, "x-ratelimit-limit", limit);
        set_header(&mut response, "x-ratelimit-remaining", remaining);
    }
    response
}

/// Liveness plus cache statistics.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response<Body> {
    let stats = state.cache.stats();
    let body = serde_json::json!({
        "status": "ok",
        "routes": stats.route_count,
        "backends": stats.backend_count,
    });
    json_response(StatusCode::OK, &body)
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response<Body> {
    match &state.metrics {
        Some(metrics) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Body::from(metrics.render()))
            .unwrap_or_default(),
        None => plain_response(StatusCode::NOT_FOUND, "metrics disabled"),
    }
}

/// Aggregated costs per route and backend.
async fn costs_handler(State(state): State<Arc<AppState>>) -> Response<Body> {
    let (routes, backends) = state.cost_tracker.all_stats();
    let body = serde_json::json!({
        "routes": routes,
        "backends": backends,
    });
    json_response(StatusCode::OK, &body)
}

async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> Response<Body> {
    let stats = state.cache.stats();
    json_response(StatusCode::OK, &serde_json::json!(stats))
}

fn set_header<V: std::fmt::Display>(response: &mut Response<Body>, name: &'static str, value: V) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        response.headers_mut().insert(name, value);
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
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
