//! Request routing: route lookup, rule matching, weighted backend
//! selection, and experiment overlay.
//!
//! A request selects its route explicitly via the `X-Route` header
//! (scoped by `X-Namespace`, defaulting to `default`) or implicitly as
//! the first operational route in the namespace, scanned in lexicographic
//! name order so the choice is deterministic. An explicitly requested
//! route that is absent from the cache is a hard miss — there is no
//! fallback to another route.

use crate::backend::{BackendHandler, ProxyRequest};
use crate::cache::ConfigCache;
use crate::experiments::ExperimentManager;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode};
use kortex_core::{BackendRef, Route, RouteMatch, RoutePhase, RouteRule};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

/// Routes requests to backends through the shared config cache.
pub struct Router {
    cache: Arc<ConfigCache>,
    handler: Arc<BackendHandler>,
    experiments: ExperimentManager,
}

impl Router {
    pub fn new(
        cache: Arc<ConfigCache>,
        handler: Arc<BackendHandler>,
        experiments: ExperimentManager,
    ) -> Self {
        Self {
            cache,
            handler,
            experiments,
        }
    }

    /// Find the route that should handle this request.
    ///
    /// With an `X-Route` header the named route must exist in the cache;
    /// a miss returns `None` rather than falling back. Without the header,
    /// the first route in the namespace (by name) whose phase is neither
    /// `Failed` nor `Pending` is chosen.
    pub fn find_route(&self, headers: &HeaderMap) -> Option<Route> {
        let namespace = header_str(headers, "x-namespace").unwrap_or("default");

        if let Some(route_name) = header_str(headers, "x-route") {
            return self.cache.get_route_by_name(namespace, route_name);
        }

        let mut routes = self.cache.list_routes_in_namespace(namespace);
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        routes.into_iter().find(|route| {
            route.status.phase != RoutePhase::Failed && route.status.phase != RoutePhase::Pending
        })
    }

    /// Process an incoming request end to end.
    pub async fn handle_request(&self, req: ProxyRequest) -> Response<Body> {
        let Some(route) = self.find_route(&req.headers) else {
            debug!(
                namespace = header_str(&req.headers, "x-namespace").unwrap_or("default"),
                route = header_str(&req.headers, "x-route").unwrap_or(""),
                "no matching route found"
            );
            return plain_response(StatusCode::NOT_FOUND, "No matching route found");
        };

        if route.status.phase == RoutePhase::Failed {
            info!(route = %route.name, "route is in failed state");
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Route is not operational");
        }

        // First matching rule decides the backend set; the default backend
        // covers rule-less requests.
        let rule = match_rule(&route, &req.headers, &req.path);
        let backends: Vec<BackendRef> = match rule {
            Some(rule) => rule.backends.clone(),
            None => match &route.spec.default_backend {
                Some(default) => vec![default.clone()],
                None => {
                    info!(route = %route.name, "no backend configured for route");
                    return plain_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "No backend configured for this route",
                    );
                }
            },
        };

        let mut selected = select_weighted_backend(&backends);

        // Experiment overlay replaces the selection when the chosen
        // backend is some experiment's control or treatment.
        let mut experiment_result = None;
        if !route.spec.experiments.is_empty() {
            let (backend, result) = self.experiments.apply_experiment(
                &route.spec.experiments,
                &selected.name,
                &req.headers,
                &req.remote_addr,
            );
            if result.is_some() {
                selected.name = backend;
                experiment_result = result;
            }
        }

        debug!(
            route = %route.name,
            backend = %selected.name,
            has_rule = rule.is_some(),
            experiment = experiment_result.is_some(),
            "routing request"
        );

        let mut response = self
            .handler
            .execute_with_fallback(&route, &selected, &req)
            .await;

        if let Some(result) = experiment_result {
            if let Ok(value) = HeaderValue::from_str(&result.experiment) {
                response.headers_mut().insert("x-experiment", value);
            }
            if let Ok(value) = HeaderValue::from_str(&result.variant) {
                response.headers_mut().insert("x-variant", value);
            }
        }

        response
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Find the first rule in the route matching the request.
pub fn match_rule<'a>(route: &'a Route, headers: &HeaderMap, path: &str) -> Option<&'a RouteRule> {
    route
        .spec
        .rules
        .iter()
        .find(|rule| rule_matches(rule, headers, path))
}

/// A rule matches when all of its present conditions hold. A rule without
/// a match block matches every request.
fn rule_matches(rule: &RouteRule, headers: &HeaderMap, path: &str) -> bool {
    let Some(match_) = &rule.match_ else {
        return true;
    };
    conditions_hold(match_, headers, path)
}

fn conditions_hold(match_: &RouteMatch, headers: &HeaderMap, path: &str) -> bool {
    for (key, expected) in &match_.headers {
        if header_str(headers, key.to_lowercase().as_str()) != Some(expected.as_str()) {
            return false;
        }
    }

    if let Some(prefix) = match_.path_prefix.as_deref() {
        if !prefix.is_empty() && !path.starts_with(prefix) {
            return false;
        }
    }

    // Model matching is driven by the X-Model header so the body never
    // needs parsing here; an absent header is vacuously compatible.
    if let Some(pattern) = match_.model_pattern.as_deref() {
        if !pattern.is_empty() {
            if let Some(model) = header_str(headers, "x-model") {
                match glob::Pattern::new(pattern) {
                    Ok(glob) => {
                        if !glob.matches(model) {
                            return false;
                        }
                    }
                    Err(_) => return false,
                }
            }
        }
    }

    true
}

/// Weighted random selection over backend refs. A zero weight counts as
/// the default weight of 100; an all-zero total falls back to the first
/// entry.
pub fn select_weighted_backend(backends: &[BackendRef]) -> BackendRef {
    if backends.is_empty() {
        return BackendRef::new("");
    }
    if backends.len() == 1 {
        return backends[0].clone();
    }

    let effective = |b: &BackendRef| if b.weight == 0 { 100 } else { b.weight };
    let total: u32 = backends.iter().map(effective).sum();
    if total == 0 {
        return backends[0].clone();
    }

    let target = rand::thread_rng().gen_range(0..total);
    let mut cumulative = 0u32;
    for backend in backends {
        cumulative += effective(backend);
        if target < cumulative {
            return backend.clone();
        }
    }
    backends[0].clone()
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
