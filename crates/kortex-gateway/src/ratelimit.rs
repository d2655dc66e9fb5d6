//! Token-bucket rate limiting per route and per (route, user).
//!
//! Each bucket refills continuously at `requests_per_minute / 60` tokens
//! per second with a burst capacity of one minute's worth of requests.
//! When a route's limit is per-user and the request carries a user id,
//! only the per-user bucket is consulted; the route-wide bucket is not
//! layered on top. Per-user buckets are evicted by a background sweep once
//! idle for longer than a TTL, keeping memory bounded under bursty user
//! populations.

use kortex_core::{RateLimitSpec, RateLimiterConfig};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// The configured requests-per-minute limit, echoed in headers.
    pub limit: u32,
    /// Approximate whole tokens remaining after this request.
    pub remaining: u32,
    /// How long until the next token when denied.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    fn allow_unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            retry_after: Duration::ZERO,
        }
    }
}

/// A continuously-refilling token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    /// Tokens per second.
    rate: f64,
    burst: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            rate,
            burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Consume one token if available.
    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one full token is available. Call after a failed consume.
    fn time_until_token(&self) -> Duration {
        let deficit = (1.0 - self.tokens).max(0.0);
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(deficit / self.rate)
    }

    /// Update rate and burst in place; excess tokens are clamped.
    fn set_limit(&mut self, rate: f64, burst: f64) {
        self.rate = rate;
        self.burst = burst;
        self.tokens = self.tokens.min(burst);
    }
}

#[derive(Default)]
struct Buckets {
    routes: HashMap<String, TokenBucket>,
    /// Keyed by `route:user`.
    users: HashMap<String, TokenBucket>,
    last_access: HashMap<String, Instant>,
}

/// Rate limiter statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub route_count: usize,
    pub user_count: usize,
}

/// Enforces token-bucket limits keyed by route or route+user.
pub struct RateLimiter {
    buckets: Mutex<Buckets>,
    cleanup_interval: Duration,
    user_bucket_ttl: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimiterConfig) -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
            user_bucket_ttl: Duration::from_secs(config.user_bucket_ttl_seconds),
        }
    }

    /// Check (and consume one token from) the limit for a request.
    ///
    /// With `per_user` set and a non-empty user id, only the
    /// `route:user` bucket is consulted; otherwise the route bucket.
    pub fn allow(&self, route_name: &str, user_id: &str, spec: &RateLimitSpec) -> RateLimitDecision {
        if spec.requests_per_minute == 0 {
            return RateLimitDecision::allow_unlimited();
        }

        let rate = f64::from(spec.requests_per_minute) / 60.0;
        let burst = f64::from(spec.requests_per_minute);
        let now = Instant::now();

        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");

        if spec.per_user && !user_id.is_empty() {
            let key = format!("{route_name}:{user_id}");
            buckets.last_access.insert(key.clone(), now);
            let bucket = buckets
                .users
                .entry(key)
                .or_insert_with(|| TokenBucket::new(rate, burst));
            return Self::decide(bucket, spec.requests_per_minute, now);
        }

        let bucket = buckets
            .routes
            .entry(route_name.to_string())
            .or_insert_with(|| TokenBucket::new(rate, burst));
        Self::decide(bucket, spec.requests_per_minute, now)
    }

    fn decide(bucket: &mut TokenBucket, limit: u32, now: Instant) -> RateLimitDecision {
        if bucket.try_consume(now) {
            RateLimitDecision {
                allowed: true,
                limit,
                remaining: bucket.tokens.floor().max(0.0) as u32,
                retry_after: Duration::ZERO,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: bucket.time_until_token(),
            }
        }
    }

    /// Propagate a changed route limit into the existing buckets.
    pub fn update_route_limit(&self, route_name: &str, spec: Option<&RateLimitSpec>) {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");

        let Some(spec) = spec.filter(|s| s.requests_per_minute > 0) else {
            buckets.routes.remove(route_name);
            return;
        };

        let rate = f64::from(spec.requests_per_minute) / 60.0;
        let burst = f64::from(spec.requests_per_minute);

        if let Some(bucket) = buckets.routes.get_mut(route_name) {
            bucket.set_limit(rate, burst);
        } else {
            buckets
                .routes
                .insert(route_name.to_string(), TokenBucket::new(rate, burst));
        }

        let prefix = format!("{route_name}:");
        for (key, bucket) in buckets.users.iter_mut() {
            if key.starts_with(&prefix) {
                bucket.set_limit(rate, burst);
            }
        }
    }

    /// Remove a deleted route's bucket and every per-user bucket under it.
    pub fn remove_route(&self, route_name: &str) {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        buckets.routes.remove(route_name);

        let prefix = format!("{route_name}:");
        buckets.users.retain(|key, _| !key.starts_with(&prefix));
        buckets
            .last_access
            .retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drop per-user buckets untouched for longer than the TTL.
    pub fn evict_stale(&self) -> usize {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let ttl = self.user_bucket_ttl;

        let stale: Vec<String> = buckets
            .last_access
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            buckets.users.remove(key);
            buckets.last_access.remove(key);
        }
        stale.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        RateLimiterStats {
            route_count: buckets.routes.len(),
            user_count: buckets.users.len(),
        }
    }

    /// Background eviction loop. Runs until the shutdown token is
    /// cancelled.
    pub async fn run_eviction(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.evict_stale();
                    if evicted > 0 {
                        debug!(evicted, "evicted stale per-user rate-limit buckets");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("rate limiter eviction loop stopping");
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rpm: u32, per_user: bool) -> RateLimitSpec {
        RateLimitSpec {
            requests_per_minute: rpm,
            per_user,
            user_header: "x-user-id".to_string(),
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(&RateLimiterConfig::default())
    }

    fn limiter_with_ttl(ttl_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimiterConfig {
            cleanup_interval_seconds: 1,
            user_bucket_ttl_seconds: ttl_secs,
        })
    }

    #[test]
    fn test_allows_burst_up_to_rpm() {
        let limiter = limiter();
        let spec = spec(60, false);

        for i in 0..60 {
            let decision = limiter.allow("chat", "", &spec);
            assert!(decision.allowed, "request {i} should pass within the burst");
            assert_eq!(decision.limit, 60);
        }

        let decision = limiter.allow("chat", "", &spec);
        assert!(!decision.allowed, "61st immediate request exceeds the burst");
        assert!(decision.retry_after > Duration::ZERO);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_retry_after_reflects_refill_rate() {
        let limiter = limiter();
        // 60 rpm = 1 token/sec
        let spec = spec(60, false);
        for _ in 0..60 {
            limiter.allow("chat", "", &spec);
        }

        let decision = limiter.allow("chat", "", &spec);
        assert!(!decision.allowed);
        // The bucket just went empty; one token takes about a second.
        assert!(decision.retry_after <= Duration::from_secs(1) + Duration::from_millis(50));
        assert!(decision.retry_after >= Duration::from_millis(500));
    }

    #[test]
    fn test_remaining_decrements() {
        let limiter = limiter();
        let spec = spec(10, false);

        let first = limiter.allow("chat", "", &spec);
        assert_eq!(first.remaining, 9);
        let second = limiter.allow("chat", "", &spec);
        assert_eq!(second.remaining, 8);
    }

    #[test]
    fn test_per_user_isolation() {
        let limiter = limiter();
        let spec = spec(2, true);

        // Exhaust alice's budget
        assert!(limiter.allow("chat", "alice", &spec).allowed);
        assert!(limiter.allow("chat", "alice", &spec).allowed);
        assert!(!limiter.allow("chat", "alice", &spec).allowed);

        // Bob is unaffected
        assert!(limiter.allow("chat", "bob", &spec).allowed);
    }

    #[test]
    fn test_per_user_mode_skips_route_bucket() {
        let limiter = limiter();
        let per_user = spec(1, true);

        // Many distinct users on a per-user route each get their own token;
        // no route-wide cap applies in this mode.
        for i in 0..20 {
            let user = format!("user-{i}");
            assert!(limiter.allow("chat", &user, &per_user).allowed);
        }
        assert_eq!(limiter.stats().route_count, 0);
        assert_eq!(limiter.stats().user_count, 20);
    }

    #[test]
    fn test_per_user_without_user_id_uses_route_bucket() {
        let limiter = limiter();
        let per_user = spec(2, true);

        assert!(limiter.allow("chat", "", &per_user).allowed);
        assert!(limiter.allow("chat", "", &per_user).allowed);
        assert!(!limiter.allow("chat", "", &per_user).allowed);
        assert_eq!(limiter.stats().route_count, 1);
    }

    #[test]
    fn test_route_isolation() {
        let limiter = limiter();
        let spec = spec(1, false);

        assert!(limiter.allow("chat", "", &spec).allowed);
        assert!(!limiter.allow("chat", "", &spec).allowed);
        assert!(limiter.allow("embeddings", "", &spec).allowed);
    }

    #[test]
    fn test_zero_rpm_is_unlimited() {
        let limiter = limiter();
        let spec = spec(0, false);
        for _ in 0..100 {
            assert!(limiter.allow("chat", "", &spec).allowed);
        }
    }

    #[test]
    fn test_update_route_limit_in_place() {
        let limiter = limiter();
        let tight = spec(1, false);

        assert!(limiter.allow("chat", "", &tight).allowed);
        assert!(!limiter.allow("chat", "", &tight).allowed);

        // Raising the limit refreshes rate and burst, but tokens only grow
        // by refill, so the next check still reflects the empty bucket.
        let generous = spec(6000, false);
        limiter.update_route_limit("chat", Some(&generous));

        std::thread::sleep(Duration::from_millis(50));
        // 6000 rpm = 100 tokens/sec, so ~5 tokens refilled by now
        let decision = limiter.allow("chat", "", &generous);
        assert!(decision.allowed);
        assert_eq!(decision.limit, 6000);
    }

    #[test]
    fn test_update_route_limit_none_removes() {
        let limiter = limiter();
        limiter.allow("chat", "", &spec(10, false));
        assert_eq!(limiter.stats().route_count, 1);

        limiter.update_route_limit("chat", None);
        assert_eq!(limiter.stats().route_count, 0);
    }

    #[test]
    fn test_remove_route_purges_user_buckets() {
        let limiter = limiter();
        let per_user = spec(10, true);

        limiter.allow("chat", "alice", &per_user);
        limiter.allow("chat", "bob", &per_user);
        limiter.allow("other", "carol", &per_user);
        assert_eq!(limiter.stats().user_count, 3);

        limiter.remove_route("chat");
        let stats = limiter.stats();
        assert_eq!(stats.user_count, 1, "only other:carol survives");
    }

    #[test]
    fn test_remove_route_prefix_is_exact() {
        let limiter = limiter();
        let per_user = spec(10, true);

        limiter.allow("chat", "alice", &per_user);
        limiter.allow("chatbot", "bob", &per_user);

        limiter.remove_route("chat");
        // "chatbot:bob" must survive: "chat" is not its route
        assert_eq!(limiter.stats().user_count, 1);
    }

    #[test]
    fn test_evict_stale_respects_ttl() {
        let limiter = limiter_with_ttl(0);
        let per_user = spec(10, true);

        limiter.allow("chat", "alice", &per_user);
        std::thread::sleep(Duration::from_millis(10));

        let evicted = limiter.evict_stale();
        assert_eq!(evicted, 1);
        assert_eq!(limiter.stats().user_count, 0);
    }

    #[test]
    fn test_evict_keeps_fresh_buckets() {
        let limiter = limiter_with_ttl(3600);
        let per_user = spec(10, true);

        limiter.allow("chat", "alice", &per_user);
        assert_eq!(limiter.evict_stale(), 0);
        assert_eq!(limiter.stats().user_count, 1);
    }

    #[tokio::test]
    async fn test_eviction_loop_stops_on_shutdown() {
        let limiter = limiter_with_ttl(0);
        let shutdown = CancellationToken::new();

        let handle = {
            let shutdown = shutdown.clone();
            let limiter = std::sync::Arc::new(limiter);
            let limiter_bg = std::sync::Arc::clone(&limiter);
            tokio::spawn(async move { limiter_bg.run_eviction(shutdown).await })
        };

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("eviction loop should exit promptly")
            .unwrap();
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = limiter();
        // 600 rpm = 10 tokens/sec
        let spec = spec(600, false);
        for _ in 0..600 {
            limiter.allow("chat", "", &spec);
        }
        assert!(!limiter.allow("chat", "", &spec).allowed);

        std::thread::sleep(Duration::from_millis(250));
        // ~2.5 tokens refilled
        assert!(limiter.allow("chat", "", &spec).allowed);
    }
}
