//! Reconcile loops for Backend and Route resources.
//!
//! Each reconciler runs its own single-consumer loop: registry events map
//! to reconcile keys, and every reconcile may schedule a requeue through a
//! deadline heap (the periodic resync that catches anything a watch
//! missed). Processing is serialized inside a loop, so at most one
//! reconcile per key is ever in flight. Losing events to broadcast lag
//! triggers a full resync.

mod backend;
mod route;

pub use backend::BackendReconciler;
pub use route::RouteReconciler;

use async_trait::async_trait;
use kortex_core::{NamespacedName, ResourceEvent, ResourceRegistry};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A reconciler driven by [`run_reconcile_loop`].
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Loop name for logs.
    fn name(&self) -> &'static str;

    /// Map a registry event to the keys this reconciler must process.
    fn keys_for_event(&self, event: &ResourceEvent) -> Vec<NamespacedName>;

    /// Keys to reconcile at startup and on resync.
    fn initial_keys(&self) -> Vec<NamespacedName>;

    /// Reconcile one key, returning an optional requeue delay.
    async fn reconcile(&self, key: &NamespacedName) -> Option<Duration>;
}

/// Drive a reconciler until shutdown: consume registry events, honor
/// requeue deadlines, resync on startup and on event-stream lag.
pub async fn run_reconcile_loop(
    reconciler: Arc<dyn Reconcile>,
    registry: Arc<ResourceRegistry>,
    shutdown: CancellationToken,
) {
    let mut events = registry.subscribe();
    let mut deadlines: BinaryHeap<Reverse<(Instant, NamespacedName)>> = BinaryHeap::new();

    info!(reconciler = reconciler.name(), "reconcile loop starting");

    // Initial resync
    for key in reconciler.initial_keys() {
        if let Some(delay) = reconciler.reconcile(&key).await {
            deadlines.push(Reverse((Instant::now() + delay, key)));
        }
    }

    loop {
        let next_deadline = deadlines.peek().map(|Reverse((at, _))| *at);

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(reconciler = reconciler.name(), "reconcile loop stopping");
                return;
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        for key in reconciler.keys_for_event(&event) {
                            if let Some(delay) = reconciler.reconcile(&key).await {
                                deadlines.push(Reverse((Instant::now() + delay, key)));
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            reconciler = reconciler.name(),
                            missed,
                            "event stream lagged, resyncing all keys"
                        );
                        for key in reconciler.initial_keys() {
                            if let Some(delay) = reconciler.reconcile(&key).await {
                                deadlines.push(Reverse((Instant::now() + delay, key)));
                            }
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!(reconciler = reconciler.name(), "event stream closed");
                        return;
                    }
                }
            }

            _ = sleep_until_or_forever(next_deadline) => {
                if let Some(Reverse((_, key))) = deadlines.pop() {
                    if let Some(delay) = reconciler.reconcile(&key).await {
                        deadlines.push(Reverse((Instant::now() + delay, key)));
                    }
                }
            }
        }
    }
}

/// Sleep until the deadline, or forever when none is pending (so the
/// select arm never fires spuriously).
async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kortex_core::ResourceKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Reconciler that records every key it sees.
    struct Recorder {
        seen: Mutex<Vec<NamespacedName>>,
        reconciles: AtomicUsize,
        requeue: Option<Duration>,
    }

    #[async_trait]
    impl Reconcile for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn keys_for_event(&self, event: &ResourceEvent) -> Vec<NamespacedName> {
            if event.kind == ResourceKind::Backend && !event.status_only {
                vec![event.key.clone()]
            } else {
                Vec::new()
            }
        }

        fn initial_keys(&self) -> Vec<NamespacedName> {
            Vec::new()
        }

        async fn reconcile(&self, key: &NamespacedName) -> Option<Duration> {
            self.seen.lock().unwrap().push(key.clone());
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            self.requeue
        }
    }

    fn test_backend(name: &str) -> kortex_core::Backend {
        kortex_core::Backend {
            namespace: "default".to_string(),
            name: name.to_string(),
            spec: kortex_core::BackendSpec {
                variant: kortex_core::BackendVariant::External(kortex_core::ExternalBackend {
                    url: "http://example".to_string(),
                    provider: "openai".to_string(),
                    api_key_secret: None,
                    model: None,
                }),
                health_check: None,
                cost: None,
                timeout_seconds: 60,
                priority: 0,
            },
            status: kortex_core::BackendStatus::default(),
        }
    }

    #[tokio::test]
    async fn test_loop_processes_events() {
        let registry = Arc::new(ResourceRegistry::new());
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            reconciles: AtomicUsize::new(0),
            requeue: None,
        });
        let shutdown = CancellationToken::new();

        let reconciler: Arc<dyn Reconcile> = Arc::clone(&recorder) as Arc<dyn Reconcile>;
        let loop_handle = tokio::spawn(run_reconcile_loop(
            reconciler,
            Arc::clone(&registry),
            shutdown.clone(),
        ));

        // Give the loop time to subscribe before emitting
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.apply_backend(test_backend("a"));
        registry.apply_backend(test_backend("b"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        loop_handle.await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].name, "a");
        assert_eq!(seen[1].name, "b");
    }

    #[tokio::test]
    async fn test_loop_requeues() {
        let registry = Arc::new(ResourceRegistry::new());
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            reconciles: AtomicUsize::new(0),
            requeue: Some(Duration::from_millis(10)),
        });
        let shutdown = CancellationToken::new();

        let reconciler: Arc<dyn Reconcile> = Arc::clone(&recorder) as Arc<dyn Reconcile>;
        let loop_handle = tokio::spawn(run_reconcile_loop(
            reconciler,
            Arc::clone(&registry),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.apply_backend(test_backend("a"));
        // One event reconcile plus several requeued ones
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.cancel();
        loop_handle.await.unwrap();

        assert!(recorder.reconciles.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_loop_ignores_status_only_events() {
        let registry = Arc::new(ResourceRegistry::new());
        registry.apply_backend(test_backend("a"));

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            reconciles: AtomicUsize::new(0),
            requeue: None,
        });
        let shutdown = CancellationToken::new();

        let reconciler: Arc<dyn Reconcile> = Arc::clone(&recorder) as Arc<dyn Reconcile>;
        let loop_handle = tokio::spawn(run_reconcile_loop(
            reconciler,
            Arc::clone(&registry),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.update_backend_status(
            &NamespacedName::new("default", "a"),
            kortex_core::BackendStatus::default(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        loop_handle.await.unwrap();

        assert_eq!(recorder.reconciles.load(Ordering::SeqCst), 0);
    }
}
