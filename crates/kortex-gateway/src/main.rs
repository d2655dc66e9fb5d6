//! Kortex inference gateway server.
//!
//! One OpenAI-compatible endpoint in front of heterogeneous LLM backends:
//! weighted routing, A/B experiments, rate limiting, circuit-broken
//! fallback chains, and per-route cost accounting, driven by declarative
//! Route and Backend resources reconciled into a shared in-memory view.

use clap::{Parser, Subcommand};
use kortex_core::{GatewayConfig, MemorySecretStore, ResourceRegistry};
use kortex_gateway::backend::BackendHandler;
use kortex_gateway::cache::ConfigCache;
use kortex_gateway::circuit_breaker::CircuitBreakerManager;
use kortex_gateway::config;
use kortex_gateway::costs::CostTracker;
use kortex_gateway::experiments::ExperimentManager;
use kortex_gateway::health::Prober;
use kortex_gateway::metrics::Metrics;
use kortex_gateway::ratelimit::RateLimiter;
use kortex_gateway::reconciler::{
    run_reconcile_loop, BackendReconciler, Reconcile, RouteReconciler,
};
use kortex_gateway::retry::Retrier;
use kortex_gateway::router::Router;
use kortex_gateway::server::{build_router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Kortex: cloud-native inference gateway for LLM traffic.
#[derive(Parser)]
#[command(name = "kortex-gateway", version, about, long_about = None)]
struct Cli {
    /// Path to YAML configuration file.
    #[arg(short, long, global = true, env = "KORTEX_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a YAML file declaring initial Backends, Routes, and
    /// secrets.
    #[arg(short, long, global = true, env = "KORTEX_RESOURCES")]
    resources: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "KORTEX_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override log output format (text, json).
    #[arg(long, global = true, env = "KORTEX_LOG_FORMAT")]
    log_format: Option<String>,

    /// Subcommand to run. If omitted, starts the gateway.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print resolved settings.
    Validate,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_and_merge_config(&cli)?;

    match cli.command {
        Some(Commands::Validate) => run_validate(&config),
        None => {
            init_logging(&config)?;
            config::validate_config(&config)?;
            let resources = match &cli.resources {
                Some(path) => config::load_resources(path)?,
                None => config::ResourcesFile::default(),
            };
            run_gateway(config, resources).await
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration loading
// ---------------------------------------------------------------------------

/// Load configuration from file/defaults, then apply env and CLI
/// overrides. Precedence (highest wins): CLI flags, environment,
/// config file, built-in defaults.
fn load_and_merge_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            // Logging isn't initialised yet; use eprintln for early
            // diagnostics.
            eprintln!("loading configuration from {}", path.display());
            config::load_config(path)?
        }
        None => {
            eprintln!("no config file specified, using defaults");
            GatewayConfig::default()
        }
    };

    config::apply_env_overrides(&mut config);

    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = &cli.log_format {
        config.logging.format.clone_from(format);
    }

    Ok(config)
}

fn run_validate(config: &GatewayConfig) -> anyhow::Result<()> {
    config::validate_config(config)?;
    println!("configuration is valid\n");
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Structured logging
// ---------------------------------------------------------------------------

/// Initialize structured logging. `RUST_LOG` takes precedence over the
/// configured level for filter directives.
fn init_logging(config: &GatewayConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Gateway wiring
// ---------------------------------------------------------------------------

async fn run_gateway(
    config: GatewayConfig,
    resources: config::ResourcesFile,
) -> anyhow::Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        max_request_body_size = config.max_request_body_size,
        backends = resources.backends.len(),
        routes = resources.routes.len(),
        "starting kortex gateway"
    );

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(ResourceRegistry::new());
    let cache = Arc::new(ConfigCache::new());

    let secrets = Arc::new(MemorySecretStore::new());
    for secret in &resources.secrets {
        secrets.insert(
            secret.namespace.clone(),
            secret.name.clone(),
            secret.key.clone(),
            secret.value.clone(),
        );
    }
    let prober = Arc::new(Prober::new());
    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limiter));
    let cost_tracker = Arc::new(CostTracker::new(Some(Arc::clone(&metrics))));
    let breakers = Arc::new(CircuitBreakerManager::new(
        config.circuit_breaker.clone(),
        Some(Arc::clone(&metrics)),
    ));

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_millis(config.connect_timeout_ms))
        .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
        .build()?;

    let handler = Arc::new(BackendHandler::new(
        Arc::clone(&cache),
        client,
        secrets,
        breakers,
        Retrier::new(config.retry.clone(), Some(Arc::clone(&metrics))),
        Arc::clone(&cost_tracker),
        Some(Arc::clone(&metrics)),
    ));
    let router = Router::new(
        Arc::clone(&cache),
        handler,
        ExperimentManager::new(Some(Arc::clone(&metrics))),
    );

    // Seed declared state; the reconcile loops pick it up on their
    // initial resync.
    for backend in resources.backends {
        registry.apply_backend(backend);
    }
    for route in resources.routes {
        registry.apply_route(route);
    }

    // Control plane: reconcile loops plus the rate-limiter eviction sweep
    let backend_reconciler = Arc::new(BackendReconciler::new(
        Arc::clone(&registry),
        prober,
        Arc::clone(&cache),
        Some(Arc::clone(&metrics)),
    ));
    let route_reconciler = Arc::new(RouteReconciler::new(
        Arc::clone(&registry),
        Arc::clone(&cache),
        Arc::clone(&rate_limiter),
    ));

    let backend_reconciler: Arc<dyn Reconcile> = backend_reconciler;
    let route_reconciler: Arc<dyn Reconcile> = route_reconciler;
    tokio::spawn(run_reconcile_loop(
        backend_reconciler,
        Arc::clone(&registry),
        shutdown.clone(),
    ));
    tokio::spawn(run_reconcile_loop(
        route_reconciler,
        Arc::clone(&registry),
        shutdown.clone(),
    ));
    {
        let rate_limiter = Arc::clone(&rate_limiter);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { rate_limiter.run_eviction(shutdown).await });
    }

    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(AppState {
        config,
        cache,
        router,
        rate_limiter,
        cost_tracker,
        metrics: Some(metrics),
        shutdown: shutdown.clone(),
    });

    let app = build_router(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(%listen_addr, "gateway listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutdown signal received, draining");
            server_shutdown.cancel();
        })
        .await?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
