//! agentgate, an LLM request gateway for agent simulations.
//!
//! Sits between many concurrent clients and a local text-generation host:
//! admits requests by API key, rate-limits per key, deduplicates identical
//! generations through fingerprint caching with single-flight coalescing,
//! assembles persona prompts from agent profiles, and dispatches to the
//! backend with retries under a deadline.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

mod api_types;
mod auth;
mod backend;
mod cache;
mod config;
mod error;
mod fingerprint;
mod middleware;
mod observability;
mod pipeline;
mod prompt;
mod ratelimit;
mod router;
mod routes;

#[cfg(test)]
mod tests;

use crate::{
    auth::Admission,
    backend::{BackendClient, OllamaClient},
    cache::ResponseCache,
    config::GatewayConfig,
    fingerprint::Fingerprinter,
    observability::{metrics, tracing_init::init_tracing},
    pipeline::{RequestPipeline, batch::BatchCoordinator},
    prompt::PromptAssembler,
    ratelimit::RateLimiter,
    router::ModelRouter,
    routes::AppState,
};

// Exit codes, BSD sysexits where one fits.
const EXIT_CONFIG: i32 = 64;
const EXIT_BACKEND_UNREACHABLE: i32 = 69;
const EXIT_CACHE_UNREACHABLE: i32 = 74;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "agentgate", version, about = "LLM request gateway for agent simulations")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "agentgate.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match GatewayConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if cli.check_config {
        println!("configuration OK");
        return;
    }

    init_tracing(&config.observability);

    if let Err(e) = metrics::init_metrics() {
        tracing::error!(error = %e, "Failed to initialize metrics");
        std::process::exit(EXIT_CONFIG);
    }

    run(config).await;
}

async fn run(config: GatewayConfig) {
    let backend: Arc<dyn BackendClient> = match OllamaClient::new(&config.backend) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "Failed to construct backend client");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if config.strict_startup && !backend.health().await {
        tracing::error!(
            backend_url = %config.backend.url,
            "Backend unreachable at startup (strict_startup is set)"
        );
        std::process::exit(EXIT_BACKEND_UNREACHABLE);
    }

    let store = match cache::build_store(&config.cache.backend).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to construct cache store");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if config.strict_startup && let Err(e) = store.ping().await {
        tracing::error!(error = %e, "Cache unreachable at startup (strict_startup is set)");
        std::process::exit(EXIT_CACHE_UNREACHABLE);
    }

    let fingerprinter = Fingerprinter::new(config.cache.schema_version);
    let response_cache = Arc::new(ResponseCache::new(
        Arc::clone(&store),
        fingerprinter.clone(),
        config.cache.default_ttl(),
        config.cache.negative_ttl(),
    ));

    let router = Arc::new(ModelRouter::new(Arc::clone(&backend), &config.router));
    // Populate the snapshot before accepting traffic; a failed first
    // refresh leaves readiness reporting not-ready until the loop recovers.
    router.refresh().await;

    let admission = Arc::new(Admission::new(&config.auth));
    let limiter = Arc::new(RateLimiter::new(&config.limits, &config.auth.api_keys));

    let pipeline = Arc::new(RequestPipeline::new(
        fingerprinter,
        response_cache,
        Arc::clone(&backend),
        Arc::clone(&router),
        PromptAssembler::new(config.limits.max_assembled_prompt_chars),
        config.limits.clone(),
    ));
    let batch = Arc::new(BatchCoordinator::new(Arc::clone(&pipeline), &config.batch));

    // Background tasks: model refresh and bucket sweeping, cancelled
    // together at shutdown.
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(Arc::clone(&router).run_refresh_loop(
        Duration::from_secs(config.router.refresh_interval_secs),
        cancel.clone(),
    ));
    tracker.spawn(run_bucket_sweeper(Arc::clone(&limiter), cancel.clone()));

    let state = AppState {
        admission,
        limiter,
        pipeline,
        batch,
        router,
        backend,
    };

    // A dedicated metrics listener keeps the scrape surface off the main
    // port when configured.
    let serve_metrics_inline = config.observability.metrics_bind_address.is_none();
    if let Some(metrics_addr) = config.observability.metrics_bind_address {
        let listener = match tokio::net::TcpListener::bind(metrics_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(address = %metrics_addr, error = %e, "Failed to bind metrics listener");
                std::process::exit(EXIT_CONFIG);
            }
        };
        tracing::info!(address = %metrics_addr, "Metrics listening");
        let metrics_cancel = cancel.clone();
        tracker.spawn(async move {
            let serve = axum::serve(listener, routes::metrics_router())
                .with_graceful_shutdown(async move { metrics_cancel.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let app = routes::build_router(state, config.server.body_limit_bytes, serve_metrics_inline);

    let bind_address = std::net::SocketAddr::new(config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_address, error = %e, "Failed to bind server listener");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!(
        address = %bind_address,
        backend_url = %config.backend.url,
        "agentgate listening"
    );

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "Server error");
    }

    // Drain background tasks, then leave with a clean exit.
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    tracing::info!("Shutdown complete");
}

/// Periodically drop idle rate-limit buckets.
async fn run_bucket_sweeper(limiter: Arc<RateLimiter>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.sweep(),
            _ = cancel.cancelled() => return,
        }
    }
}

/// Resolves on SIGINT or SIGTERM to start a graceful drain. A second signal
/// while draining aborts the process with exit code 130.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining; send again to abort");

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Second interrupt, aborting immediately");
            std::process::exit(EXIT_INTERRUPTED);
        }
    });
}
