use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zlimit::config::{StoreBackend, StrategyKind, ZlimitConfig};
use zlimit::http::{HeaderKeyExtractor, HttpServer, RateLimitState};
use zlimit::ratelimit::{ScriptedSlidingWindow, SlidingWindowCounter, Strategy};
use zlimit::store::{MemoryStore, RedisStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("zlimit={}", args.log_level)))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting zlimit rate limiting service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ZlimitConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        strategy = ?config.limits.strategy,
        max_requests = config.limits.max_requests,
        window_ms = config.limits.window_ms,
        "Configuration loaded"
    );

    let strategy = build_strategy(&config).await?;
    info!("Rate limiter initialized");

    let extractor = HeaderKeyExtractor::new(config.key_headers.clone());
    info!(key_headers = ?extractor.headers(), "Caller keys built from request headers");

    let state = RateLimitState::new(
        Arc::new(extractor),
        strategy,
        config.limits.max_requests,
        config.limits.window(),
    )
    .with_failure_policy(config.failure_policy);

    HttpServer::new(config.server.http_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("zlimit rate limiting service stopped");
    Ok(())
}

async fn build_strategy(config: &ZlimitConfig) -> anyhow::Result<Arc<dyn Strategy>> {
    let timeout = config.store.operation_timeout();

    let strategy: Arc<dyn Strategy> = match (config.store.backend, config.limits.strategy) {
        (StoreBackend::Memory, _) => {
            info!("Using in-process store; limits are not shared between instances");
            Arc::new(
                SlidingWindowCounter::new(Arc::new(MemoryStore::new()))
                    .with_operation_timeout(timeout),
            )
        }
        (StoreBackend::Redis, kind) => {
            let store = RedisStore::connect(&config.store.redis_url, &config.store.key_prefix).await?;
            info!(prefix = %store.prefix(), "Connected to redis");
            match kind {
                StrategyKind::SlidingWindow => Arc::new(
                    SlidingWindowCounter::new(Arc::new(store)).with_operation_timeout(timeout),
                ),
                StrategyKind::Scripted => {
                    Arc::new(ScriptedSlidingWindow::new(store).with_operation_timeout(timeout))
                }
            }
        }
    };

    Ok(strategy)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
