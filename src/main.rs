//! withme.travel API gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!   browser ──▶ ┌──────────────────────── GATEWAY ────────────────────────┐
//!               │ request id → identity → route → rate limit → registry  │ ──▶ managed database
//!   browser ◀── │ X-RateLimit-* headers ◀── error mapping ◀── response    │ ◀── third-party APIs
//!               └─────────────────────────────────────────────────────────┘
//!                 background: rate limit sweeper, registry sweeper, config watcher
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use withme_gateway::config::{load_config, watcher::ConfigWatcher, GatewayConfig};
use withme_gateway::lifecycle::{wait_for_shutdown_signal, Shutdown};
use withme_gateway::observability::{logging, metrics};
use withme_gateway::HttpServer;

#[derive(Parser)]
#[command(name = "withme-gateway")]
#[command(about = "Rate-limiting API gateway for withme.travel", long_about = None)]
struct Args {
    /// Path to a TOML configuration file. Defaults are used when omitted.
    #[arg(short, long, env = "WITHME_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Reload the configuration file when it changes.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "withme-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        upstreams = config.upstreams.len(),
        rate_limit_enabled = config.rate_limit.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // Keep the watcher alive for the life of the process.
    let (_watcher, config_updates) = match (&args.config, args.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.run()?), updates)
        }
        _ => (None, mpsc::unbounded_channel().1),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let server = HttpServer::new(config)?;

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.trigger();
    });

    server.run(listener, config_updates, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
