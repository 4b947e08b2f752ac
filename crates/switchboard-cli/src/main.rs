//! Switchboard: an MCP gateway that aggregates upstream servers.

mod gateway;

use anyhow::{Context, Result};
use clap::Parser;
use gateway::Gateway;
use std::io;
use std::path::PathBuf;
use switchboard_config::{CliOverrides, GatewayConfig};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "switchboard",
    version,
    about = "An MCP gateway that re-serves the tools of upstream servers"
)]
struct Cli {
    /// Address to listen on (overrides SWITCHBOARD_LISTEN)
    #[arg(short, long)]
    listen: Option<String>,

    /// Externally reachable base URL, used for OAuth callbacks
    #[arg(long)]
    public_url: Option<String>,

    /// Config file to read instead of ~/.switchboard/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }

    let config = GatewayConfig::load(CliOverrides {
        listen: cli.listen,
        public_url: cli.public_url,
        config_path: cli.config,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    run(config).await
}

async fn run(config: GatewayConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    let addr = listener.local_addr().context("Failed to read listen address")?;

    let gateway = Gateway::new(config);
    let watchers = gateway.spawn_watchers();
    let ready = gateway.connect_upstreams().await;

    let config = gateway.config();
    info!(
        addr = %addr,
        public_url = %config.public_url,
        tools = gateway.router().tool_names().len(),
        "switchboard listening"
    );
    eprintln!(
        "switchboard v{} on {} ({ready} of {} upstream servers ready)",
        env!("CARGO_PKG_VERSION"),
        config.public_url,
        config.servers.len()
    );

    axum::serve(listener, gateway.app())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    for watcher in watchers {
        watcher.abort();
    }
    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
