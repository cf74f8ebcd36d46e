//! Broadcast Chat Server - Entry Point
//!
//! Parses the command line, loads config, binds the listener and serves
//! until SIGINT/SIGTERM.

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use broadcast_chat::{serve, shutdown_signal, ServerConfig};

/// Multi-client TCP broadcast chat server
#[derive(Debug, Parser)]
#[command(name = "broadcast_chat", version, about)]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface to bind (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=broadcast_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("broadcast_chat=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;

    // Start TCP listener
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("{} listening on {}", config.server_name, addr);
    info!("Try connecting with: nc localhost {}", config.port);
    info!("Press Ctrl+C to stop the server");

    let report = serve(listener, config, shutdown_signal()).await;
    info!(
        "Stopped: {} clients notified, clean: {}",
        report.notified, report.completed
    );

    Ok(())
}
