//! warden - adaptive lifecycle manager for local LLM model servers
//!
//! This binary detects the host's hardware, launches a matching model
//! server, keeps it health-checked, and exposes a small management and
//! inference API over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warden::config::Config;
use warden::{AppState, build_metrics_layer_and_handle, build_metrics_router, build_router};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Adaptive lifecycle manager for local LLM model servers")]
struct Args {
    /// Path to configuration file (all settings have defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("warden=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting warden");

    let mut config = match args.config {
        Some(path) => Config::from_file(&path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        port = config.port,
        serve_command = %config.server.serve_command,
        server_port = config.server.bind_port,
        "Configuration loaded"
    );

    let port = config.port;
    let metrics_port = config.metrics_port;

    let state = AppState::new(config);
    let (prometheus_layer, handle) = build_metrics_layer_and_handle("warden");
    let app = build_router(state).layer(prometheus_layer);

    if metrics_port != 0 {
        let metrics_router = build_metrics_router(handle);
        let metrics_addr = format!("0.0.0.0:{}", metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics listener to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Metrics listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
