//! mtools-svc: audio tools service
//!
//! Startup order: configuration, logging, storage directories, exit-cleanup
//! registry and panic hook, retention scheduler, HTTP server. On SIGINT or
//! SIGTERM the server drains, the scheduler stops, and every registered
//! temporary path is removed before exit.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mtools_common::TomlConfig;
use mtools_svc::services::{CleanupScheduler, ExitCleanupRegistry, MemoryGovernor};
use mtools_svc::{build_router, AppState};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mtools-svc")]
#[command(about = "Audio tools service: stem separation with resource governance")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "MTOOLS_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long, env = "MTOOLS_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_path) =
        TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    mtools_common::logging::init(&config.logging.level).context("Failed to initialise logging")?;

    match &config_path {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => warn!("No configuration file found, using built-in defaults"),
    }
    config.validate().context("Invalid configuration")?;

    info!("Starting mtools-svc v{}", env!("CARGO_PKG_VERSION"));
    for (label, dir) in config.storage.directories() {
        info!("{} directory: {}", label, dir.display());
    }

    let registry = ExitCleanupRegistry::new();
    registry.install_panic_hook();

    let governor = MemoryGovernor::system(config.memory.clone());
    let snapshot = governor.snapshot();
    info!(
        total_mb = snapshot.total_mb,
        available_mb = snapshot.available_mb,
        process_mb = snapshot.process_rss_mb,
        "Memory at startup"
    );

    let sweep_interval = config.retention.policy().sweep_interval;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;

    let state = AppState::new(config, governor, registry.clone())
        .context("Failed to initialise services")?;
    let scheduler = CleanupScheduler::start(state.retention.clone(), sweep_interval);

    let app = build_router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    scheduler.shutdown().await;
    let removed = registry.drain();
    info!(removed, "Exit cleanup complete");

    served?;
    info!("Server shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
