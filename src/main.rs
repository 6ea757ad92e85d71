//! crashpoint service entry point
//!
//! Wires the store, price oracle, ledger, round engine, and broadcast hub
//! together behind one HTTP + WebSocket listener.

use clap::Parser;
use crashpoint::api::{ApiServer, AppState, BroadcastHub};
use crashpoint::config::ConfigLoader;
use crashpoint::engine::RoundEngine;
use crashpoint::errors::CrashResult;
use crashpoint::ledger::Ledger;
use crashpoint::oracle::PriceOracle;
use crashpoint::storage::Store;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "crashpoint", about = "Crash wagering game server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override the storage directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> CrashResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crashpoint=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }

    info!("Starting crashpoint");
    info!("  Data dir: {}", config.storage.data_dir);
    info!("  Round period: {}ms", config.game.round_period_ms);
    info!("  Max crash: {:.2}x", config.game.max_crash);

    let store = Store::open(&config.storage.data_dir)?;
    let oracle = Arc::new(PriceOracle::from_config(&config.oracle)?);
    let ledger = Arc::new(Ledger::open(store, oracle.clone())?);

    // Repair any cash-outs that were marked but never credited before the
    // last shutdown.
    let repaired = ledger.reconcile_cashouts().await?;
    if repaired > 0 {
        info!("Reconciled {} uncredited cash-outs", repaired);
    }

    let engine = Arc::new(RoundEngine::new(
        config.game.clone(),
        &config.hub,
        ledger.clone(),
        oracle.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_handle = engine.spawn(shutdown_rx.clone());

    let hub = Arc::new(BroadcastHub::new(
        engine.clone(),
        ledger.clone(),
        config.hub.clone(),
        shutdown_rx.clone(),
    ));

    let state = Arc::new(AppState {
        engine,
        ledger,
        oracle,
        hub,
        max_crash: config.game.max_crash,
    });

    let server = ApiServer::new(config.api.clone(), state);
    let server_handle = tokio::spawn(server.run(shutdown_rx));

    shutdown_signal().await;
    info!("Shutdown signal received, finishing current round");
    let _ = shutdown_tx.send(true);

    if let Err(e) = engine_handle.await {
        error!("Engine task failed: {}", e);
    }
    match server_handle.await {
        Ok(result) => result?,
        Err(e) => error!("Server task failed: {}", e),
    }

    info!("crashpoint shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
