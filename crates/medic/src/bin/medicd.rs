//! medicd: the repair-engine daemon.
//!
//! Loads configuration, wires the orchestrator, serves the admission
//! API, and drains cleanly on SIGTERM/ctrl-c.

use anyhow::{Context as _, Result};
use clap::Parser;
use medic::orchestrator::Orchestrator;
use medic::server::build_router;
use medic_config::RepairConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "medicd", about = "Autonomous CI-failure repair engine", version)]
struct Args {
    /// Path to the TOML config file. Falls back to environment-only
    /// configuration when omitted.
    #[arg(long, env = "MEDIC_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the admission API.
    #[arg(long, env = "MEDIC_BIND", default_value = "0.0.0.0:8087")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RepairConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RepairConfig::from_env().context("loading config from environment")?,
    };

    tracing::info!(
        backend = config.execution_backend.as_str(),
        max_concurrent = config.max_concurrent_agents,
        "starting medicd"
    );

    let orchestrator = Orchestrator::connect(config)
        .await
        .context("wiring orchestrator")?;

    // Hourly upkeep: adaptive thresholds and telemetry TTL pruning.
    let maintenance = orchestrator.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            maintenance.run_maintenance(30).await;
        }
    });

    let router = build_router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    tracing::info!(addr = %args.bind, "admission API listening");

    let shutdown_orchestrator = orchestrator.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received; draining sessions");
            shutdown_orchestrator.shutdown().await;
        })
        .await
        .context("serving admission API")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
