//! hwbroker - Privileged daemon brokering hardware telemetry and control

use anyhow::{Context, Result};
use clap::Parser;
use hwbroker::config::Config;
use hwbroker::platform::MemoryIo;
use hwbroker::process::ProcFs;
use hwbroker::secure::SecureFs;
use hwbroker::server::{BrokerServer, BrokerState};
use hwbroker::{BrokerContext, BrokerPaths};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "hwbroker")]
#[command(about = "Broker mediating client access to hardware signals and controls")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path override
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Runtime directory override
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(runtime_dir) = cli.runtime_dir {
        config.general.runtime_dir = Some(runtime_dir);
    }
    if let Some(socket) = cli.socket {
        config.general.socket_path = Some(socket);
    }

    let paths = BrokerPaths::new(config.state_dir(), config.access_dir());
    tracing::info!(
        "Starting hwbroker (state {:?}, access lists {:?})",
        paths.state_dir,
        paths.access_dir
    );

    let context = BrokerContext::new(
        Arc::new(MemoryIo::new(&config.platform)),
        Arc::new(SecureFs::new()),
        Arc::new(ProcFs::new()),
        paths,
    );
    let state = BrokerState::new(&context).context("restoring broker state")?;

    let server = BrokerServer::new(
        config.socket_path(),
        Duration::from_millis(config.general.liveness_interval_ms.max(1)),
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received"),
        }
        let _ = shutdown_tx.send(()).await;
    });

    server.run(state, shutdown_rx).await
}
