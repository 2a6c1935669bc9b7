//! Unix socket listener and server main loop

use super::connection::handle_client;
use super::state::BrokerState;
use anyhow::{anyhow, Result};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};

/// Unix socket server listener
pub struct BrokerServer {
    socket_path: PathBuf,
    liveness_interval: Duration,
}

impl BrokerServer {
    pub fn new(socket_path: PathBuf, liveness_interval: Duration) -> Self {
        Self {
            socket_path,
            liveness_interval,
        }
    }

    /// Serve clients until a shutdown signal arrives
    pub async fn run(&self, state: BrokerState, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => {
                    return Err(anyhow!(
                        "Broker already listening on {}",
                        self.socket_path.display()
                    ));
                }
                Err(_) => {
                    tracing::info!("Removing stale socket: {:?}", self.socket_path);
                    std::fs::remove_file(&self.socket_path)?;
                }
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        // Any local user may connect; authorization happens per request
        std::fs::set_permissions(&self.socket_path, Permissions::from_mode(0o666))?;
        tracing::info!("Broker listening on {:?}", self.socket_path);

        let state = Arc::new(Mutex::new(state));
        let mut liveness = tokio::time::interval(self.liveness_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                _ = liveness.tick() => {
                    let closed = state.lock().await.platform.check_clients();
                    if !closed.is_empty() {
                        tracing::info!("Reclaimed sessions of exited clients {:?}", closed);
                    }
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state).await {
                                    tracing::error!("Client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// Remove the socket file; sessions stay on disk for the next run
    fn cleanup(&self) {
        tracing::info!("Cleaning up broker resources");
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::error!("Failed to remove socket file: {}", e);
            }
        }
    }
}
