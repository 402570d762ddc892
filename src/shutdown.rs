use actix_web::dev::ServerHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::db::JobStore;

/// Handles graceful shutdown of a component
///
/// This module orchestrates graceful shutdown by:
/// 1. Listening for shutdown signals (SIGTERM, SIGINT/CTRL+C)
/// 2. Stopping the HTTP server (stops accepting new requests)
/// 3. Signaling background tasks to stop acquiring new jobs
/// 4. Waiting for them to complete current jobs
/// 5. Closing the job store
///
/// Proxy hops only have the server; the execution service has all of it.
pub struct ShutdownCoordinator {
    server_handle: ServerHandle,
    server_task: JoinHandle<Result<(), std::io::Error>>,
    background: Option<Background>,
}

struct Background {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    store: JobStore,
}

impl ShutdownCoordinator {
    pub fn new(
        server_handle: ServerHandle,
        server_task: JoinHandle<Result<(), std::io::Error>>,
    ) -> Self {
        Self {
            server_handle,
            server_task,
            background: None,
        }
    }

    /// Also stop workers and the retention sweeper, then close `store`
    pub fn with_background(
        mut self,
        handles: Vec<JoinHandle<()>>,
        shutdown_tx: watch::Sender<bool>,
        store: JobStore,
    ) -> Self {
        self.background = Some(Background {
            handles,
            shutdown_tx,
            store,
        });
        self
    }

    /// Wait for shutdown signal and perform graceful shutdown
    ///
    /// Returns early with the server's own result if it stops by itself.
    pub async fn wait_for_shutdown(mut self) -> Result<(), std::io::Error> {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for CTRL+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM signal handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received CTRL+C signal, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown...");
            }
            result = &mut self.server_task => {
                error!("HTTP server stopped unexpectedly");
                self.stop_background().await;
                return result.map_err(std::io::Error::other)?;
            }
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> Result<(), std::io::Error> {
        info!("Stopping HTTP server (no longer accepting new requests)...");
        self.server_handle.stop(true).await;
        info!("HTTP server stopped accepting new requests");

        self.stop_background().await;

        info!("Waiting for HTTP server to fully shut down...");
        match self.server_task.await {
            Ok(Ok(_)) => info!("HTTP server shut down successfully"),
            Ok(Err(e)) => error!("HTTP server encountered error during shutdown: {:?}", e),
            Err(e) => error!("HTTP server task panicked: {:?}", e),
        }

        info!("Graceful shutdown completed successfully");
        Ok(())
    }

    async fn stop_background(&mut self) {
        let Some(background) = self.background.take() else {
            return;
        };

        info!("Signaling workers to stop acquiring new jobs...");
        if let Err(e) = background.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal to workers: {:?}", e);
        }

        let total = background.handles.len();
        info!("Waiting for {} background tasks to complete current jobs...", total);
        let mut completed = 0;
        for (i, handle) in background.handles.into_iter().enumerate() {
            match handle.await {
                Ok(_) => {
                    completed += 1;
                    info!("Task {} stopped ({}/{})", i + 1, completed, total);
                }
                Err(e) => error!("Task {} failed to stop: {:?}", i + 1, e),
            }
        }
        info!("All background tasks stopped");

        info!("Closing {} job store...", background.store.backend());
        background.store.close().await;
        info!("Job store closed");
    }
}
