//! Server lifecycle management
//!
//! Runs the HTTP server (WebSocket signaling, health, stats) until a shutdown
//! signal arrives or the media worker dies. A dead worker cannot be
//! recovered, so it ends the process with an error.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use confab_api::http::{create_router, AppState, WebSocketSettings};
use confab_api::signaling::SignalingRouter;
use confab_core::Config;

pub struct ConfabServer {
    config: Config,
    signaling: Arc<SignalingRouter>,
}

impl ConfabServer {
    pub fn new(config: Config, signaling: Arc<SignalingRouter>) -> Self {
        Self { config, signaling }
    }

    /// Start serving and wait for shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let state = AppState {
            signaling: Arc::clone(&self.signaling),
            websocket: WebSocketSettings::from(&self.config.signaling),
        };
        let router = create_router(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut http = tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown_rx.changed().await;
            };
            axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
        });

        let worker_failure = self.signaling.engine().worker_failure();
        let outcome = tokio::select! {
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                Ok(())
            }
            () = worker_failure.cancelled() => {
                error!("Media worker died, shutting down");
                Err(anyhow::anyhow!("media worker died"))
            }
            result = &mut http => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(anyhow::anyhow!("HTTP server error: {e}")),
                    Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {e}")),
                };
            }
        };

        let _ = shutdown_tx.send(true);
        match http.await {
            Ok(Ok(())) => info!("HTTP server shut down gracefully"),
            Ok(Err(e)) => error!("HTTP server error: {}", e),
            Err(e) => error!("HTTP server task failed: {}", e),
        }
        outcome
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
