//! Per-connection message loop
//!
//! Transport layers (WebSocket today) only provide the IO through
//! [`StreamMessage`]; the loop itself, ordering and cleanup live here.

use confab_sfu::ClientId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::router::SignalingRouter;

/// Inbound side of one client connection
#[async_trait::async_trait]
pub trait StreamMessage: Send {
    /// Next text frame from the client
    ///
    /// Returns None when the connection is closed
    async fn recv(&mut self) -> Option<Result<String, String>>;

    /// Whether the outbound side can still deliver messages
    fn is_alive(&self) -> bool;
}

/// Drives one connection: strictly sequential request handling, then cleanup
pub struct ConnectionHandler {
    router: Arc<SignalingRouter>,
    client_id: ClientId,
    keepalive: Duration,
}

impl ConnectionHandler {
    #[must_use]
    pub fn new(router: Arc<SignalingRouter>, client_id: ClientId, keepalive: Duration) -> Self {
        Self {
            router,
            client_id,
            keepalive,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Run until the client goes away, then release everything it held
    pub async fn run<S: StreamMessage>(&self, stream: &mut S) {
        let mut keepalive = interval_at(Instant::now() + self.keepalive, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = stream.recv() => {
                    match incoming {
                        Some(Ok(text)) => {
                            self.router.handle_text(&self.client_id, &text).await;
                        }
                        Some(Err(e)) => {
                            warn!(client_id = %self.client_id, error = %e, "Error receiving message");
                            break;
                        }
                        None => {
                            info!(client_id = %self.client_id, "Client disconnected gracefully");
                            break;
                        }
                    }
                }

                _ = keepalive.tick() => {
                    if !stream.is_alive() {
                        info!(client_id = %self.client_id, "Connection no longer alive");
                        break;
                    }
                }
            }
        }

        self.router.disconnect(&self.client_id).await;
    }
}
