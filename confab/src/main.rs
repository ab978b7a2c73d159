mod server;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use confab_api::registry::SessionRegistry;
use confab_api::signaling::{SignalingRouter, StaticPublishPolicy};
use confab_core::{bootstrap::load_config, logging};
use confab_sfu::{LocalBackend, LocalBackendConfig, MediaEngine, SfuConfig, UserId};

use server::ConfabServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Confab server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Start the media backend
    let backend = Arc::new(LocalBackend::new(LocalBackendConfig {
        rtc_min_port: config.media.rtc_min_port,
        rtc_max_port: config.media.rtc_max_port,
    }));

    // 4. Initialize the media engine
    let mut sfu_config = SfuConfig {
        max_rooms: config.media.max_rooms,
        max_transports_per_client: config.media.max_transports_per_client,
        ..SfuConfig::default()
    };
    sfu_config.listen.ip = config.media.listen_ip()?;
    sfu_config.listen.announced_ip = config.media.announced_ip()?;
    let engine = MediaEngine::new(backend, sfu_config);
    info!(
        listen_ip = %config.media.listen_ip,
        max_rooms = config.media.max_rooms,
        max_transports_per_client = config.media.max_transports_per_client,
        "Media engine initialized"
    );

    // 5. Initialize signaling
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&engine),
        config.signaling.max_clients_per_room,
    ));
    let policy = StaticPublishPolicy::new(
        config.signaling.open_publishing,
        config.signaling.publishers.iter().cloned().map(UserId::from),
    );
    let signaling = Arc::new(SignalingRouter::new(registry, engine, Arc::new(policy)));
    let media_events = signaling.spawn_media_event_pump();
    info!(
        max_clients_per_room = config.signaling.max_clients_per_room,
        open_publishing = config.signaling.open_publishing,
        "Signaling initialized"
    );

    // 6. Serve until shutdown or media worker failure
    let result = ConfabServer::new(config, signaling).run().await;
    media_events.abort();
    result
}
