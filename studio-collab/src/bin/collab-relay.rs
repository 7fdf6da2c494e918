//! Standalone relay for studio collaboration sessions.
//!
//! Usage: `collab-relay [ADDR]` (falls back to `COLLAB_RELAY_ADDR`,
//! then `127.0.0.1:8080`).

use studio_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("COLLAB_RELAY_ADDR").ok())
        .unwrap_or_else(|| RelayConfig::default().bind_addr);

    let server = RelayServer::new(RelayConfig {
        bind_addr,
        ..RelayConfig::default()
    });
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
