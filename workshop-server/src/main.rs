//! Workshop sync server.
//!
//! Configuration comes from the environment (a `.env` file is read first):
//!
//! - `WORKSHOP_BIND_ADDR`: listen address (default `127.0.0.1:9090`)
//! - `WORKSHOP_STORAGE_PATH`: RocksDB directory; unset keeps documents in memory
//! - `WORKSHOP_BROADCAST_CAPACITY`: snapshots buffered per peer
//! - `WORKSHOP_DOCUMENT_PREFIX`: path prefix joins must use (default `workshops/`)
//! - `WORKSHOP_MAX_ROOMS`: documents held in memory at once
//! - `RUST_LOG`: log filter

use log::{info, warn};
use workshop_sync::{ServerConfig, SyncServer};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("WORKSHOP_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("WORKSHOP_STORAGE_PATH") {
        config.storage_path = Some(path.into());
    }
    if let Ok(raw) = std::env::var("WORKSHOP_BROADCAST_CAPACITY") {
        match raw.parse::<usize>() {
            Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
            _ => warn!(
                "Ignoring WORKSHOP_BROADCAST_CAPACITY={raw}; using {}",
                config.broadcast_capacity
            ),
        }
    }
    if let Ok(prefix) = std::env::var("WORKSHOP_DOCUMENT_PREFIX") {
        config.document_prefix = prefix;
    }
    if let Ok(raw) = std::env::var("WORKSHOP_MAX_ROOMS") {
        match raw.parse::<usize>() {
            Ok(rooms) if rooms > 0 => config.max_rooms = rooms,
            _ => warn!("Ignoring WORKSHOP_MAX_ROOMS={raw}; using {}", config.max_rooms),
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = config_from_env();
    match &config.storage_path {
        Some(path) => info!("Starting workshop server with storage at {}", path.display()),
        None => info!("Starting workshop server without persistence"),
    }

    let server = SyncServer::new(config)?;
    server.run().await
}
