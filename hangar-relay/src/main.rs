use std::sync::Arc;

use hangar_messaging::store::SqliteStore;
use hangar_messaging::MessagingConfig;
use hangar_relay::{handle_connection, RelayState};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "0.0.0.0:9001";
const DEFAULT_DB_PATH: &str = "hangar.db";

#[tokio::main]
async fn main() {
    // .env is optional; real environment variables win
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::var("HANGAR_RELAY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let db_path = std::env::var("HANGAR_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    let config = match MessagingConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid messaging configuration");
            std::process::exit(1);
        }
    };

    let store = match SqliteStore::open(&db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(path = %db_path, error = %e, "Failed to open database");
            std::process::exit(1);
        }
    };
    info!(path = %db_path, "Database ready");

    let token = std::env::var("HANGAR_ACCESS_TOKEN").ok();
    if token.as_deref().map_or(true, str::is_empty) {
        warn!("HANGAR_ACCESS_TOKEN not set, accepting any connect");
    }

    let state = Arc::new(RelayState::new(store.clone(), store, config).with_access_token(token));

    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Hangar relay listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New connection from {}", peer_addr);

                let state = state.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws_stream) => {
                            handle_connection(ws_stream, state).await;
                        }
                        Err(e) => {
                            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
