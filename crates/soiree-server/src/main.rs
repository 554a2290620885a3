//! # soiree-server
//!
//! Real-time chat server for the Soirée event platform.
//!
//! This binary provides:
//! - **WebSocket sessions** authenticated with the platform's JWTs, with
//!   conversation and group rooms for typing indicators
//! - **Presence** tracking with heartbeat idle timeouts
//! - **Direct chat** between platform admins, gated by invitations
//! - **Group chat** with invitations, read receipts and system messages
//! - **Push notifications** to users' registered devices
//! - **REST API** (axum) over the same services

mod accounts;
mod api;
mod auth;
mod config;
mod direct_chat;
mod error;
mod fanout;
mod group_chat;
mod hub;
mod presence;
mod projection;
mod push;
mod receipts;
mod rooms;
mod session;
mod storage;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::CloseReason;
use crate::push::{DisabledPushSink, HttpPushSink, PushSink};
use crate::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,soiree_server=debug,soiree_store=info")),
        )
        .init();

    info!("Starting Soirée chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let Some(jwt_secret) = config.jwt_secret.clone() else {
        anyhow::bail!("JWT_SECRET must be set");
    };

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let storage = Storage::open(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database opened");

    let push: Arc<dyn PushSink> = match &config.push_gateway_url {
        Some(url) => Arc::new(HttpPushSink::new(url.clone(), config.push_gateway_key.clone())?),
        None => {
            info!("No PUSH_GATEWAY_URL configured, push notifications disabled");
            Arc::new(DisabledPushSink)
        }
    };

    let http_addr = config.http_addr;
    let sweep_period = config.presence_sweep();
    let state = AppState::new(config, &jwt_secret, storage, push);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Presence garbage collection
    let sweeper = state.presence.spawn_sweeper(sweep_period);

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let presence = state.presence.clone();
    let hub = state.hub.clone();

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // -----------------------------------------------------------------------
    // 6. Announce everyone offline and close the sockets
    // -----------------------------------------------------------------------
    sweeper.abort();
    presence.shutdown().await;
    hub.close_all(CloseReason::Shutdown).await;

    Ok(())
}
