//! Async WebSocket relay server using tokio-tungstenite
//!
//! Accepts connections, routes each to its room by request path, and runs
//! a background sweeper that expires stale presence across all rooms.
//!
//! ## Module Structure
//! - `protocol`: room routing from the request URI
//! - `connection`: handshake, message loop, liveness, cleanup

mod connection;
mod protocol;

pub use protocol::{parse_room_from_uri, DEFAULT_ROOM};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;

use crate::registry::RoomRegistry;

/// Main relay accept loop.
///
/// Takes a bound listener so callers (tests included) control the address.
/// Runs until the listener fails; every connection gets its own task.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<RoomRegistry>,
    ping_interval: Duration,
    presence_window: Duration,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Relay listening");

    // Sweeper for presence entries whose owner went silent without a clean
    // disconnect
    let sweep_registry = registry.clone();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(presence_window);
        timer.tick().await;
        loop {
            timer.tick().await;
            sweep_registry.sweep_presence(presence_window).await;
        }
    });

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection::handle_connection(stream, registry, ping_interval).await {
                        tracing::warn!(error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept failed");
            }
        }
    }
}
