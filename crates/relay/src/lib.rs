// syncroom-relay library
// Room-multiplexed document sync relay over tokio and tokio-tungstenite

// Core relay modules
pub mod registry;
pub mod ws;

// Presence bookkeeping
pub mod presence;

// Snapshot persistence
pub mod persist;

// Configuration
pub mod config;

// HTTP status API
pub mod api;
