//! REST API server for syncroom
//!
//! Read-only status endpoints for operators and health checks. Document
//! traffic never flows through here.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use crate::registry::RoomRegistry;

// Shared state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub ws_port: u16,
}

// Routes
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/rooms", get(list_rooms))
}

// Handlers

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "ws_port": state.ws_port,
    }))
}

async fn list_rooms(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.registry.room_stats().await;
    let rooms: Vec<serde_json::Value> = stats
        .into_iter()
        .map(|(id, sessions, presence)| {
            serde_json::json!({
                "id": id,
                "sessions": sessions,
                "presence": presence,
            })
        })
        .collect();
    Json(serde_json::json!({ "rooms": rooms }))
}
