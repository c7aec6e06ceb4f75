//! HTTP route definitions

mod health;
pub mod ws;

use axum::Router;
use crate::AppState;

/// Health and liveness routes
pub fn api_routes() -> Router<AppState> {
    health::routes()
}

/// WebSocket routes (separate from API)
pub fn ws_routes() -> Router<AppState> {
    ws::routes()
}
