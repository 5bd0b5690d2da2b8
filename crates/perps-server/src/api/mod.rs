pub mod dto;
pub mod handlers;

use axum::{routing::get, Router};

use crate::AppState;

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Cached views
        .route("/api/v1/snapshot", get(handlers::get_snapshot))
        .route("/api/v1/protocols", get(handlers::get_protocols))
        .route("/api/v1/windows/{window}", get(handlers::get_window))
        .route("/api/v1/markets/drift", get(handlers::get_drift_markets))
        .route("/api/v1/markets/jupiter", get(handlers::get_jupiter_markets))
        .route("/api/v1/global", get(handlers::get_global))
        .route("/api/v1/leaderboard/jupiter", get(handlers::get_pnl_leaderboard))
        .route("/api/v1/history", get(handlers::get_history))
        // Live analytics query
        .route("/api/v1/debug/query/{query_id}", get(handlers::debug_query))
}
