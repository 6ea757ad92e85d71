//! Route definitions
//!
//! Maps URLs to handlers with type-safe routing.

use super::{handlers::*, websocket::websocket_handler};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_handler))
        // Player accounts
        .route("/api/players", post(create_player_handler))
        .route("/api/players/:id/balance", get(balance_handler))
        .route("/api/players/:id/transactions", get(history_handler))
        .route("/api/players/:id/deposit", post(deposit_handler))
        .route("/api/players/:id/withdraw", post(withdraw_handler))
        .route("/api/transfer", post(transfer_handler))
        // Game round surface
        .route("/api/wagers", post(place_wager_handler))
        .route("/api/cashout", post(cashout_handler))
        .route("/api/round", get(current_round_handler))
        .route("/api/rounds", get(rounds_handler))
        .route("/api/rounds/:id", get(round_details_handler))
        .route("/api/rounds/:id/verify", post(verify_round_handler))
        // Pricing
        .route("/api/prices", get(prices_handler))
        .route("/api/convert", get(convert_handler))
        // Observer event stream
        .route("/ws", get(websocket_handler))
        // Attach shared state
        .with_state(state)
}
