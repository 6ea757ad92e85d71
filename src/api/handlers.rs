//! Request handlers
//!
//! Validate and sanitise caller input, then delegate to the core components.

use super::{errors::ApiError, middleware::RequestId, models::*};
use crate::engine::RoundEngine;
use crate::fairness;
use crate::ledger::{Ledger, TxContext};
use crate::types::{Asset, TransactionKind};
use crate::oracle::PriceOracle;
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

const MAX_PAGE_SIZE: usize = 100;

/// Shared application state handed to every handler
pub struct AppState {
    pub engine: Arc<RoundEngine>,
    pub ledger: Arc<Ledger>,
    pub oracle: Arc<PriceOracle>,
    pub hub: Arc<super::websocket::BroadcastHub>,
    pub max_crash: f64,
}

fn parse_asset(request_id: &str, raw: &str) -> Result<Asset, ApiError> {
    Asset::from_str(raw)
        .map_err(|e| ApiError::validation(request_id.to_string(), e))
}

fn require_positive(request_id: &str, amount: f64, what: &str) -> Result<(), ApiError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ApiError::validation(
            request_id.to_string(),
            format!("{} must be a positive number", what),
        ));
    }
    Ok(())
}

fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.engine.is_halted() {
            "Degraded".to_string()
        } else {
            "Running".to_string()
        },
        observers: state.hub.connected_observers(),
    })
}

/// POST /api/players
pub async fn create_player_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePlayerRequest>,
) -> Result<Json<PlayerResponse>, ApiError> {
    let mut balances = HashMap::new();
    for (raw_asset, amount) in &body.initial_balances {
        let asset = parse_asset(&request_id.0, raw_asset)?;
        if !amount.is_finite() || *amount < 0.0 {
            return Err(ApiError::validation(
                request_id.0.clone(),
                "Initial balances must be non-negative".to_string(),
            ));
        }
        balances.insert(asset, *amount);
    }

    let player = state
        .ledger
        .create_player(&body.id, &body.name, balances)
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(player.into()))
}

/// GET /api/players/:id/balance
pub async fn balance_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
) -> Result<Json<crate::ledger::BalanceView>, ApiError> {
    let view = state
        .ledger
        .balance(&player_id)
        .await
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(view))
}

/// GET /api/players/:id/transactions?page=&page_size=&kind=
pub async fn history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let kind = match &query.kind {
        Some(raw) => Some(
            TransactionKind::from_str(raw)
                .map_err(|e| ApiError::validation(request_id.0.clone(), e))?,
        ),
        None => None,
    };

    let page = state
        .ledger
        .history(&player_id, kind, query.page, clamp_page_size(query.page_size))
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(HistoryResponse {
        player_id,
        page: page.page,
        has_more: page.has_more,
        transactions: page.transactions,
    }))
}

/// POST /api/players/:id/deposit
pub async fn deposit_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
    Json(body): Json<BalanceChangeRequest>,
) -> Result<Json<BalanceChangeResponse>, ApiError> {
    let asset = parse_asset(&request_id.0, &body.asset)?;
    require_positive(&request_id.0, body.amount, "Deposit amount")?;

    let price = state.oracle.price(asset).await;
    let balance = state
        .ledger
        .credit(
            &player_id,
            asset,
            body.amount,
            TxContext::external(TransactionKind::Deposit, body.amount * price, price),
        )
        .await
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(BalanceChangeResponse {
        player_id,
        asset,
        amount: body.amount,
        balance,
    }))
}

/// POST /api/players/:id/withdraw
pub async fn withdraw_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
    Json(body): Json<BalanceChangeRequest>,
) -> Result<Json<BalanceChangeResponse>, ApiError> {
    let asset = parse_asset(&request_id.0, &body.asset)?;
    require_positive(&request_id.0, body.amount, "Withdrawal amount")?;

    let price = state.oracle.price(asset).await;
    let balance = state
        .ledger
        .debit(
            &player_id,
            asset,
            body.amount,
            TxContext::external(TransactionKind::Withdrawal, body.amount * price, price),
        )
        .await
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(BalanceChangeResponse {
        player_id,
        asset,
        amount: body.amount,
        balance,
    }))
}

/// POST /api/transfer
pub async fn transfer_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransferRequest>,
) -> Result<Json<TransferResponse>, ApiError> {
    let asset = parse_asset(&request_id.0, &body.asset)?;
    require_positive(&request_id.0, body.amount, "Transfer amount")?;

    state
        .ledger
        .transfer(&body.from, &body.to, asset, body.amount)
        .await
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(TransferResponse {
        from: body.from,
        to: body.to,
        asset,
        amount: body.amount,
    }))
}

/// POST /api/wagers
pub async fn place_wager_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PlaceWagerRequest>,
) -> Result<Json<crate::engine::WagerReceipt>, ApiError> {
    let asset = parse_asset(&request_id.0, &body.asset)?;
    require_positive(&request_id.0, body.stake_fiat, "Stake")?;

    let receipt = state
        .engine
        .place_wager(&body.player_id, body.stake_fiat, asset)
        .await
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(receipt))
}

/// POST /api/cashout
pub async fn cashout_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CashoutRequest>,
) -> Result<Json<crate::engine::CashoutReceipt>, ApiError> {
    let receipt = state
        .engine
        .cash_out(&body.player_id)
        .await
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(receipt))
}

/// GET /api/round
pub async fn current_round_handler(
    State(state): State<Arc<AppState>>,
) -> Json<CurrentRoundResponse> {
    let snapshot = state.engine.snapshot().await;
    Json(CurrentRoundResponse {
        active: snapshot.is_some(),
        snapshot,
    })
}

/// GET /api/rounds?page=&page_size=
pub async fn rounds_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoundsQuery>,
) -> Result<Json<RoundsResponse>, ApiError> {
    let rounds = state
        .ledger
        .rounds_page(query.page, clamp_page_size(query.page_size))
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(RoundsResponse {
        page: query.page,
        rounds: rounds.iter().map(RoundSummary::from).collect(),
    }))
}

/// GET /api/rounds/:id
pub async fn round_details_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<String>,
) -> Result<Json<crate::types::Round>, ApiError> {
    let round = state
        .ledger
        .round_by_id(&round_id)
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    Ok(Json(round))
}

/// POST /api/rounds/:id/verify
pub async fn verify_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<String>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    if body.seed.is_empty() || body.seed.len() > 128 {
        return Err(ApiError::validation(
            request_id.0,
            "Seed must be 1-128 characters".to_string(),
        ));
    }
    if !body.claimed_crash.is_finite() || body.claimed_crash < 1.0 {
        return Err(ApiError::validation(
            request_id.0,
            "Claimed crash point must be at least 1.00".to_string(),
        ));
    }

    let round = state
        .ledger
        .round_by_id(&round_id)
        .map_err(|e| ApiError::from_crash(request_id.0.clone(), e))?;

    let recomputed_hash = fairness::commitment(&body.seed, round.number);
    let recomputed_crash_point =
        fairness::derive_crash_point(&body.seed, round.number, state.max_crash);
    let valid = recomputed_hash == round.hash
        && fairness::verify_crash_point(&body.seed, round.number, body.claimed_crash, state.max_crash);

    Ok(Json(VerifyResponse {
        round_id,
        valid,
        recomputed_hash,
        recomputed_crash_point,
        stored_hash: round.hash,
        stored_crash_point: round.crash_point,
    }))
}

/// GET /api/prices
pub async fn prices_handler(State(state): State<Arc<AppState>>) -> Json<PricesResponse> {
    let prices = state.oracle.prices(&Asset::all()).await;
    Json(PricesResponse { prices })
}

/// GET /api/convert?amount=&direction=&asset=
pub async fn convert_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConvertQuery>,
) -> Result<Json<ConvertResponse>, ApiError> {
    let asset = parse_asset(&request_id.0, &query.asset)?;
    require_positive(&request_id.0, query.amount, "Amount")?;

    let price = state.oracle.price(asset).await;
    let converted = match query.direction.as_str() {
        "usd_to_asset" => query.amount / price,
        "asset_to_usd" => query.amount * price,
        other => {
            return Err(ApiError::validation(
                request_id.0,
                format!(
                    "Unknown direction '{}': expected usd_to_asset or asset_to_usd",
                    other
                ),
            ));
        }
    };

    Ok(Json(ConvertResponse {
        amount: query.amount,
        converted,
        asset,
        direction: query.direction,
        price,
    }))
}
