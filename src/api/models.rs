//! Request and response bodies for the HTTP facade

use crate::engine::RoundSnapshot;
use crate::types::{Asset, Player, Round, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub observers: u64,
}

/// POST /api/players
#[derive(Debug, Deserialize)]
pub struct CreatePlayerRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub initial_balances: HashMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct PlayerResponse {
    pub id: String,
    pub name: String,
    pub balances: HashMap<Asset, f64>,
    pub wagers_placed: u64,
    pub wins: u64,
    pub losses: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Player> for PlayerResponse {
    fn from(player: Player) -> Self {
        Self {
            id: player.id,
            name: player.name,
            balances: player.balances,
            wagers_placed: player.wagers_placed,
            wins: player.wins,
            losses: player.losses,
            active: player.active,
            created_at: player.created_at,
        }
    }
}

/// POST /api/wagers
#[derive(Debug, Deserialize)]
pub struct PlaceWagerRequest {
    pub player_id: String,
    pub stake_fiat: f64,
    pub asset: String,
}

/// POST /api/cashout
#[derive(Debug, Deserialize)]
pub struct CashoutRequest {
    pub player_id: String,
}

/// POST /api/players/:id/deposit and /withdraw
#[derive(Debug, Deserialize)]
pub struct BalanceChangeRequest {
    pub asset: String,
    pub amount: f64,
}

#[derive(Debug, Serialize)]
pub struct BalanceChangeResponse {
    pub player_id: String,
    pub asset: Asset,
    pub amount: f64,
    pub balance: f64,
}

/// POST /api/transfer
#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub asset: String,
    pub amount: f64,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub from: String,
    pub to: String,
    pub asset: Asset,
    pub amount: f64,
}

/// GET /api/players/:id/transactions
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub player_id: String,
    pub page: usize,
    pub has_more: bool,
    pub transactions: Vec<Transaction>,
}

/// GET /api/round
#[derive(Debug, Serialize)]
pub struct CurrentRoundResponse {
    pub active: bool,
    #[serde(flatten)]
    pub snapshot: Option<RoundSnapshot>,
}

/// GET /api/rounds
#[derive(Debug, Deserialize)]
pub struct RoundsQuery {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Serialize)]
pub struct RoundSummary {
    pub id: String,
    pub number: u64,
    pub crash_point: f64,
    pub hash: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub wager_count: usize,
    pub peak_multiplier: f64,
}

impl From<&Round> for RoundSummary {
    fn from(round: &Round) -> Self {
        Self {
            id: round.id.clone(),
            number: round.number,
            crash_point: round.crash_point,
            hash: round.hash.clone(),
            start_time: round.start_time,
            end_time: round.end_time,
            wager_count: round.wagers.len(),
            peak_multiplier: round.peak_multiplier,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RoundsResponse {
    pub page: usize,
    pub rounds: Vec<RoundSummary>,
}

/// POST /api/rounds/:id/verify
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub seed: String,
    pub claimed_crash: f64,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub round_id: String,
    pub valid: bool,
    pub recomputed_hash: String,
    pub recomputed_crash_point: f64,
    pub stored_hash: String,
    pub stored_crash_point: f64,
}

/// GET /api/prices
#[derive(Debug, Serialize)]
pub struct PricesResponse {
    pub prices: HashMap<Asset, f64>,
}

/// GET /api/convert
#[derive(Debug, Deserialize)]
pub struct ConvertQuery {
    pub amount: f64,
    pub direction: String,
    pub asset: String,
}

#[derive(Debug, Serialize)]
pub struct ConvertResponse {
    pub amount: f64,
    pub converted: f64,
    pub asset: Asset,
    pub direction: String,
    pub price: f64,
}

fn default_page_size() -> usize {
    20
}
