//! Core domain types for the crash game

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Supported wager denominations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    Btc,
    Eth,
    // Future denominations slot in here without structural change.
}

impl Asset {
    /// List of all supported assets
    pub fn all() -> Vec<Self> {
        vec![Asset::Btc, Asset::Eth]
    }

    /// Identifier used by the CoinGecko-compatible upstream
    pub fn upstream_id(&self) -> &'static str {
        match self {
            Asset::Btc => "bitcoin",
            Asset::Eth => "ethereum",
        }
    }

    /// Last-resort price used when no cache entry has ever been filled
    pub fn fallback_price(&self) -> f64 {
        match self {
            Asset::Btc => 60_000.0,
            Asset::Eth => 3_000.0,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Btc => write!(f, "btc"),
            Asset::Eth => write!(f, "eth"),
        }
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "btc" => Ok(Asset::Btc),
            "eth" => Ok(Asset::Eth),
            other => Err(format!("Unsupported asset: {}", other)),
        }
    }
}

/// A registered player account
///
/// Balances are mutated only through the ledger; the struct itself is a
/// plain persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: String,
    pub balances: HashMap<Asset, f64>,
    pub wagers_placed: u64,
    pub wins: u64,
    pub losses: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Player {
    pub fn new(id: String, name: String, initial_balances: HashMap<Asset, f64>) -> Self {
        let mut balances: HashMap<Asset, f64> =
            Asset::all().into_iter().map(|a| (a, 0.0)).collect();
        balances.extend(initial_balances);

        Self {
            id,
            name,
            balances,
            wagers_placed: 0,
            wins: 0,
            losses: 0,
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn balance(&self, asset: Asset) -> f64 {
        self.balances.get(&asset).copied().unwrap_or(0.0)
    }
}

/// Round lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundState {
    Betting,
    Live,
    Crashed,
    Settled,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundState::Betting => write!(f, "betting"),
            RoundState::Live => write!(f, "live"),
            RoundState::Crashed => write!(f, "crashed"),
            RoundState::Settled => write!(f, "settled"),
        }
    }
}

/// A single wager inside a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub player_id: String,
    pub stake_fiat: f64,
    pub stake_asset: f64,
    pub asset: Asset,
    pub price_at_placement: f64,
    pub cashed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashout_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cashout_asset_amount: Option<f64>,
    pub placed_at: DateTime<Utc>,
}

/// One full game round, from betting window to settlement
///
/// The seed stays server-side until the crash reveals it; only the
/// commitment hash is published at round start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    pub number: u64,
    pub seed: String,
    pub hash: String,
    pub crash_point: f64,
    pub state: RoundState,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub wagers: Vec<Wager>,
    pub peak_multiplier: f64,
}

impl Round {
    /// Find a player's wager that has not been cashed out yet
    pub fn open_wager(&self, player_id: &str) -> Option<&Wager> {
        self.wagers
            .iter()
            .find(|w| w.player_id == player_id && !w.cashed_out)
    }

    /// Whether the player already wagered in this round (cashed out or not)
    pub fn has_wager(&self, player_id: &str) -> bool {
        self.wagers.iter().any(|w| w.player_id == player_id)
    }
}

/// Kinds of ledger transactions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Wager,
    Cashout,
    Deposit,
    Withdrawal,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Wager => write!(f, "wager"),
            TransactionKind::Cashout => write!(f, "cashout"),
            TransactionKind::Deposit => write!(f, "deposit"),
            TransactionKind::Withdrawal => write!(f, "withdrawal"),
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wager" => Ok(TransactionKind::Wager),
            "cashout" => Ok(TransactionKind::Cashout),
            "deposit" => Ok(TransactionKind::Deposit),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            other => Err(format!("Unknown transaction kind: {}", other)),
        }
    }
}

/// Synthetic round id recorded on transactions that do not belong to a
/// game round (deposits, withdrawals, transfers).
pub const EXTERNAL_ROUND_ID: &str = "external";

/// Append-only audit record of a balance movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub player_id: String,
    pub round_id: String,
    pub kind: TransactionKind,
    pub fiat_amount: f64,
    pub asset_amount: f64,
    pub asset: Asset,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        player_id: &str,
        round_id: &str,
        kind: TransactionKind,
        fiat_amount: f64,
        asset_amount: f64,
        asset: Asset,
        price: f64,
        multiplier: Option<f64>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            player_id: player_id.to_string(),
            round_id: round_id.to_string(),
            kind,
            fiat_amount,
            asset_amount,
            asset,
            price,
            multiplier,
            created_at: Utc::now(),
        }
    }
}

/// Round to two decimal places (fiat amounts, multipliers)
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round to eight decimal places (asset amounts)
pub fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_round_trip() {
        for asset in Asset::all() {
            let parsed: Asset = asset.to_string().parse().unwrap();
            assert_eq!(parsed, asset);
        }
        assert!("doge".parse::<Asset>().is_err());
    }

    #[test]
    fn test_player_seeds_all_balances() {
        let player = Player::new(
            "alice".to_string(),
            "Alice".to_string(),
            HashMap::from([(Asset::Btc, 1.0)]),
        );

        assert_eq!(player.balance(Asset::Btc), 1.0);
        assert_eq!(player.balance(Asset::Eth), 0.0);
        assert!(player.active);
    }

    #[test]
    fn test_open_wager_lookup() {
        let mut round = Round {
            id: "round_1".to_string(),
            number: 1,
            seed: String::new(),
            hash: String::new(),
            crash_point: 2.0,
            state: RoundState::Live,
            start_time: Utc::now(),
            end_time: None,
            wagers: vec![Wager {
                player_id: "alice".to_string(),
                stake_fiat: 100.0,
                stake_asset: 0.002,
                asset: Asset::Btc,
                price_at_placement: 50_000.0,
                cashed_out: false,
                cashout_multiplier: None,
                cashout_asset_amount: None,
                placed_at: Utc::now(),
            }],
            peak_multiplier: 1.0,
        };

        assert!(round.open_wager("alice").is_some());
        assert!(round.open_wager("bob").is_none());

        round.wagers[0].cashed_out = true;
        assert!(round.open_wager("alice").is_none());
        assert!(round.has_wager("alice"));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round2(1.006), 1.01);
        assert_eq!(round2(2.999_9), 3.0);
        assert_eq!(round8(0.123_456_789_9), 0.123_456_79);
    }
}
