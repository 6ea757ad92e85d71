//! Error types for the crashpoint game server
//!
//! One enum per concern, converging on a root [`CrashError`] so every layer
//! can return [`CrashResult`].

use crate::types::Asset;
use thiserror::Error;

/// Root error type for all crashpoint operations
#[derive(Debug, Error)]
pub enum CrashError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Persistence layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    OpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted record at {key}: {reason}")]
    CorruptedRecord { key: String, reason: String },
}

/// Ledger operation errors (player accounts, balances, transactions)
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Unknown player: {0}")]
    PlayerNotFound(String),

    #[error("Player id or name already taken: {0}")]
    DuplicatePlayer(String),

    #[error("Insufficient balance for {player}: {available} {asset} available, {required} required")]
    InsufficientBalance {
        player: String,
        asset: Asset,
        available: f64,
        required: f64,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid player field: {0}")]
    InvalidPlayer(String),

    #[error("Unknown round: {0}")]
    RoundNotFound(String),
}

/// Round engine state errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Betting window is closed")]
    BettingClosed,

    #[error("Round is not live")]
    RoundNotLive,

    #[error("Stake {stake} outside accepted range [{min}, {max}]")]
    StakeOutOfRange { stake: f64, min: f64, max: f64 },

    #[error("Player {0} already has an open wager this round")]
    DuplicateWager(String),

    #[error("Player {0} has no open wager this round")]
    NoOpenWager(String),

    #[error("Engine halted after infrastructure failure")]
    Halted,
}

/// Price oracle errors
///
/// Upstream failures are absorbed by the cache and never reach game
/// callers; these surface only from the [`crate::oracle::PriceSource`]
/// implementations themselves.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Upstream request failed: {0}")]
    UpstreamFailed(String),

    #[error("Upstream response malformed: {0}")]
    MalformedResponse(String),
}

// External error conversions
impl From<rocksdb::Error> for CrashError {
    fn from(e: rocksdb::Error) -> Self {
        CrashError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<std::io::Error> for CrashError {
    fn from(e: std::io::Error) -> Self {
        CrashError::Storage(StorageError::ReadFailed(e.to_string()))
    }
}

impl From<serde_json::Error> for CrashError {
    fn from(e: serde_json::Error) -> Self {
        CrashError::Storage(StorageError::CorruptedRecord {
            key: "<unknown>".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Convenience type alias for Results
pub type CrashResult<T> = Result<T, CrashError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CrashError::from(EngineError::BettingClosed);
        assert!(err.to_string().contains("Engine error"));
        assert!(err.to_string().contains("Betting window"));
    }

    #[test]
    fn test_insufficient_balance_details() {
        let err = LedgerError::InsufficientBalance {
            player: "alice".to_string(),
            asset: Asset::Btc,
            available: 0.5,
            required: 1.0,
        };

        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("0.5"));
        assert!(msg.contains("1"));
    }

    #[test]
    fn test_error_conversion() {
        let err: CrashError = LedgerError::PlayerNotFound("bob".to_string()).into();
        match err {
            CrashError::Ledger(LedgerError::PlayerNotFound(id)) => assert_eq!(id, "bob"),
            _ => panic!("Expected ledger error"),
        }
    }
}
