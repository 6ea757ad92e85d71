//! crashpoint - Real-time multiplayer crash wagering game server
//!
//! A shared multiplier grows from 1.00 until a pre-committed crash point;
//! wagering clients cash out before the crash or forfeit their stake. The
//! crash point is provably fair: its seed is committed by hash before
//! betting opens and revealed when the round crashes.

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fairness;
pub mod ledger;
pub mod oracle;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, ConfigLoader};
pub use engine::{GameEvent, RoundEngine};
pub use errors::{CrashError, CrashResult};
pub use ledger::Ledger;
pub use oracle::PriceOracle;
pub use storage::Store;
pub use types::{Asset, Player, Round, RoundState, Transaction, Wager};
