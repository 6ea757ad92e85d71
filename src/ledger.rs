//! Wager ledger: players, balances, transactions, and settled rounds
//!
//! All records live in the document store under prefixed keys. Balance
//! mutations take a per-player lock and land together with their audit
//! transaction in one atomic write batch, so no caller ever observes a
//! debit without its matching record.

use crate::errors::{CrashResult, LedgerError};
use crate::oracle::PriceOracle;
use crate::storage::Store;
use crate::types::{
    round8, Asset, Player, Round, Transaction, TransactionKind, EXTERNAL_ROUND_ID,
};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const PLAYER_PREFIX: &str = "player:id:";
const PLAYER_NAME_PREFIX: &str = "player:name:";
const TX_PREFIX: &str = "tx:";
const ROUND_PREFIX: &str = "round:id:";
const ROUND_SEQ_PREFIX: &str = "round:seq:";
const META_ROUND_NUMBER: &[u8] = b"meta:round_number";

fn player_key(id: &str) -> Vec<u8> {
    format!("{}{}", PLAYER_PREFIX, id).into_bytes()
}

fn player_name_key(name: &str) -> Vec<u8> {
    format!("{}{}", PLAYER_NAME_PREFIX, name.to_ascii_lowercase()).into_bytes()
}

/// Newest-first ordering: timestamp and a process-local sequence are both
/// inverted so an ascending prefix scan yields the most recent records
/// first. The sequence breaks ties within one millisecond.
fn tx_key(player_id: &str, ts_millis: i64, seq: u64) -> Vec<u8> {
    format!(
        "{}{}:{:020}:{:020}",
        TX_PREFIX,
        player_id,
        u64::MAX - ts_millis.max(0) as u64,
        u64::MAX - seq
    )
    .into_bytes()
}

fn tx_prefix(player_id: &str) -> Vec<u8> {
    format!("{}{}:", TX_PREFIX, player_id).into_bytes()
}

fn round_key(id: &str) -> Vec<u8> {
    format!("{}{}", ROUND_PREFIX, id).into_bytes()
}

fn round_seq_key(number: u64) -> Vec<u8> {
    format!("{}{:020}", ROUND_SEQ_PREFIX, u64::MAX - number).into_bytes()
}

/// Context recorded alongside a balance mutation
#[derive(Debug, Clone)]
pub struct TxContext {
    pub round_id: String,
    pub kind: TransactionKind,
    pub fiat_amount: f64,
    pub price: f64,
    pub multiplier: Option<f64>,
}

impl TxContext {
    pub fn external(kind: TransactionKind, fiat_amount: f64, price: f64) -> Self {
        Self {
            round_id: EXTERNAL_ROUND_ID.to_string(),
            kind,
            fiat_amount,
            price,
            multiplier: None,
        }
    }
}

/// Balance report for one player
#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub balances: HashMap<Asset, f64>,
    pub prices: HashMap<Asset, f64>,
    pub total_fiat: f64,
}

/// Paged slice of a player's transaction history
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub transactions: Vec<Transaction>,
    pub page: usize,
    pub has_more: bool,
}

pub struct Ledger {
    store: Store,
    oracle: Arc<PriceOracle>,
    /// Serializes balance read-modify-write per player
    player_locks: DashMap<String, Arc<Mutex<()>>>,
    tx_seq: AtomicU64,
    round_number: AtomicU64,
}

impl Ledger {
    pub fn open(store: Store, oracle: Arc<PriceOracle>) -> CrashResult<Self> {
        let round_number = store.get_doc::<u64>(META_ROUND_NUMBER)?.unwrap_or(0);

        Ok(Self {
            store,
            oracle,
            player_locks: DashMap::new(),
            tx_seq: AtomicU64::new(0),
            round_number: AtomicU64::new(round_number),
        })
    }

    fn lock_for(&self, player_id: &str) -> Arc<Mutex<()>> {
        self.player_locks
            .entry(player_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // Players
    // =========================================================================

    /// Register a new player. Fails when the id or name is already taken.
    pub fn create_player(
        &self,
        id: &str,
        name: &str,
        initial_balances: HashMap<Asset, f64>,
    ) -> CrashResult<Player> {
        validate_player_id(id)?;
        validate_player_name(name)?;

        if self.store.get(&player_key(id)).is_some() {
            return Err(LedgerError::DuplicatePlayer(id.to_string()).into());
        }
        if self.store.get(&player_name_key(name)).is_some() {
            return Err(LedgerError::DuplicatePlayer(name.to_string()).into());
        }

        for amount in initial_balances.values() {
            if *amount < 0.0 {
                return Err(LedgerError::InvalidAmount(
                    "Initial balances must be non-negative".to_string(),
                )
                .into());
            }
        }

        let player = Player::new(id.to_string(), name.to_string(), initial_balances);
        self.store.batch_write(vec![
            (player_key(id), Store::encode_doc(&player)?),
            (player_name_key(name), id.as_bytes().to_vec()),
        ])?;

        info!(player = id, "Registered player");
        Ok(player)
    }

    /// Load a player record
    pub fn player(&self, id: &str) -> CrashResult<Player> {
        self.store
            .get_doc(&player_key(id))?
            .ok_or_else(|| LedgerError::PlayerNotFound(id.to_string()).into())
    }

    /// Per-asset balances with prices and fiat total valued at call time
    pub async fn balance(&self, id: &str) -> CrashResult<BalanceView> {
        let player = self.player(id)?;
        let prices = self.oracle.prices(&Asset::all()).await;

        let total_fiat = player
            .balances
            .iter()
            .map(|(asset, amount)| amount * prices.get(asset).copied().unwrap_or(0.0))
            .sum();

        Ok(BalanceView {
            balances: player.balances,
            prices,
            total_fiat,
        })
    }

    // =========================================================================
    // Balance mutations
    // =========================================================================

    /// Credit a player's balance and append the matching transaction
    pub async fn credit(
        &self,
        player_id: &str,
        asset: Asset,
        amount: f64,
        ctx: TxContext,
    ) -> CrashResult<f64> {
        if amount <= 0.0 {
            return Err(LedgerError::InvalidAmount("Credit must be positive".to_string()).into());
        }

        let lock = self.lock_for(player_id);
        let _guard = lock.lock().await;

        let mut player = self.player(player_id)?;
        let balance = round8(player.balance(asset) + amount);
        player.balances.insert(asset, balance);
        if ctx.kind == TransactionKind::Cashout {
            player.wins += 1;
        }

        self.write_balance_change(&player, asset, amount, ctx)?;
        Ok(balance)
    }

    /// Debit a player's balance and append the matching transaction.
    /// Fails without side effects when the balance does not cover the amount.
    pub async fn debit(
        &self,
        player_id: &str,
        asset: Asset,
        amount: f64,
        ctx: TxContext,
    ) -> CrashResult<f64> {
        if amount <= 0.0 {
            return Err(LedgerError::InvalidAmount("Debit must be positive".to_string()).into());
        }

        let lock = self.lock_for(player_id);
        let _guard = lock.lock().await;

        let mut player = self.player(player_id)?;
        let available = player.balance(asset);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                player: player_id.to_string(),
                asset,
                available,
                required: amount,
            }
            .into());
        }

        let balance = round8(available - amount);
        player.balances.insert(asset, balance);
        if ctx.kind == TransactionKind::Wager {
            player.wagers_placed += 1;
        }

        self.write_balance_change(&player, asset, -amount, ctx)?;
        Ok(balance)
    }

    fn write_balance_change(
        &self,
        player: &Player,
        asset: Asset,
        signed_amount: f64,
        ctx: TxContext,
    ) -> CrashResult<()> {
        let seq = self.tx_seq.fetch_add(1, Ordering::SeqCst);
        let tx = Transaction::new(
            &player.id,
            &ctx.round_id,
            ctx.kind,
            ctx.fiat_amount,
            signed_amount.abs(),
            asset,
            ctx.price,
            ctx.multiplier,
        );

        self.store.batch_write(vec![
            (player_key(&player.id), Store::encode_doc(player)?),
            (
                tx_key(&player.id, tx.created_at.timestamp_millis(), seq),
                Store::encode_doc(&tx)?,
            ),
        ])
    }

    /// Move funds between two players, all-or-nothing.
    ///
    /// Locks are taken in id order so concurrent opposing transfers cannot
    /// deadlock.
    pub async fn transfer(
        &self,
        src: &str,
        dst: &str,
        asset: Asset,
        amount: f64,
    ) -> CrashResult<()> {
        if amount <= 0.0 {
            return Err(LedgerError::InvalidAmount("Transfer must be positive".to_string()).into());
        }
        if src == dst {
            return Err(LedgerError::InvalidAmount(
                "Transfer endpoints must differ".to_string(),
            )
            .into());
        }

        // Resolve the price up front; no lock is held across the fetch.
        let price = self.oracle.price(asset).await;
        let fiat = amount * price;

        let (first, second) = if src < dst { (src, dst) } else { (dst, src) };
        let first_lock = self.lock_for(first);
        let second_lock = self.lock_for(second);
        let _first_guard = first_lock.lock().await;
        let _second_guard = second_lock.lock().await;

        let mut src_player = self.player(src)?;
        let mut dst_player = self.player(dst)?;

        let available = src_player.balance(asset);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                player: src.to_string(),
                asset,
                available,
                required: amount,
            }
            .into());
        }

        src_player.balances.insert(asset, round8(available - amount));
        dst_player
            .balances
            .insert(asset, round8(dst_player.balance(asset) + amount));

        let out_seq = self.tx_seq.fetch_add(1, Ordering::SeqCst);
        let in_seq = self.tx_seq.fetch_add(1, Ordering::SeqCst);
        let out_tx = Transaction::new(
            src,
            EXTERNAL_ROUND_ID,
            TransactionKind::Withdrawal,
            fiat,
            amount,
            asset,
            price,
            None,
        );
        let in_tx = Transaction::new(
            dst,
            EXTERNAL_ROUND_ID,
            TransactionKind::Deposit,
            fiat,
            amount,
            asset,
            price,
            None,
        );

        self.store.batch_write(vec![
            (player_key(src), Store::encode_doc(&src_player)?),
            (player_key(dst), Store::encode_doc(&dst_player)?),
            (
                tx_key(src, out_tx.created_at.timestamp_millis(), out_seq),
                Store::encode_doc(&out_tx)?,
            ),
            (
                tx_key(dst, in_tx.created_at.timestamp_millis(), in_seq),
                Store::encode_doc(&in_tx)?,
            ),
        ])?;

        info!(src, dst, %asset, amount, "Transfer complete");
        Ok(())
    }

    /// Bump the loss counter for a wager left open at crash
    pub async fn record_loss(&self, player_id: &str) -> CrashResult<()> {
        let lock = self.lock_for(player_id);
        let _guard = lock.lock().await;

        let mut player = self.player(player_id)?;
        player.losses += 1;
        self.store.put_doc(&player_key(player_id), &player)
    }

    /// Append a standalone transaction record
    pub fn record_transaction(&self, tx: &Transaction) -> CrashResult<()> {
        let seq = self.tx_seq.fetch_add(1, Ordering::SeqCst);
        self.store.put(
            &tx_key(&tx.player_id, tx.created_at.timestamp_millis(), seq),
            &Store::encode_doc(tx)?,
        )
    }

    // =========================================================================
    // Transaction history
    // =========================================================================

    /// Paged history, most recent first, optionally filtered by kind
    pub fn history(
        &self,
        player_id: &str,
        kind: Option<TransactionKind>,
        page: usize,
        page_size: usize,
    ) -> CrashResult<HistoryPage> {
        // Existence check keeps unknown players a distinct error from an
        // empty history.
        self.player(player_id)?;

        let prefix = tx_prefix(player_id);
        let mut skip = page * page_size;
        let mut transactions = Vec::new();
        let mut has_more = false;
        let mut cursor: Option<Vec<u8>> = None;

        'scan: loop {
            let batch = self.store.scan_prefix(&prefix, cursor.as_deref(), 256);
            if batch.is_empty() {
                break;
            }
            cursor = Some(batch.last().unwrap().0.clone());

            for (key, value) in batch {
                let tx: Transaction = serde_json::from_slice(&value).map_err(|e| {
                    crate::errors::StorageError::CorruptedRecord {
                        key: String::from_utf8_lossy(&key).to_string(),
                        reason: e.to_string(),
                    }
                })?;

                if let Some(filter) = kind {
                    if tx.kind != filter {
                        continue;
                    }
                }

                if skip > 0 {
                    skip -= 1;
                    continue;
                }

                if transactions.len() == page_size {
                    has_more = true;
                    break 'scan;
                }
                transactions.push(tx);
            }
        }

        Ok(HistoryPage {
            transactions,
            page,
            has_more,
        })
    }

    /// Full transaction log for one player, oldest last
    pub fn all_transactions(&self, player_id: &str) -> CrashResult<Vec<Transaction>> {
        let prefix = tx_prefix(player_id);
        let mut out = Vec::new();
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let batch = self.store.scan_prefix(&prefix, cursor.as_deref(), 256);
            if batch.is_empty() {
                break;
            }
            cursor = Some(batch.last().unwrap().0.clone());
            for (_, value) in batch {
                out.push(serde_json::from_slice(&value).map_err(crate::errors::CrashError::from)?);
            }
        }

        Ok(out)
    }

    // =========================================================================
    // Rounds
    // =========================================================================

    /// Allocate the next round number, persisting the counter
    pub fn next_round_number(&self) -> CrashResult<u64> {
        let number = self.round_number.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.put_doc(META_ROUND_NUMBER, &number)?;
        Ok(number)
    }

    /// Persist a finalized round
    pub fn store_round(&self, round: &Round) -> CrashResult<()> {
        self.store.batch_write(vec![
            (round_key(&round.id), Store::encode_doc(round)?),
            (round_seq_key(round.number), round.id.as_bytes().to_vec()),
        ])
    }

    /// Load a completed round by id
    pub fn round_by_id(&self, id: &str) -> CrashResult<Round> {
        self.store
            .get_doc(&round_key(id))?
            .ok_or_else(|| LedgerError::RoundNotFound(id.to_string()).into())
    }

    /// Completed rounds, newest first
    pub fn rounds_page(&self, page: usize, page_size: usize) -> CrashResult<Vec<Round>> {
        let skip = page * page_size;
        let index = self.store.scan_prefix(
            ROUND_SEQ_PREFIX.as_bytes(),
            None,
            skip + page_size,
        );

        let mut rounds = Vec::new();
        for (_, id_bytes) in index.into_iter().skip(skip) {
            let id = String::from_utf8_lossy(&id_bytes).to_string();
            rounds.push(self.round_by_id(&id)?);
        }

        Ok(rounds)
    }

    // =========================================================================
    // Startup reconciliation
    // =========================================================================

    /// Credit wagers that were marked cashed-out but never credited.
    ///
    /// A crash between marking a wager and writing the credit leaves the
    /// transaction log without a cashout record for that round; this replays
    /// the missing credit from the persisted round state.
    pub async fn reconcile_cashouts(&self) -> CrashResult<usize> {
        let mut repaired = 0;
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let batch = self
                .store
                .scan_prefix(ROUND_PREFIX.as_bytes(), cursor.as_deref(), 64);
            if batch.is_empty() {
                break;
            }
            cursor = Some(batch.last().unwrap().0.clone());

            for (_, value) in batch {
                let round: Round = serde_json::from_slice(&value)
                    .map_err(crate::errors::CrashError::from)?;

                for wager in round.wagers.iter().filter(|w| w.cashed_out) {
                    if self.has_cashout_tx(&wager.player_id, &round.id)? {
                        continue;
                    }

                    let multiplier = wager.cashout_multiplier.unwrap_or(1.0);
                    let payout = wager
                        .cashout_asset_amount
                        .unwrap_or(round8(wager.stake_asset * multiplier));

                    warn!(
                        player = %wager.player_id,
                        round = %round.id,
                        payout,
                        "Reconciling uncredited cash-out"
                    );

                    self.credit(
                        &wager.player_id,
                        wager.asset,
                        payout,
                        TxContext {
                            round_id: round.id.clone(),
                            kind: TransactionKind::Cashout,
                            fiat_amount: wager.stake_fiat * multiplier,
                            price: wager.price_at_placement,
                            multiplier: Some(multiplier),
                        },
                    )
                    .await?;
                    repaired += 1;
                }
            }
        }

        if repaired > 0 {
            info!(repaired, "Cash-out reconciliation complete");
        }
        Ok(repaired)
    }

    fn has_cashout_tx(&self, player_id: &str, round_id: &str) -> CrashResult<bool> {
        Ok(self
            .all_transactions(player_id)?
            .iter()
            .any(|tx| tx.kind == TransactionKind::Cashout && tx.round_id == round_id))
    }
}

fn validate_player_id(id: &str) -> Result<(), LedgerError> {
    if id.len() < 3 || id.len() > 50 {
        return Err(LedgerError::InvalidPlayer(
            "Player id must be 3-50 characters".to_string(),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(LedgerError::InvalidPlayer(
            "Player id may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

fn validate_player_name(name: &str) -> Result<(), LedgerError> {
    if name.len() < 3 || name.len() > 20 {
        return Err(LedgerError::InvalidPlayer(
            "Player name must be 3-20 characters".to_string(),
        ));
    }
    Ok(())
}
