//! Round lifecycle engine
//!
//! Drives the repeating cycle betting → live → crashed → settled, owns the
//! live multiplier, and is the only writer of the current round. Events go
//! out on a single broadcast channel; the hub fans them out to observers
//! without ever being called from the tick loop.

use crate::config::{GameConfig, HubConfig};
use crate::errors::{CrashResult, EngineError};
use crate::fairness;
use crate::ledger::{Ledger, TxContext};
use crate::oracle::PriceOracle;
use crate::types::{round2, round8, Asset, Round, RoundState, TransactionKind, Wager};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events published by the engine and fanned out to every observer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    RoundStarted {
        round_id: String,
        hash: String,
        start_time: i64,
    },
    MultiplierTick {
        round_id: String,
        multiplier: f64,
        timestamp: i64,
    },
    RoundCrashed {
        round_id: String,
        crash_point: f64,
        seed: String,
        timestamp: i64,
    },
    WagerPlaced {
        round_id: String,
        player_id: String,
        stake_fiat: f64,
        stake_asset: f64,
        asset: Asset,
    },
    CashoutAccepted {
        round_id: String,
        player_id: String,
        multiplier: f64,
        payout_fiat: f64,
        asset: Asset,
    },
}

/// Acknowledgement returned on wager placement
#[derive(Debug, Clone, Serialize)]
pub struct WagerReceipt {
    pub wager_id: String,
    pub round_id: String,
    pub stake_fiat: f64,
    pub stake_asset: f64,
    pub asset: Asset,
    pub price: f64,
}

/// Settlement returned on a successful cash-out
#[derive(Debug, Clone, Serialize)]
pub struct CashoutReceipt {
    pub round_id: String,
    pub multiplier: f64,
    pub payout_fiat: f64,
    pub payout_asset: f64,
    pub asset: Asset,
}

/// Read-only view of the current round
#[derive(Debug, Clone, Serialize)]
pub struct RoundSnapshot {
    pub round_id: String,
    pub state: RoundState,
    pub multiplier: f64,
    pub is_live: bool,
    pub start_time: i64,
    pub wager_count: usize,
    pub hash: String,
}

/// The current round plus the live tick state that never leaves the engine
struct CurrentRound {
    round: Round,
    /// Last multiplier published; settlement uses this exact value
    multiplier: f64,
    live_start: Option<Instant>,
}

type SeedProvider = dyn Fn() -> String + Send + Sync;

pub struct RoundEngine {
    config: GameConfig,
    ledger: Arc<Ledger>,
    oracle: Arc<PriceOracle>,
    /// Coarse lock over the current round; held briefly for state reads and
    /// wager-list appends, never across an upstream fetch or observer send.
    current: Mutex<Option<CurrentRound>>,
    events: broadcast::Sender<GameEvent>,
    halted: AtomicBool,
    seed_provider: Box<SeedProvider>,
}

impl RoundEngine {
    /// The event channel capacity is the per-observer backpressure bound:
    /// an observer that falls further behind than `observer_queue_bound`
    /// pending events lags out and is dropped by the hub.
    pub fn new(
        config: GameConfig,
        hub_config: &HubConfig,
        ledger: Arc<Ledger>,
        oracle: Arc<PriceOracle>,
    ) -> Self {
        let (events, _) = broadcast::channel(hub_config.observer_queue_bound.max(1));
        Self {
            config,
            ledger,
            oracle,
            current: Mutex::new(None),
            events,
            halted: AtomicBool::new(false),
            seed_provider: Box::new(fairness::generate_seed),
        }
    }

    /// Replace the seed source, e.g. for deterministic replay
    pub fn with_seed_provider(
        mut self,
        provider: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.seed_provider = Box::new(provider);
        self
    }

    /// Subscribe to the engine's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.events.subscribe()
    }

    /// Whether the engine stopped after an infrastructure failure
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Spawn the round loop; it runs until shutdown is signalled or the
    /// engine halts on an infrastructure failure.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(shutdown).await;
        })
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            round_period_ms = self.config.round_period_ms,
            betting_window_ms = self.config.betting_window_ms,
            tick_ms = self.config.tick_ms,
            "Round engine starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let cycle_start = Instant::now();
            match self.run_round(&mut shutdown).await {
                Ok(()) => {}
                Err(e) => {
                    error!("Infrastructure failure, halting engine: {}", e);
                    self.halted.store(true, Ordering::SeqCst);
                    break;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            // Idle out the remainder of the period before the next round.
            let elapsed = cycle_start.elapsed();
            if let Some(remaining) = self.config.round_period().checked_sub(elapsed) {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("Round engine stopped");
    }

    /// One full round: betting window, live ticking, crash, settlement.
    ///
    /// Returns an error only for infrastructure failures that must halt the
    /// engine; everything else is logged and survived.
    async fn run_round(&self, shutdown: &mut watch::Receiver<bool>) -> CrashResult<()> {
        let number = self.ledger.next_round_number()?;
        let seed = (self.seed_provider)();
        let hash = fairness::commitment(&seed, number);
        let crash_point = fairness::derive_crash_point(&seed, number, self.config.max_crash);

        let round = Round {
            id: format!("round_{}", number),
            number,
            seed,
            hash: hash.clone(),
            crash_point,
            state: RoundState::Betting,
            start_time: Utc::now(),
            end_time: None,
            wagers: Vec::new(),
            peak_multiplier: 1.0,
        };
        let round_id = round.id.clone();
        let start_time = round.start_time.timestamp_millis();

        {
            let mut current = self.current.lock().await;
            *current = Some(CurrentRound {
                round,
                multiplier: 1.0,
                live_start: None,
            });
        }

        debug!(round = %round_id, crash_point, "Round opened for betting");
        self.publish(GameEvent::RoundStarted {
            round_id: round_id.clone(),
            hash,
            start_time,
        });

        // Betting window.
        tokio::select! {
            _ = tokio::time::sleep(self.config.betting_window()) => {}
            _ = shutdown.changed() => {
                return self.abort_round().await;
            }
        }

        // Go live.
        {
            let mut current = self.current.lock().await;
            if let Some(current) = current.as_mut() {
                current.round.state = RoundState::Live;
                current.live_start = Some(Instant::now());
            }
        }
        debug!(round = %round_id, "Round live");

        // Tick until the multiplier reaches the committed crash point.
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.advance_multiplier().await? {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    return self.abort_round().await;
                }
            }
        }

        self.settle_round().await
    }

    /// Advance the multiplier by one tick. Returns true once the round has
    /// crashed.
    async fn advance_multiplier(&self) -> CrashResult<bool> {
        let (event, crashed) = {
            let mut guard = self.current.lock().await;
            let Some(current) = guard.as_mut() else {
                return Ok(true);
            };
            if current.round.state != RoundState::Live {
                return Ok(true);
            }

            let elapsed = current
                .live_start
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            let crash_point = current.round.crash_point;

            // Growth calibrated so the live phase lasts on the order of
            // seconds regardless of the crash point: the curve reaches
            // crash_point after 2·ln(crash_point) seconds.
            let target_time = crash_point.ln() * 2.0;
            let multiplier = if target_time > f64::EPSILON {
                round2(1.0 + elapsed * (crash_point - 1.0) / target_time)
            } else {
                crash_point
            };

            if multiplier >= crash_point {
                current.round.state = RoundState::Crashed;
                current.round.peak_multiplier = crash_point;
                current.multiplier = crash_point;
                let event = GameEvent::RoundCrashed {
                    round_id: current.round.id.clone(),
                    crash_point,
                    seed: current.round.seed.clone(),
                    timestamp: Utc::now().timestamp_millis(),
                };
                (event, true)
            } else {
                current.multiplier = multiplier;
                current.round.peak_multiplier = multiplier;
                let event = GameEvent::MultiplierTick {
                    round_id: current.round.id.clone(),
                    multiplier,
                    timestamp: Utc::now().timestamp_millis(),
                };
                (event, false)
            }
        };

        self.publish(event);
        Ok(crashed)
    }

    /// Settle the crashed round: count losses, persist, mark settled.
    async fn settle_round(&self) -> CrashResult<()> {
        let (round_id, losers) = {
            let guard = self.current.lock().await;
            let Some(current) = guard.as_ref() else {
                return Ok(());
            };
            let losers: Vec<String> = current
                .round
                .wagers
                .iter()
                .filter(|w| !w.cashed_out)
                .map(|w| w.player_id.clone())
                .collect();
            (current.round.id.clone(), losers)
        };

        // Stakes were debited at placement; a loss only moves the counter.
        for player_id in &losers {
            if let Err(e) = self.ledger.record_loss(player_id).await {
                warn!(player = %player_id, "Failed to record loss: {}", e);
            }
        }

        let finalized = {
            let mut guard = self.current.lock().await;
            let Some(current) = guard.as_mut() else {
                return Ok(());
            };
            current.round.state = RoundState::Settled;
            current.round.end_time = Some(Utc::now());
            current.round.clone()
        };

        self.ledger.store_round(&finalized)?;
        info!(
            round = %round_id,
            crash_point = finalized.crash_point,
            wagers = finalized.wagers.len(),
            losers = losers.len(),
            "Round settled"
        );
        Ok(())
    }

    /// Shutdown path: crash immediately at the current multiplier, reveal
    /// the seed, settle open wagers as losses, persist.
    async fn abort_round(&self) -> CrashResult<()> {
        let event = {
            let mut guard = self.current.lock().await;
            let Some(current) = guard.as_mut() else {
                return Ok(());
            };
            if matches!(current.round.state, RoundState::Crashed | RoundState::Settled) {
                return Ok(());
            }

            current.round.state = RoundState::Crashed;
            warn!(
                round = %current.round.id,
                multiplier = current.multiplier,
                "Aborting round on shutdown"
            );
            GameEvent::RoundCrashed {
                round_id: current.round.id.clone(),
                crash_point: current.round.crash_point,
                seed: current.round.seed.clone(),
                timestamp: Utc::now().timestamp_millis(),
            }
        };

        self.publish(event);
        self.settle_round().await
    }

    // =========================================================================
    // Player-facing operations
    // =========================================================================

    /// Place a wager in the current betting window.
    ///
    /// The debit happens under the round lock so the wager list and the
    /// balance move together; a debit failure leaves the round untouched.
    pub async fn place_wager(
        &self,
        player_id: &str,
        stake_fiat: f64,
        asset: Asset,
    ) -> CrashResult<WagerReceipt> {
        if self.is_halted() {
            return Err(EngineError::Halted.into());
        }

        if !(self.config.min_stake_fiat..=self.config.max_stake_fiat).contains(&stake_fiat) {
            return Err(EngineError::StakeOutOfRange {
                stake: stake_fiat,
                min: self.config.min_stake_fiat,
                max: self.config.max_stake_fiat,
            }
            .into());
        }

        // Resolve the price before touching the round; a stale quote is
        // still a success.
        let price = self.oracle.price(asset).await;
        let stake_asset = round8(stake_fiat / price);

        let (receipt, event) = {
            let mut guard = self.current.lock().await;
            let current = guard
                .as_mut()
                .ok_or::<crate::errors::CrashError>(EngineError::BettingClosed.into())?;

            if current.round.state != RoundState::Betting {
                return Err(EngineError::BettingClosed.into());
            }
            if current.round.has_wager(player_id) {
                return Err(EngineError::DuplicateWager(player_id.to_string()).into());
            }

            self.ledger
                .debit(
                    player_id,
                    asset,
                    stake_asset,
                    TxContext {
                        round_id: current.round.id.clone(),
                        kind: TransactionKind::Wager,
                        fiat_amount: stake_fiat,
                        price,
                        multiplier: None,
                    },
                )
                .await?;

            let wager = Wager {
                player_id: player_id.to_string(),
                stake_fiat,
                stake_asset,
                asset,
                price_at_placement: price,
                cashed_out: false,
                cashout_multiplier: None,
                cashout_asset_amount: None,
                placed_at: Utc::now(),
            };
            current.round.wagers.push(wager);

            let receipt = WagerReceipt {
                wager_id: format!("{}:{}", current.round.id, player_id),
                round_id: current.round.id.clone(),
                stake_fiat,
                stake_asset,
                asset,
                price,
            };
            let event = GameEvent::WagerPlaced {
                round_id: current.round.id.clone(),
                player_id: player_id.to_string(),
                stake_fiat,
                stake_asset,
                asset,
            };
            (receipt, event)
        };

        debug!(player = player_id, stake_fiat, %asset, "Wager placed");
        self.publish(event);
        Ok(receipt)
    }

    /// Cash out the caller's open wager at the current multiplier.
    ///
    /// The multiplier is read atomically with the state check: if the round
    /// crashed before the lock was taken, the request is rejected.
    pub async fn cash_out(&self, player_id: &str) -> CrashResult<CashoutReceipt> {
        if self.is_halted() {
            return Err(EngineError::Halted.into());
        }

        let (receipt, event) = {
            let mut guard = self.current.lock().await;
            let current = guard
                .as_mut()
                .ok_or::<crate::errors::CrashError>(EngineError::RoundNotLive.into())?;

            if current.round.state != RoundState::Live {
                return Err(EngineError::RoundNotLive.into());
            }

            let multiplier = current.multiplier;
            let round_id = current.round.id.clone();
            let wager = current
                .round
                .wagers
                .iter_mut()
                .find(|w| w.player_id == player_id && !w.cashed_out)
                .ok_or::<crate::errors::CrashError>(
                    EngineError::NoOpenWager(player_id.to_string()).into(),
                )?;

            let payout_asset = round8(wager.stake_asset * multiplier);
            let payout_fiat = round2(wager.stake_fiat * multiplier);

            wager.cashed_out = true;
            wager.cashout_multiplier = Some(multiplier);
            wager.cashout_asset_amount = Some(payout_asset);

            let asset = wager.asset;
            let price = wager.price_at_placement;

            // The wager is marked before the credit lands; a failure here is
            // the inconsistency that startup reconciliation repairs.
            if let Err(e) = self
                .ledger
                .credit(
                    player_id,
                    asset,
                    payout_asset,
                    TxContext {
                        round_id: round_id.clone(),
                        kind: TransactionKind::Cashout,
                        fiat_amount: payout_fiat,
                        price,
                        multiplier: Some(multiplier),
                    },
                )
                .await
            {
                error!(
                    player = player_id,
                    round = %round_id,
                    "Cash-out credit failed after wager was marked: {}",
                    e
                );
                return Err(e);
            }

            let receipt = CashoutReceipt {
                round_id: round_id.clone(),
                multiplier,
                payout_fiat,
                payout_asset,
                asset,
            };
            let event = GameEvent::CashoutAccepted {
                round_id,
                player_id: player_id.to_string(),
                multiplier,
                payout_fiat,
                asset,
            };
            (receipt, event)
        };

        debug!(player = player_id, multiplier = receipt.multiplier, "Cash-out accepted");
        self.publish(event);
        Ok(receipt)
    }

    /// Snapshot of the current round for state queries
    pub async fn snapshot(&self) -> Option<RoundSnapshot> {
        let guard = self.current.lock().await;
        guard.as_ref().map(|current| RoundSnapshot {
            round_id: current.round.id.clone(),
            state: current.round.state,
            multiplier: current.multiplier,
            is_live: current.round.state == RoundState::Live,
            start_time: current.round.start_time.timestamp_millis(),
            wager_count: current.round.wagers.len(),
            hash: current.round.hash.clone(),
        })
    }

    /// Send failures only mean nobody is listening; the loop never stalls.
    fn publish(&self, event: GameEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("No observers for engine event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GameConfig, HubConfig};
    use crate::errors::{CrashError, LedgerError};
    use crate::oracle::{PriceQuote, PriceSource};
    use crate::storage::Store;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct FixedSource;

    #[async_trait]
    impl PriceSource for FixedSource {
        async fn fetch(
            &self,
            assets: &[Asset],
        ) -> Result<HashMap<Asset, PriceQuote>, crate::errors::OracleError> {
            Ok(assets
                .iter()
                .map(|a| {
                    let price = match a {
                        Asset::Btc => 50_000.0,
                        Asset::Eth => 2_500.0,
                    };
                    (*a, PriceQuote { price, upstream_timestamp: None })
                })
                .collect())
        }
    }

    // Crash points for these seeds at round number 1: MID ≈ 3.06, LOW ≈ 1.13.
    const MID_SEED: &str =
        "seed000000seed000000seed000000seed000000seed000000seed000000seed000000seed000000";
    const LOW_SEED: &str =
        "seed000055seed000055seed000055seed000055seed000055seed000055seed000055seed000055";

    fn fast_config() -> GameConfig {
        GameConfig {
            round_period_ms: 30_000,
            betting_window_ms: 200,
            tick_ms: 20,
            max_crash: 120.0,
            min_stake_fiat: 0.01,
            max_stake_fiat: 10_000.0,
        }
    }

    fn build_engine(config: GameConfig) -> (tempfile::TempDir, Arc<RoundEngine>, Arc<Ledger>) {
        build_engine_with_seed(config, None)
    }

    fn build_engine_with_seed(
        config: GameConfig,
        seed: Option<&'static str>,
    ) -> (tempfile::TempDir, Arc<RoundEngine>, Arc<Ledger>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let oracle = Arc::new(PriceOracle::new(
            Arc::new(FixedSource),
            Duration::from_secs(60),
        ));
        let ledger = Arc::new(Ledger::open(store, oracle.clone()).unwrap());
        let mut engine = RoundEngine::new(config, &HubConfig::default(), ledger.clone(), oracle);
        if let Some(seed) = seed {
            engine = engine.with_seed_provider(move || seed.to_string());
        }
        (dir, Arc::new(engine), ledger)
    }

    async fn wait_for_state(engine: &RoundEngine, state: RoundState) -> RoundSnapshot {
        for _ in 0..500 {
            if let Some(snapshot) = engine.snapshot().await {
                if snapshot.state == state {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Round never reached state {:?}", state);
    }

    #[tokio::test]
    async fn test_wager_rejected_before_first_round() {
        let (_dir, engine, ledger) = build_engine(fast_config());
        ledger
            .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
            .unwrap();

        let result = engine.place_wager("alice", 100.0, Asset::Btc).await;
        assert!(matches!(
            result,
            Err(CrashError::Engine(EngineError::BettingClosed))
        ));
    }

    #[tokio::test]
    async fn test_stake_bounds_enforced() {
        let (_dir, engine, _ledger) = build_engine(fast_config());

        for stake in [0.0, -5.0, 0.001, 10_001.0] {
            let result = engine.place_wager("alice", stake, Asset::Btc).await;
            assert!(
                matches!(result, Err(CrashError::Engine(EngineError::StakeOutOfRange { .. }))),
                "stake {} accepted",
                stake
            );
        }
    }

    #[tokio::test]
    async fn test_wager_debits_and_rejects_duplicates() {
        let (_dir, engine, ledger) = build_engine(fast_config());
        ledger
            .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
            .unwrap();

        let (tx, _rx) = watch::channel(false);
        let handle = engine.spawn(tx.subscribe());

        wait_for_state(&engine, RoundState::Betting).await;
        let receipt = engine.place_wager("alice", 100.0, Asset::Btc).await.unwrap();
        assert!((receipt.stake_asset - 0.002).abs() < 1e-9);
        assert!((ledger.player("alice").unwrap().balance(Asset::Btc) - 0.998).abs() < 1e-9);

        let duplicate = engine.place_wager("alice", 50.0, Asset::Btc).await;
        assert!(matches!(
            duplicate,
            Err(CrashError::Engine(EngineError::DuplicateWager(_)))
        ));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_round_untouched() {
        let (_dir, engine, ledger) = build_engine(fast_config());
        ledger.create_player("bob", "Bobby", HashMap::new()).unwrap();

        let (tx, _rx) = watch::channel(false);
        let handle = engine.spawn(tx.subscribe());
        let mut events = engine.subscribe();

        wait_for_state(&engine, RoundState::Betting).await;
        let result = engine.place_wager("bob", 10.0, Asset::Btc).await;
        assert!(matches!(
            result,
            Err(CrashError::Ledger(LedgerError::InsufficientBalance { .. }))
        ));

        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.wager_count, 0);
        assert!(ledger.all_transactions("bob").unwrap().is_empty());

        // No wager event was published, only lifecycle events.
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, GameEvent::WagerPlaced { .. }));
        }

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cash_out_requires_live_round() {
        let (_dir, engine, ledger) = build_engine(fast_config());
        ledger
            .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
            .unwrap();

        let (tx, _rx) = watch::channel(false);
        let handle = engine.spawn(tx.subscribe());

        wait_for_state(&engine, RoundState::Betting).await;
        let too_early = engine.cash_out("alice").await;
        assert!(matches!(
            too_early,
            Err(CrashError::Engine(EngineError::RoundNotLive))
        ));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cash_out_without_wager_rejected() {
        let (_dir, engine, ledger) = build_engine_with_seed(fast_config(), Some(MID_SEED));
        ledger
            .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
            .unwrap();

        let (tx, _rx) = watch::channel(false);
        let handle = engine.spawn(tx.subscribe());

        wait_for_state(&engine, RoundState::Live).await;
        let result = engine.cash_out("alice").await;
        assert!(matches!(
            result,
            Err(CrashError::Engine(EngineError::NoOpenWager(_)))
        ));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_round_cashout_and_loss() {
        let (_dir, engine, ledger) = build_engine_with_seed(fast_config(), Some(MID_SEED));
        ledger
            .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
            .unwrap();
        ledger
            .create_player("bob", "Bobby", HashMap::from([(Asset::Btc, 1.0)]))
            .unwrap();

        let mut events = engine.subscribe();
        let (tx, _rx) = watch::channel(false);
        let handle = engine.spawn(tx.subscribe());

        wait_for_state(&engine, RoundState::Betting).await;
        engine.place_wager("alice", 100.0, Asset::Btc).await.unwrap();
        engine.place_wager("bob", 100.0, Asset::Btc).await.unwrap();

        wait_for_state(&engine, RoundState::Live).await;
        // A couple of ticks in, still well before the ~3x crash.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let receipt = engine.cash_out("alice").await.unwrap();
        assert!(receipt.multiplier >= 1.0);
        assert!(receipt.multiplier < 3.06);
        assert!((receipt.payout_asset - round8(0.002 * receipt.multiplier)).abs() < 1e-9);

        wait_for_state(&engine, RoundState::Settled).await;

        // Alice was credited, bob's stake stays consumed.
        let alice = ledger.player("alice").unwrap();
        assert!((alice.balance(Asset::Btc) - (0.998 + receipt.payout_asset)).abs() < 1e-9);
        assert_eq!(alice.wins, 1);

        let bob = ledger.player("bob").unwrap();
        assert!((bob.balance(Asset::Btc) - 0.998).abs() < 1e-9);
        assert_eq!(bob.losses, 1);

        // The persisted round carries both wagers and the cash-out marks.
        let round = ledger.round_by_id("round_1").unwrap();
        assert_eq!(round.state, RoundState::Settled);
        assert_eq!(round.wagers.len(), 2);
        assert_eq!(round.crash_point, 3.06);
        let alice_wager = round.wagers.iter().find(|w| w.player_id == "alice").unwrap();
        assert!(alice_wager.cashed_out);
        assert_eq!(alice_wager.cashout_multiplier, Some(receipt.multiplier));

        // Event order: started, wager x2, ticks (non-decreasing), cash-out,
        // crash with the revealed seed.
        let mut saw_started = false;
        let mut saw_cashout = false;
        let mut last_tick = 0.0_f64;
        let mut crashed: Option<(f64, String)> = None;
        while let Ok(event) = events.try_recv() {
            match event {
                GameEvent::RoundStarted { .. } => saw_started = true,
                GameEvent::MultiplierTick { multiplier, .. } => {
                    assert!(multiplier >= last_tick);
                    assert!(multiplier < 3.06);
                    last_tick = multiplier;
                }
                GameEvent::CashoutAccepted { multiplier, .. } => {
                    assert!(crashed.is_none());
                    assert_eq!(multiplier, receipt.multiplier);
                    saw_cashout = true;
                }
                GameEvent::RoundCrashed { crash_point, seed, .. } => {
                    crashed = Some((crash_point, seed));
                }
                GameEvent::WagerPlaced { .. } => assert!(!saw_cashout),
            }
        }
        assert!(saw_started);
        assert!(saw_cashout);
        let (crash_point, seed) = crashed.expect("round never crashed");
        assert_eq!(crash_point, 3.06);
        assert_eq!(seed, MID_SEED);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fast_crash_settles_losses() {
        let (_dir, engine, ledger) = build_engine_with_seed(fast_config(), Some(LOW_SEED));
        ledger
            .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
            .unwrap();

        let (tx, _rx) = watch::channel(false);
        let handle = engine.spawn(tx.subscribe());

        wait_for_state(&engine, RoundState::Betting).await;
        engine.place_wager("alice", 100.0, Asset::Btc).await.unwrap();

        wait_for_state(&engine, RoundState::Settled).await;
        let alice = ledger.player("alice").unwrap();
        assert!((alice.balance(Asset::Btc) - 0.998).abs() < 1e-9);
        assert_eq!(alice.losses, 1);
        assert_eq!(alice.wins, 0);

        // Only the wager transaction exists.
        let log = ledger.all_transactions("alice").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, TransactionKind::Wager);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_reports_round_shape() {
        let (_dir, engine, _ledger) = build_engine(fast_config());

        let (tx, _rx) = watch::channel(false);
        let handle = engine.spawn(tx.subscribe());

        let snapshot = wait_for_state(&engine, RoundState::Betting).await;
        assert!(snapshot.round_id.starts_with("round_"));
        assert_eq!(snapshot.multiplier, 1.0);
        assert!(!snapshot.is_live);
        assert_eq!(snapshot.hash.len(), 64);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
