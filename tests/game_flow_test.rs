//! End-to-end round scenarios against the in-process service stack
//!
//! Builds the real store, ledger, oracle, and engine (no HTTP layer) and
//! drives complete rounds with deterministic seeds.

use async_trait::async_trait;
use crashpoint::config::{GameConfig, HubConfig};
use crashpoint::engine::{GameEvent, RoundEngine};
use crashpoint::errors::{CrashError, EngineError, LedgerError, OracleError};
use crashpoint::fairness;
use crashpoint::ledger::Ledger;
use crashpoint::oracle::{PriceOracle, PriceQuote, PriceSource};
use crashpoint::storage::Store;
use crashpoint::types::{Asset, RoundState, TransactionKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Crash point at round number 1: ≈ 3.06
const MID_SEED: &str =
    "seed000000seed000000seed000000seed000000seed000000seed000000seed000000seed000000";
/// Crash point at round number 1: ≈ 1.13
const LOW_SEED: &str =
    "seed000055seed000055seed000055seed000055seed000055seed000055seed000055seed000055";

struct FixedSource {
    calls: AtomicUsize,
    delay: Duration,
}

impl FixedSource {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl PriceSource for FixedSource {
    async fn fetch(&self, assets: &[Asset]) -> Result<HashMap<Asset, PriceQuote>, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
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

struct TestStack {
    _dir: tempfile::TempDir,
    engine: Arc<RoundEngine>,
    ledger: Arc<Ledger>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

fn fast_config() -> GameConfig {
    GameConfig {
        round_period_ms: 60_000,
        betting_window_ms: 200,
        tick_ms: 20,
        max_crash: 120.0,
        min_stake_fiat: 0.01,
        max_stake_fiat: 10_000.0,
    }
}

/// Spin up the full stack with a deterministic seed and start the engine
fn start_stack(seed: &'static str) -> TestStack {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let oracle = Arc::new(PriceOracle::new(
        Arc::new(FixedSource::new()),
        Duration::from_secs(60),
    ));
    let ledger = Arc::new(Ledger::open(store, oracle.clone()).unwrap());
    let engine = Arc::new(
        RoundEngine::new(fast_config(), &HubConfig::default(), ledger.clone(), oracle)
            .with_seed_provider(move || seed.to_string()),
    );

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = engine.spawn(shutdown_rx);

    TestStack {
        _dir: dir,
        engine,
        ledger,
        shutdown,
        handle,
    }
}

async fn wait_for_state(engine: &RoundEngine, state: RoundState) {
    for _ in 0..1000 {
        if let Some(snapshot) = engine.snapshot().await {
            if snapshot.state == state {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Round never reached state {:?}", state);
}

async fn stop(stack: TestStack) {
    stack.shutdown.send(true).unwrap();
    stack.handle.await.unwrap();
}

#[tokio::test]
async fn happy_cashout_credits_player_and_logs_both_transactions() {
    let stack = start_stack(MID_SEED);
    stack
        .ledger
        .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
        .unwrap();

    let mut events = stack.engine.subscribe();

    wait_for_state(&stack.engine, RoundState::Betting).await;
    let wager = stack
        .engine
        .place_wager("alice", 100.0, Asset::Btc)
        .await
        .unwrap();
    assert!((wager.stake_asset - 0.002).abs() < 1e-12);

    wait_for_state(&stack.engine, RoundState::Live).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    let cashout = stack.engine.cash_out("alice").await.unwrap();

    assert!(cashout.multiplier >= 1.0 && cashout.multiplier < 3.06);
    let expected_payout = cashout.multiplier * 0.002;
    assert!((cashout.payout_asset - expected_payout).abs() < 1e-8);

    wait_for_state(&stack.engine, RoundState::Settled).await;

    // Balance: 1.0 - 0.002 + payout.
    let alice = stack.ledger.player("alice").unwrap();
    assert!((alice.balance(Asset::Btc) - (0.998 + cashout.payout_asset)).abs() < 1e-9);
    assert_eq!(alice.wins, 1);
    assert_eq!(alice.losses, 0);

    // Exactly one wager and one cashout transaction.
    let log = stack.ledger.all_transactions("alice").unwrap();
    let kinds: Vec<TransactionKind> = log.iter().map(|tx| tx.kind).collect();
    assert_eq!(kinds.len(), 2);
    assert!(kinds.contains(&TransactionKind::Wager));
    assert!(kinds.contains(&TransactionKind::Cashout));

    // The crash event reveals the committed seed and crash point.
    let mut revealed = None;
    while let Ok(event) = events.try_recv() {
        if let GameEvent::RoundCrashed { seed, crash_point, .. } = event {
            revealed = Some((seed, crash_point));
        }
    }
    let (seed, crash_point) = revealed.expect("no crash event");
    assert_eq!(seed, MID_SEED);
    assert_eq!(crash_point, 3.06);

    stop(stack).await;
}

#[tokio::test]
async fn loss_on_crash_keeps_stake_debited() {
    let stack = start_stack(LOW_SEED);
    stack
        .ledger
        .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
        .unwrap();

    wait_for_state(&stack.engine, RoundState::Betting).await;
    stack
        .engine
        .place_wager("alice", 100.0, Asset::Btc)
        .await
        .unwrap();

    wait_for_state(&stack.engine, RoundState::Settled).await;

    let alice = stack.ledger.player("alice").unwrap();
    assert!((alice.balance(Asset::Btc) - 0.998).abs() < 1e-9);
    assert_eq!(alice.losses, 1);

    // No cashout transaction was written.
    let log = stack.ledger.all_transactions("alice").unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, TransactionKind::Wager);

    stop(stack).await;
}

#[tokio::test]
async fn insufficient_balance_rejects_without_side_effects() {
    let stack = start_stack(MID_SEED);
    stack
        .ledger
        .create_player("bob", "Bobby", HashMap::new())
        .unwrap();

    let mut events = stack.engine.subscribe();

    wait_for_state(&stack.engine, RoundState::Betting).await;
    let result = stack.engine.place_wager("bob", 10.0, Asset::Btc).await;
    assert!(matches!(
        result,
        Err(CrashError::Ledger(LedgerError::InsufficientBalance { .. }))
    ));

    let snapshot = stack.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.wager_count, 0);
    assert!(stack.ledger.all_transactions("bob").unwrap().is_empty());

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, GameEvent::WagerPlaced { .. }));
    }

    stop(stack).await;
}

#[tokio::test]
async fn late_cashout_after_crash_is_rejected() {
    let stack = start_stack(LOW_SEED);
    stack
        .ledger
        .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
        .unwrap();

    wait_for_state(&stack.engine, RoundState::Betting).await;
    stack
        .engine
        .place_wager("alice", 100.0, Asset::Btc)
        .await
        .unwrap();

    // Let the 1.13x round crash, then try to cash out.
    wait_for_state(&stack.engine, RoundState::Settled).await;
    let result = stack.engine.cash_out("alice").await;
    assert!(matches!(
        result,
        Err(CrashError::Engine(EngineError::RoundNotLive))
    ));

    // No credit happened and the wager stayed open in the persisted round.
    let alice = stack.ledger.player("alice").unwrap();
    assert!((alice.balance(Asset::Btc) - 0.998).abs() < 1e-9);

    let round = stack.ledger.round_by_id("round_1").unwrap();
    assert!(!round.wagers[0].cashed_out);

    stop(stack).await;
}

#[tokio::test]
async fn concurrent_price_lookups_share_one_upstream_request() {
    let source = Arc::new({
        let mut s = FixedSource::new();
        s.delay = Duration::from_millis(50);
        s
    });
    let oracle = Arc::new(PriceOracle::new(source.clone(), Duration::from_secs(60)));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let oracle = oracle.clone();
        handles.push(tokio::spawn(async move { oracle.price(Asset::Btc).await }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 50_000.0);
    }
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persisted_round_verifies_and_rejects_tampered_seed() {
    let stack = start_stack(MID_SEED);

    wait_for_state(&stack.engine, RoundState::Settled).await;
    let round = stack.ledger.round_by_id("round_1").unwrap();

    // The committed hash matches the revealed seed.
    assert_eq!(fairness::commitment(&round.seed, round.number), round.hash);
    assert!(fairness::verify_crash_point(
        &round.seed,
        round.number,
        round.crash_point,
        120.0
    ));

    // A single flipped character must not verify.
    let mut tampered = round.seed.clone().into_bytes();
    tampered[0] = if tampered[0] == b'x' { b'y' } else { b'x' };
    let tampered = String::from_utf8(tampered).unwrap();
    assert_ne!(fairness::commitment(&tampered, round.number), round.hash);

    stop(stack).await;
}

#[tokio::test]
async fn observer_sees_started_ticks_then_crash_in_order() {
    // Attach the observer before the engine starts so the very first
    // round_started frame is captured.
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let oracle = Arc::new(PriceOracle::new(
        Arc::new(FixedSource::new()),
        Duration::from_secs(60),
    ));
    let ledger = Arc::new(Ledger::open(store, oracle.clone()).unwrap());
    let engine = Arc::new(
        RoundEngine::new(fast_config(), &HubConfig::default(), ledger.clone(), oracle)
            .with_seed_provider(|| MID_SEED.to_string()),
    );
    let mut events = engine.subscribe();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = engine.spawn(shutdown_rx);
    wait_for_state(&engine, RoundState::Settled).await;

    let mut saw_started_for: Option<String> = None;
    let mut last_multiplier = 0.0_f64;
    let mut tick_count = 0;
    let mut crashed = false;

    while let Ok(event) = events.try_recv() {
        match event {
            GameEvent::RoundStarted { round_id, hash, .. } => {
                assert!(saw_started_for.is_none());
                assert_eq!(hash.len(), 64);
                saw_started_for = Some(round_id);
            }
            GameEvent::MultiplierTick { round_id, multiplier, .. } => {
                assert_eq!(Some(&round_id), saw_started_for.as_ref());
                assert!(!crashed, "tick after crash");
                assert!(multiplier >= last_multiplier, "multiplier regressed");
                assert!(multiplier < 3.06, "tick at or above the crash point");
                last_multiplier = multiplier;
                tick_count += 1;
            }
            GameEvent::RoundCrashed { round_id, crash_point, .. } => {
                assert_eq!(Some(&round_id), saw_started_for.as_ref());
                assert_eq!(crash_point, 3.06);
                crashed = true;
            }
            _ => {}
        }
        if crashed {
            break;
        }
    }

    assert!(saw_started_for.is_some());
    assert!(tick_count > 0, "no multiplier ticks observed");
    assert!(crashed, "no crash event observed");

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    // Phase 1: run one full round with a wager, then shut down.
    {
        let store = Store::open(dir.path()).unwrap();
        let oracle = Arc::new(PriceOracle::new(
            Arc::new(FixedSource::new()),
            Duration::from_secs(60),
        ));
        let ledger = Arc::new(Ledger::open(store, oracle.clone()).unwrap());
        ledger
            .create_player("alice", "Alice", HashMap::from([(Asset::Btc, 1.0)]))
            .unwrap();

        let engine = Arc::new(
            RoundEngine::new(fast_config(), &HubConfig::default(), ledger.clone(), oracle)
                .with_seed_provider(|| LOW_SEED.to_string()),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = engine.spawn(shutdown_rx);

        wait_for_state(&engine, RoundState::Betting).await;
        engine.place_wager("alice", 100.0, Asset::Btc).await.unwrap();
        wait_for_state(&engine, RoundState::Settled).await;

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    // Give the database a moment to release its lock.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Phase 2: reopen the same directory and verify everything persisted.
    {
        let store = Store::open(dir.path()).unwrap();
        let oracle = Arc::new(PriceOracle::new(
            Arc::new(FixedSource::new()),
            Duration::from_secs(60),
        ));
        let ledger = Ledger::open(store, oracle).unwrap();

        let alice = ledger.player("alice").unwrap();
        assert!((alice.balance(Asset::Btc) - 0.998).abs() < 1e-9);
        assert_eq!(alice.losses, 1);

        let round = ledger.round_by_id("round_1").unwrap();
        assert_eq!(round.state, RoundState::Settled);
        assert_eq!(round.wagers.len(), 1);

        // Round numbers continue rather than restart.
        assert_eq!(ledger.next_round_number().unwrap(), 2);
    }
}

#[tokio::test]
async fn round_commitment_binds_round_number() {
    let stack = start_stack(MID_SEED);

    wait_for_state(&stack.engine, RoundState::Settled).await;
    let first = stack.engine.snapshot().await.unwrap();
    assert_eq!(first.round_id, "round_1");

    // The commitment for round 2 differs even with the same seed string.
    let round = stack.ledger.round_by_id("round_1").unwrap();
    assert_ne!(
        fairness::commitment(MID_SEED, 1),
        fairness::commitment(MID_SEED, 2)
    );
    assert_eq!(round.hash, fairness::commitment(MID_SEED, 1));

    stop(stack).await;
}
