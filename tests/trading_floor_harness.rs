//! End-to-end trading floor test harness
//!
//! Drives full cycles through the real ledger, storage and coordinator
//! with mock prices, market status and decision engines:
//! schedule gate → valuation → context → decision → execution → persistence


use std::sync::Arc;
use std::time::Duration;

use mock_market::{
    MockMarketStatus, MockPriceBook, PanickingEngine, ScriptedEngine, SlowEngine, StaticContext,
};
use rust_decimal::Decimal;
use trading_floor::decision::DecisionEngine;
use trading_floor::floor::{FloorOptions, TradingFloor};
use trading_floor::market::{MarketContextSource, MarketStatusSource};
use trading_floor::schedule::Cadence;
use trading_floor::storage::SqliteStorage;
use trading_floor::{Ledger, Storage, TraderProfile};

fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

fn profile(name: &str) -> TraderProfile {
    TraderProfile {
        name: name.to_string(),
        strategy: format!("{name} test strategy"),
        cadence: Cadence::DailyClose,
        // Never satisfied, so the portfolio-building override keeps the
        // trader active no matter when the test runs
        portfolio_target: 100,
    }
}

struct Harness {
    floor: Arc<TradingFloor>,
    ledger: Arc<Ledger>,
    storage: Arc<dyn Storage>,
    context: Arc<StaticContext>,
    engine: Arc<ScriptedEngine>,
}

async fn harness_at(database_url: &str, traders: Vec<TraderProfile>) -> Harness {
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::connect(database_url)
            .await
            .expect("sqlite connect"),
    );
    storage.init_schema().await.expect("schema");

    let prices = Arc::new(MockPriceBook::new());
    prices.set("AAPL", dec("200"));
    prices.set("MSFT", dec("100"));

    let ledger = Arc::new(Ledger::new(
        storage.clone(),
        prices.clone(),
        dec("10000.00"),
        dec("0.002"),
    ));
    let context = Arc::new(StaticContext::new());
    let engine = Arc::new(ScriptedEngine::new());

    let floor = TradingFloor::new(
        ledger.clone(),
        prices,
        context.clone(),
        Arc::new(MockMarketStatus { open: true }),
        engine.clone(),
        FloorOptions {
            traders,
            force_market_open: true,
            run_when_closed: false,
            decision_timeout: Duration::from_secs(5),
            cycle_interval: Duration::from_secs(600),
            max_cycle_retries: 3,
            retry_backoff: Duration::from_millis(10),
        },
    );

    Harness {
        floor,
        ledger,
        storage,
        context,
        engine,
    }
}

async fn harness(traders: Vec<TraderProfile>) -> Harness {
    harness_at("sqlite::memory:", traders).await
}

fn rebuild_floor(
    h: &Harness,
    status: Arc<dyn MarketStatusSource>,
    engine: Arc<dyn DecisionEngine>,
    force_market_open: bool,
    decision_timeout: Duration,
    traders: Vec<TraderProfile>,
) -> Arc<TradingFloor> {
    let prices = Arc::new(MockPriceBook::new());
    prices.set("AAPL", dec("200"));
    TradingFloor::new(
        h.ledger.clone(),
        prices,
        h.context.clone() as Arc<dyn MarketContextSource>,
        status,
        engine,
        FloorOptions {
            traders,
            force_market_open,
            run_when_closed: false,
            decision_timeout,
            cycle_interval: Duration::from_secs(600),
            max_cycle_retries: 3,
            retry_backoff: Duration::from_millis(10),
        },
    )
}

#[tokio::test]
async fn buy_decision_executes_and_persists() {
    let h = harness(vec![profile("warren")]).await;
    h.engine.script(
        "warren",
        r#"{"decision": "BUY", "symbol": "AAPL", "quantity": 5, "rationale": "cheap"}"#,
    );

    let report = h.floor.run_cycle().await;
    assert!(report.market_open);
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.outcomes[0].line.contains("Bought 5 shares of AAPL"));

    // 5 * 200 * 1.002 = 1002.00 out of 10,000.00
    let account = h.storage.load_account("warren").await.unwrap().unwrap();
    assert_eq!(account.balance, dec("8998.00"));
    assert_eq!(account.holdings.get("AAPL"), Some(&5));
    assert_eq!(account.transactions.len(), 1);
    assert_eq!(account.transactions[0].rationale, "cheap");
}

#[tokio::test]
async fn oversized_buy_is_clamped_to_affordable() {
    let h = harness(vec![profile("warren")]).await;
    // 10,000.00 / 200.40 = 49.9 -> 49 shares at most
    h.engine.script(
        "warren",
        r#"{"decision": "BUY", "symbol": "AAPL", "quantity": 1000, "rationale": "all in"}"#,
    );

    let report = h.floor.run_cycle().await;
    assert!(report.outcomes[0].line.contains("Bought 49 shares of AAPL"));

    let account = h.storage.load_account("warren").await.unwrap().unwrap();
    assert_eq!(account.holdings.get("AAPL"), Some(&49));
    // 49 * 200.40 = 9819.60
    assert_eq!(account.balance, dec("180.40"));
}

#[tokio::test]
async fn oversell_is_rejected_without_effect() {
    let h = harness(vec![profile("warren")]).await;
    h.engine.script(
        "warren",
        r#"{"decision": "SELL", "symbol": "AAPL", "quantity": 5, "rationale": "take profit"}"#,
    );

    let report = h.floor.run_cycle().await;
    assert!(report.outcomes[0].line.contains("rejected"));

    let account = h.storage.load_account("warren").await.unwrap().unwrap();
    assert_eq!(account.balance, dec("10000.00"));
    assert!(account.holdings.is_empty());
    assert!(account.transactions.is_empty());
}

#[tokio::test]
async fn malformed_decision_degrades_to_hold() {
    let h = harness(vec![profile("warren")]).await;
    h.engine
        .script("warren", "The market feels uncertain, I would rather wait.");

    let report = h.floor.run_cycle().await;
    assert!(report.outcomes[0].line.contains("holding"));
    assert!(report.outcomes[0]
        .line
        .contains("The market feels uncertain"));

    let account = h.storage.load_account("warren").await.unwrap().unwrap();
    assert!(account.transactions.is_empty());
}

#[tokio::test]
async fn unaffordable_symbol_becomes_a_hold() {
    let h = harness(vec![profile("warren")]).await;
    h.engine.script(
        "warren",
        r#"{"decision": "BUY", "symbol": "BRK.A", "quantity": 1, "rationale": "quality"}"#,
    );

    let report = h.floor.run_cycle().await;
    // BRK.A is not in the price book at all
    assert!(report.outcomes[0].line.contains("no price for BRK.A"));
}

#[tokio::test]
async fn trader_failures_are_isolated() {
    let h = harness(vec![profile("crash"), profile("warren")]).await;
    let floor = rebuild_floor(
        &h,
        Arc::new(MockMarketStatus { open: true }),
        Arc::new(PanickingEngine {
            victim: "crash".to_string(),
        }),
        true,
        Duration::from_secs(5),
        vec![profile("crash"), profile("warren")],
    );

    let report = floor.run_cycle().await;
    assert_eq!(report.outcomes.len(), 2);

    let crash = report.outcomes.iter().find(|o| o.trader == "crash").unwrap();
    assert!(crash.line.contains("crashed"));

    let warren = report.outcomes.iter().find(|o| o.trader == "warren").unwrap();
    assert!(warren.line.contains("holding"));
}

#[tokio::test]
async fn slow_engine_times_out_to_hold() {
    let h = harness(vec![profile("warren")]).await;
    let floor = rebuild_floor(
        &h,
        Arc::new(MockMarketStatus { open: true }),
        Arc::new(SlowEngine {
            delay: Duration::from_secs(30),
        }),
        true,
        Duration::from_millis(50),
        vec![profile("warren")],
    );

    let report = floor.run_cycle().await;
    assert!(report.outcomes[0].line.contains("decision timed out"));
}

#[tokio::test]
async fn closed_market_skips_the_whole_cycle() {
    let h = harness(vec![profile("warren")]).await;
    let floor = rebuild_floor(
        &h,
        Arc::new(MockMarketStatus { open: false }),
        h.engine.clone() as Arc<dyn DecisionEngine>,
        false,
        Duration::from_secs(5),
        vec![profile("warren")],
    );

    let report = floor.run_cycle().await;
    assert!(!report.market_open);
    assert!(report.outcomes.is_empty());
    assert_eq!(h.engine.call_count(), 0);

    // The open/closed verdict is still pushed to the context source
    assert_eq!(h.context.noted_states.lock().unwrap().as_slice(), &[false]);
}

#[tokio::test]
async fn valuation_is_sampled_every_cycle() {
    let h = harness(vec![profile("warren")]).await;
    h.floor.run_cycle().await;

    let account = h.storage.load_account("warren").await.unwrap().unwrap();
    assert!(!account.portfolio_history.is_empty());
}

#[tokio::test]
async fn strategy_from_config_lands_on_the_account() {
    let h = harness(vec![profile("warren")]).await;
    h.floor.run_cycle().await;

    let account = h.storage.load_account("warren").await.unwrap().unwrap();
    assert_eq!(account.strategy, "warren test strategy");
}

#[tokio::test]
async fn accounts_survive_a_floor_restart() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}", file.path().display());

    {
        let h = harness_at(&url, vec![profile("warren")]).await;
        h.engine.script(
            "warren",
            r#"{"decision": "BUY", "symbol": "MSFT", "quantity": 10, "rationale": "hold me"}"#,
        );
        let report = h.floor.run_cycle().await;
        assert!(report.outcomes[0].line.contains("Bought 10 shares of MSFT"));
    }

    // A brand new floor over the same database sees the same book
    let h = harness_at(&url, vec![profile("warren")]).await;
    let account = h.storage.load_account("warren").await.unwrap().unwrap();
    assert_eq!(account.holdings.get("MSFT"), Some(&10));
    // 10 * 100 * 1.002 = 1002.00
    assert_eq!(account.balance, dec("8998.00"));
    assert_eq!(account.transactions.len(), 1);
}
