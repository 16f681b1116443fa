//! The trading floor coordinator
//!
//! One cycle: gate on the market, sample every trader's valuation, then
//! let each trader that is inside a trading window (or still building its
//! portfolio) gather context, ask its decision engine and execute the
//! result. Traders run as independent tasks; one trader's failure - bad
//! decision, dead upstream, even a panic - never touches the others.
//!
//! `run` wraps the cycle loop in a supervisor that restarts it after
//! transient failures, with a bounded retry count so a persistent fault
//! eventually surfaces instead of looping forever.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use serde_json::json;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::account::{Account, Ledger};
use crate::config::{Settings, TraderProfile};
use crate::decision::{parse_decision, DecisionEngine, TradeDecision};
use crate::market::{MarketContextSource, MarketStatusSource, PriceSource};
use crate::schedule::{
    eastern_now, is_market_open, needs_portfolio_building, should_rebalance_now, should_trade_now,
    TraderSchedule,
};

/// One trader's one-line cycle outcome, for logs and assertions
#[derive(Debug)]
pub struct TraderOutcome {
    pub trader: String,
    pub line: String,
}

#[derive(Debug)]
pub struct CycleReport {
    pub market_open: bool,
    pub outcomes: Vec<TraderOutcome>,
}

/// Coordinator tunables, lifted from `Settings`
#[derive(Debug, Clone)]
pub struct FloorOptions {
    pub traders: Vec<TraderProfile>,
    pub force_market_open: bool,
    pub run_when_closed: bool,
    pub decision_timeout: Duration,
    pub cycle_interval: Duration,
    pub max_cycle_retries: u32,
    pub retry_backoff: Duration,
}

impl From<&Settings> for FloorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            traders: settings.traders.clone(),
            force_market_open: settings.force_market_open,
            run_when_closed: settings.run_when_closed,
            decision_timeout: settings.decision_timeout(),
            cycle_interval: settings.cycle_interval(),
            max_cycle_retries: settings.max_cycle_retries,
            retry_backoff: settings.retry_backoff(),
        }
    }
}

pub struct TradingFloor {
    ledger: Arc<Ledger>,
    prices: Arc<dyn PriceSource>,
    context: Arc<dyn MarketContextSource>,
    status: Arc<dyn MarketStatusSource>,
    engine: Arc<dyn DecisionEngine>,
    options: FloorOptions,
}

impl TradingFloor {
    pub fn new(
        ledger: Arc<Ledger>,
        prices: Arc<dyn PriceSource>,
        context: Arc<dyn MarketContextSource>,
        status: Arc<dyn MarketStatusSource>,
        engine: Arc<dyn DecisionEngine>,
        options: FloorOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            prices,
            context,
            status,
            engine,
            options,
        })
    }

    /// Supervisor entry point: runs the cycle loop, restarting it after a
    /// failure or panic until the retry budget is exhausted.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut failures = 0u32;
        loop {
            let floor = self.clone();
            let outcome = tokio::spawn(async move { floor.cycle_loop().await }).await;

            match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => error!("Cycle loop failed: {:#}", e),
                Err(e) => error!("Cycle loop panicked: {}", e),
            }

            failures += 1;
            if failures > self.options.max_cycle_retries {
                bail!(
                    "cycle loop failed {} times, giving up",
                    self.options.max_cycle_retries
                );
            }
            warn!(
                "Restarting cycle loop in {:?} (failure {}/{})",
                self.options.retry_backoff, failures, self.options.max_cycle_retries
            );
            sleep(self.options.retry_backoff).await;
        }
    }

    async fn cycle_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut ticker = interval(self.options.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = self.run_cycle().await;
            info!(
                "Cycle complete: market {}, {} trader(s) processed",
                if report.market_open { "open" } else { "closed" },
                report.outcomes.len()
            );
        }
    }

    /// One full trading cycle. Never fails: every per-trader problem is
    /// reduced to an outcome line.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let now = eastern_now();
        let open = is_market_open(self.options.force_market_open, now, &*self.status).await;
        self.context.note_market_state(open);

        if !open && !self.options.run_when_closed {
            info!("Market closed, skipping cycle");
            return CycleReport {
                market_open: false,
                outcomes: Vec::new(),
            };
        }

        let mut handles = Vec::with_capacity(self.options.traders.len());
        for profile in self.options.traders.clone() {
            let floor = self.clone();
            handles.push((
                profile.name.clone(),
                tokio::spawn(async move { floor.trader_cycle(profile).await }),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let line = match handle.await {
                Ok(line) => line,
                Err(e) => {
                    error!("{}: trader task panicked: {}", name, e);
                    format!("trader task crashed: {e}")
                }
            };
            info!("{}: {}", name, line);
            outcomes.push(TraderOutcome { trader: name, line });
        }

        CycleReport {
            market_open: open,
            outcomes,
        }
    }

    async fn trader_cycle(&self, profile: TraderProfile) -> String {
        let mut account = match self.ledger.open(&profile.name).await {
            Ok(account) => account,
            Err(e) => return format!("account load failed: {e}"),
        };

        // First run only. Replacing the strategy of a seasoned account is
        // an explicit reset (`Ledger::reset`), never something a cycle
        // does on its own.
        if account.strategy.is_empty() {
            if let Err(e) = self
                .ledger
                .change_strategy(&mut account, &profile.strategy)
                .await
            {
                warn!("{}: strategy install failed: {}", profile.name, e);
            }
        }

        // Valuation is sampled every cycle the floor runs, trade or not
        if let Err(e) = self.ledger.record_valuation(&mut account).await {
            warn!("{}: valuation sample failed: {}", profile.name, e);
        }

        let schedule = TraderSchedule::for_cadence(profile.cadence);
        let now = eastern_now();
        let building = needs_portfolio_building(profile.portfolio_target, account.holdings_count());
        let in_window = should_trade_now(&schedule, &now) || should_rebalance_now(&schedule, &now);

        if !building && !in_window {
            return "outside trading window, holding".to_string();
        }
        if building {
            info!(
                "{}: portfolio building ({}/{} positions), trading regardless of window",
                profile.name,
                account.holdings_count(),
                profile.portfolio_target
            );
        }

        let mut symbols: Vec<String> = account.holdings.keys().cloned().collect();
        symbols.sort();

        let context = match timeout(
            self.options.decision_timeout,
            self.context.market_context(&symbols),
        )
        .await
        {
            Ok(context) => context,
            Err(_) => {
                warn!("{}: market context gathering timed out", profile.name);
                json!({ "error": "market context gathering timed out" })
            }
        };

        let report = self.ledger.report(&account).await;
        let raw = match timeout(
            self.options.decision_timeout,
            self.engine
                .decide(&profile.name, &profile.strategy, &report, &context),
        )
        .await
        {
            Ok(raw) => raw,
            Err(_) => {
                warn!("{}: decision engine timed out", profile.name);
                return "decision timed out, holding".to_string();
            }
        };

        self.execute(&mut account, parse_decision(&raw)).await
    }

    /// Apply one decision to one account. Buys are clamped to what the
    /// balance can cover; oversells are rejected outright.
    async fn execute(&self, account: &mut Account, decision: TradeDecision) -> String {
        match decision {
            TradeDecision::Hold { rationale } => {
                if rationale.is_empty() {
                    "holding".to_string()
                } else {
                    format!("holding: {rationale}")
                }
            }

            TradeDecision::Buy {
                symbol,
                quantity,
                rationale,
            } => {
                if quantity == 0 {
                    return format!("buy of 0 shares of {symbol} ignored");
                }

                let Some(price) = self.prices.current_price(&symbol).await else {
                    return format!("no price for {symbol}, buy skipped");
                };

                let affordable = self.ledger.max_affordable(account.balance, price);
                if affordable == 0 {
                    return format!("cannot afford a single share of {symbol}, holding");
                }

                let clamped = cmp::min(quantity, affordable);
                if clamped < quantity {
                    info!(
                        "{}: buy of {} {} clamped to {} affordable",
                        account.name, quantity, symbol, clamped
                    );
                }

                match self
                    .ledger
                    .buy_shares(account, &symbol, clamped, &rationale)
                    .await
                {
                    Ok(line) => line,
                    Err(e) => format!("buy of {clamped} {symbol} failed: {e}"),
                }
            }

            TradeDecision::Sell {
                symbol,
                quantity,
                rationale,
            } => {
                if quantity == 0 {
                    return format!("sell of 0 shares of {symbol} ignored");
                }

                match self
                    .ledger
                    .sell_shares(account, &symbol, quantity, &rationale)
                    .await
                {
                    Ok(line) => line,
                    Err(e) => format!("sell of {quantity} {symbol} rejected: {e}"),
                }
            }
        }
    }
}
