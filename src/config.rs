//! Runtime settings
//!
//! Loaded from an optional `trading-floor.toml` next to the binary with
//! `TRADING_FLOOR__*` environment overrides on top (double underscore for
//! nesting, e.g. `TRADING_FLOOR__TTL__LAST_TRADE_SECONDS=5`). Every field
//! has a sensible default so the binary runs with no config at all.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::market::TtlPolicy;
use crate::schedule::Cadence;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Cash every new account starts with
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,

    /// Simulated half-spread applied to fills, e.g. 0.002 = 20bps
    #[serde(default = "default_spread")]
    pub spread: Decimal,

    /// Seconds between trading cycles
    #[serde(default = "default_cycle_seconds")]
    pub cycle_seconds: u64,

    /// Testing/backfill override: treat the market as open unconditionally
    #[serde(default)]
    pub force_market_open: bool,

    /// Run decision cycles even when the market is closed
    #[serde(default)]
    pub run_when_closed: bool,

    /// Budget for gathering a trader's decision context
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_seconds: u64,

    /// Consecutive cycle-loop failures tolerated before giving up
    #[serde(default = "default_max_retries")]
    pub max_cycle_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,

    #[serde(default = "default_polygon_base_url")]
    pub polygon_base_url: String,

    #[serde(default)]
    pub polygon_api_key: String,

    #[serde(default = "default_alpha_vantage_base_url")]
    pub alpha_vantage_base_url: String,

    #[serde(default)]
    pub alpha_vantage_api_key: String,

    #[serde(default)]
    pub ttl: TtlSettings,

    #[serde(default = "default_traders")]
    pub traders: Vec<TraderProfile>,
}

/// One trader personality
#[derive(Debug, Clone, Deserialize)]
pub struct TraderProfile {
    pub name: String,
    pub strategy: String,
    #[serde(default)]
    pub cadence: Cadence,
    /// Positions to hold before the steady-state cadence applies
    #[serde(default = "default_portfolio_target")]
    pub portfolio_target: usize,
}

/// Cache TTL overrides, in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlSettings {
    pub last_trade_seconds: u64,
    pub last_quote_seconds: u64,
    pub aggregates_seconds: u64,
    pub snapshot_open_seconds: u64,
    pub snapshot_closed_seconds: u64,
    pub indicators_seconds: u64,
    pub market_status_seconds: u64,
    pub symbol_search_seconds: u64,
    pub news_sentiment_seconds: u64,
}

impl Default for TtlSettings {
    fn default() -> Self {
        let policy = TtlPolicy::default();
        Self {
            last_trade_seconds: policy.last_trade.as_secs(),
            last_quote_seconds: policy.last_quote.as_secs(),
            aggregates_seconds: policy.aggregates.as_secs(),
            snapshot_open_seconds: policy.snapshot_open.as_secs(),
            snapshot_closed_seconds: policy.snapshot_closed.as_secs(),
            indicators_seconds: policy.indicators.as_secs(),
            market_status_seconds: policy.market_status.as_secs(),
            symbol_search_seconds: policy.symbol_search.as_secs(),
            news_sentiment_seconds: policy.news_sentiment.as_secs(),
        }
    }
}

impl From<&TtlSettings> for TtlPolicy {
    fn from(settings: &TtlSettings) -> Self {
        Self {
            last_trade: Duration::from_secs(settings.last_trade_seconds),
            last_quote: Duration::from_secs(settings.last_quote_seconds),
            aggregates: Duration::from_secs(settings.aggregates_seconds),
            snapshot_open: Duration::from_secs(settings.snapshot_open_seconds),
            snapshot_closed: Duration::from_secs(settings.snapshot_closed_seconds),
            indicators: Duration::from_secs(settings.indicators_seconds),
            market_status: Duration::from_secs(settings.market_status_seconds),
            symbol_search: Duration::from_secs(settings.symbol_search_seconds),
            news_sentiment: Duration::from_secs(settings.news_sentiment_seconds),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("trading-floor").required(false))
            .add_source(
                config::Environment::with_prefix("TRADING_FLOOR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_seconds)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_seconds)
    }
}

fn default_database_url() -> String {
    "sqlite://trading_floor.db".to_string()
}

fn default_initial_balance() -> Decimal {
    Decimal::new(1_000_000, 2) // 10,000.00
}

fn default_spread() -> Decimal {
    Decimal::new(2, 3) // 0.002
}

fn default_cycle_seconds() -> u64 {
    600
}

fn default_decision_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_backoff() -> u64 {
    60
}

fn default_polygon_base_url() -> String {
    "https://api.polygon.io".to_string()
}

fn default_alpha_vantage_base_url() -> String {
    "https://www.alphavantage.co".to_string()
}

fn default_portfolio_target() -> usize {
    10
}

/// The default trading floor: two patient close-of-day investors and one
/// intraday momentum trader
fn default_traders() -> Vec<TraderProfile> {
    vec![
        TraderProfile {
            name: "warren".to_string(),
            strategy: "Patient value investing. Buy quality businesses below intrinsic \
                       value and hold them for the long term."
                .to_string(),
            cadence: Cadence::DailyClose,
            portfolio_target: 10,
        },
        TraderProfile {
            name: "camillo".to_string(),
            strategy: "Social arbitrage. Spot consumer and cultural trends early and \
                       buy the companies positioned to benefit."
                .to_string(),
            cadence: Cadence::DailyClose,
            portfolio_target: 10,
        },
        TraderProfile {
            name: "pavel".to_string(),
            strategy: "Aggressive intraday momentum. Trade concentrated positions on \
                       strong movers and cut losers fast."
                .to_string(),
            cadence: Cadence::Intraday3x,
            portfolio_target: 3,
        },
    ]
}
