//! Trading schedules - market hours and per-trader cadence
//!
//! All decisions are made in US Eastern wall time (DST-aware). These
//! functions are pure apart from the upstream market-status probe, which is
//! injected so callers can gate on it without this module owning any I/O.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::market::MarketStatusSource;

/// Current time in US Eastern (handles EST/EDT automatically)
pub fn eastern_now() -> DateTime<Tz> {
    Utc::now().with_timezone(&New_York)
}

/// Timestamp string used for transactions and valuation samples
pub fn timestamp_string(now: &DateTime<Tz>) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Wall-clock hour as a decimal, e.g. 15:30 -> 15.5
fn hour_decimal(now: &DateTime<Tz>) -> f64 {
    now.hour() as f64 + now.minute() as f64 / 60.0
}

/// Local check for regular trading hours: weekdays, 09:30-16:00 Eastern.
/// No API calls - this is the cheap short-circuit in front of the upstream
/// status probe.
pub fn within_core_hours(now: &DateTime<Tz>) -> bool {
    if now.weekday().number_from_monday() >= 6 {
        return false;
    }
    let hour = hour_decimal(now);
    (9.5..=16.0).contains(&hour)
}

/// Is the market open right now?
///
/// Weekend and out-of-hours checks run first and never consult the
/// upstream, so a Saturday is closed no matter what the provider says.
/// If the upstream probe fails we default to closed - trading on an
/// unconfirmed "open" is never allowed. `force_open` is an explicit
/// testing/backfill override and must never be the default.
pub async fn is_market_open(
    force_open: bool,
    now: DateTime<Tz>,
    status: &dyn MarketStatusSource,
) -> bool {
    if force_open {
        return true;
    }

    if !within_core_hours(&now) {
        return false;
    }

    match status.reported_open().await {
        Ok(open) => open,
        Err(e) => {
            warn!("Market status probe failed, assuming closed: {}", e);
            false
        }
    }
}

/// Per-trader cadence preset
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Once per day near the close, rebalance after the close
    #[default]
    DailyClose,
    /// Three fixed intraday windows, offset rebalance windows
    Intraday3x,
}

/// Trade and rebalance windows in Eastern decimal hours.
///
/// A window is `target ± tolerance`; rebalance windows are offset from the
/// trade windows so the two never collide for the same trader.
#[derive(Debug, Clone, PartialEq)]
pub struct TraderSchedule {
    pub trade_hours: Vec<f64>,
    pub trade_tolerance: f64,
    pub rebalance_hours: Vec<f64>,
    pub rebalance_tolerance: f64,
}

impl TraderSchedule {
    /// Daily traders act in the last half hour of the session (15:30-16:00)
    /// and rebalance after the close (16:15-16:30).
    pub fn daily_close() -> Self {
        Self {
            trade_hours: vec![15.75],
            trade_tolerance: 0.25,
            rebalance_hours: vec![16.375],
            rebalance_tolerance: 0.125,
        }
    }

    /// High-frequency traders act at 10:00, 13:00 and 15:30 (±30 minutes)
    /// and rebalance at 10:30, 13:30 and 15:45 (±15 minutes).
    pub fn intraday_3x() -> Self {
        Self {
            trade_hours: vec![10.0, 13.0, 15.5],
            trade_tolerance: 0.5,
            rebalance_hours: vec![10.5, 13.5, 15.75],
            rebalance_tolerance: 0.25,
        }
    }

    pub fn for_cadence(cadence: Cadence) -> Self {
        match cadence {
            Cadence::DailyClose => Self::daily_close(),
            Cadence::Intraday3x => Self::intraday_3x(),
        }
    }
}

fn within_any_window(hour: f64, targets: &[f64], tolerance: f64) -> bool {
    targets.iter().any(|t| (hour - t).abs() <= tolerance)
}

/// Is this trader inside one of its trade windows?
pub fn should_trade_now(schedule: &TraderSchedule, now: &DateTime<Tz>) -> bool {
    within_any_window(hour_decimal(now), &schedule.trade_hours, schedule.trade_tolerance)
}

/// Is this trader inside one of its rebalance windows?
pub fn should_rebalance_now(schedule: &TraderSchedule, now: &DateTime<Tz>) -> bool {
    within_any_window(
        hour_decimal(now),
        &schedule.rebalance_hours,
        schedule.rebalance_tolerance,
    )
}

/// True while the trader holds fewer positions than its target. While this
/// holds, the coordinator forces an action regardless of cadence -
/// portfolio construction takes precedence over the steady-state schedule.
pub fn needs_portfolio_building(portfolio_target: usize, current_holdings: usize) -> bool {
    current_holdings < portfolio_target
}
