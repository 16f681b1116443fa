//! Trading Floor Library
//!
//! Core paper-trading functionality: persisted accounts, cached market
//! data and the scheduled decision loop that drives a roster of trader
//! personalities.

pub mod account;
pub mod cache;
pub mod config;
pub mod decision;
pub mod error;
pub mod floor;
pub mod market;
pub mod schedule;
pub mod storage;

// Re-export main types for convenience
pub use account::{Account, Ledger, Transaction};
pub use cache::{CacheHit, CacheStore};
pub use config::{Settings, TraderProfile};
pub use decision::{parse_decision, DecisionEngine, HoldEngine, TradeDecision};
pub use error::{LedgerError, MarketError, StorageError};
pub use floor::{CycleReport, FloorOptions, TradingFloor};
pub use market::{
    AlphaVantageProvider, MarketContextSource, MarketDataGateway, MarketStatusSource,
    PolygonProvider, PriceSource, TtlPolicy,
};
pub use schedule::{Cadence, TraderSchedule};
pub use storage::Storage;
