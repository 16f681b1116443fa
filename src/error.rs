//! Error taxonomy for the trading floor core

use rust_decimal::Decimal;

/// Errors from the storage layer
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors from account (ledger) operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("insufficient funds: need ${needed}, have ${available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("cannot sell {requested} shares of {symbol}, only {held} held")]
    InsufficientShares {
        symbol: String,
        requested: u32,
        held: u32,
    },

    #[error("no price available for {0}")]
    PriceUnavailable(String),

    #[error("account save failed: {0}")]
    Persistence(#[from] StorageError),
}

/// Errors from upstream market-data providers
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("{provider} unavailable: {message}")]
    UpstreamUnavailable { provider: String, message: String },
}

impl MarketError {
    pub fn upstream(provider: &str, message: impl std::fmt::Display) -> Self {
        Self::UpstreamUnavailable {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }
}
