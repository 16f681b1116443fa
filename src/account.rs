//! Account ledger - cash, holdings and transaction history per trader
//!
//! The ledger owns every balance mutation. Each operation validates, builds
//! the next account state, persists it as a single whole-row upsert and only
//! then commits the state in memory - a failed save leaves no partial
//! effect.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::market::PriceSource;
use crate::schedule::{eastern_now, timestamp_string};
use crate::storage::Storage;

/// One fill, recorded at the moment of trade. Quantity is signed:
/// positive for buys, negative for sells. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub symbol: String,
    pub quantity: i64,
    pub price: Decimal,
    pub timestamp: String,
    pub rationale: String,
}

impl Transaction {
    /// Sign-correct total: negative for sells
    pub fn total(&self) -> Decimal {
        Decimal::from(self.quantity) * self.price
    }
}

/// Paper-trading account state for one trader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub balance: Decimal,
    pub strategy: String,
    /// Share counts by symbol; entries are strictly positive, a position
    /// sold down to zero is removed, never stored as 0
    pub holdings: HashMap<String, u32>,
    /// Append-only; insertion order is chronological order
    pub transactions: Vec<Transaction>,
    /// (timestamp, total value) samples, deduplicated by timestamp string
    pub portfolio_history: Vec<(String, Decimal)>,
}

impl Account {
    pub fn new(name: &str, initial_balance: Decimal) -> Self {
        Self {
            name: name.to_lowercase(),
            balance: initial_balance,
            strategy: String::new(),
            holdings: HashMap::new(),
            transactions: Vec::new(),
            portfolio_history: Vec::new(),
        }
    }

    pub fn holding(&self, symbol: &str) -> u32 {
        self.holdings.get(symbol).copied().unwrap_or(0)
    }

    pub fn holdings_count(&self) -> usize {
        self.holdings.len()
    }
}

/// Ledger operations over persisted accounts
pub struct Ledger {
    storage: Arc<dyn Storage>,
    prices: Arc<dyn PriceSource>,
    initial_balance: Decimal,
    spread: Decimal,
}

impl Ledger {
    pub fn new(
        storage: Arc<dyn Storage>,
        prices: Arc<dyn PriceSource>,
        initial_balance: Decimal,
        spread: Decimal,
    ) -> Self {
        Self {
            storage,
            prices,
            initial_balance,
            spread,
        }
    }

    pub fn spread(&self) -> Decimal {
        self.spread
    }

    /// Load an account by name, creating and persisting a fresh one with
    /// the initial balance on first lookup.
    pub async fn open(&self, name: &str) -> Result<Account, LedgerError> {
        let name = name.to_lowercase();
        if let Some(account) = self.storage.load_account(&name).await? {
            return Ok(account);
        }

        info!("Creating new account for {}", name);
        let mut account = Account::new(&name, self.initial_balance);
        // Seed the valuation series so performance tracking starts at day one
        self.record_valuation(&mut account).await?;
        Ok(account)
    }

    pub async fn deposit(&self, account: &mut Account, amount: Decimal) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut next = account.clone();
        next.balance += amount;
        self.storage.upsert_account(&next).await?;
        *account = next;

        info!("{}: deposited ${}, new balance ${}", account.name, amount, account.balance);
        Ok(())
    }

    pub async fn withdraw(&self, account: &mut Account, amount: Decimal) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if amount > account.balance {
            return Err(LedgerError::InsufficientFunds {
                needed: amount,
                available: account.balance,
            });
        }

        let mut next = account.clone();
        next.balance -= amount;
        self.storage.upsert_account(&next).await?;
        *account = next;

        info!("{}: withdrew ${}, new balance ${}", account.name, amount, account.balance);
        Ok(())
    }

    /// Buy at the current market price plus spread. Rejects before any
    /// mutation when the cost exceeds the balance.
    pub async fn buy_shares(
        &self,
        account: &mut Account,
        symbol: &str,
        quantity: u32,
        rationale: &str,
    ) -> Result<String, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidAmount(Decimal::ZERO));
        }

        let price = self
            .prices
            .current_price(symbol)
            .await
            .ok_or_else(|| LedgerError::PriceUnavailable(symbol.to_string()))?;

        let fill_price = price * (Decimal::ONE + self.spread);
        let total_cost = fill_price * Decimal::from(quantity);

        if total_cost > account.balance {
            return Err(LedgerError::InsufficientFunds {
                needed: total_cost,
                available: account.balance,
            });
        }

        let mut next = account.clone();
        next.balance -= total_cost;
        *next.holdings.entry(symbol.to_string()).or_insert(0) += quantity;
        next.transactions.push(Transaction {
            symbol: symbol.to_string(),
            quantity: quantity as i64,
            price: fill_price,
            timestamp: timestamp_string(&eastern_now()),
            rationale: rationale.to_string(),
        });

        self.storage.upsert_account(&next).await?;
        *account = next;

        let outcome = format!(
            "Bought {} shares of {} at ${:.2} each. Total cost: ${:.2}. Balance: ${:.2}",
            quantity, symbol, fill_price, total_cost, account.balance
        );
        info!("{}: {}", account.name, outcome);
        Ok(outcome)
    }

    /// Sell at the current market price minus spread. Selling more than
    /// held is rejected outright - there is no partial fill on the sell
    /// side.
    pub async fn sell_shares(
        &self,
        account: &mut Account,
        symbol: &str,
        quantity: u32,
        rationale: &str,
    ) -> Result<String, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidAmount(Decimal::ZERO));
        }

        let held = account.holding(symbol);
        if held < quantity {
            return Err(LedgerError::InsufficientShares {
                symbol: symbol.to_string(),
                requested: quantity,
                held,
            });
        }

        let price = self
            .prices
            .current_price(symbol)
            .await
            .ok_or_else(|| LedgerError::PriceUnavailable(symbol.to_string()))?;

        let fill_price = price * (Decimal::ONE - self.spread);
        let total_proceeds = fill_price * Decimal::from(quantity);

        let mut next = account.clone();
        let remaining = held - quantity;
        if remaining == 0 {
            next.holdings.remove(symbol);
        } else {
            next.holdings.insert(symbol.to_string(), remaining);
        }
        next.balance += total_proceeds;
        next.transactions.push(Transaction {
            symbol: symbol.to_string(),
            quantity: -(quantity as i64),
            price: fill_price,
            timestamp: timestamp_string(&eastern_now()),
            rationale: rationale.to_string(),
        });

        self.storage.upsert_account(&next).await?;
        *account = next;

        let outcome = format!(
            "Sold {} shares of {} at ${:.2} each. Total proceeds: ${:.2}. Balance: ${:.2}",
            quantity, symbol, fill_price, total_proceeds, account.balance
        );
        info!("{}: {}", account.name, outcome);
        Ok(outcome)
    }

    /// Cash plus the marked value of every priceable holding. A holding
    /// with no available price contributes zero rather than failing the
    /// whole valuation - one symbol's pricing outage must not block the
    /// rest of the portfolio.
    pub async fn portfolio_value(&self, account: &Account) -> Decimal {
        let mut total = account.balance;
        for (symbol, quantity) in &account.holdings {
            match self.prices.current_price(symbol).await {
                Some(price) => total += price * Decimal::from(*quantity),
                None => {
                    warn!(
                        "{}: no price for {}, valuing position at 0",
                        account.name, symbol
                    );
                }
            }
        }
        total
    }

    /// Append a (now, value) sample unless the last sample carries the
    /// same timestamp string - keeps the series bounded when sampled
    /// faster than second resolution.
    pub async fn record_valuation(&self, account: &mut Account) -> Result<(), LedgerError> {
        let value = self.portfolio_value(account).await;
        let timestamp = timestamp_string(&eastern_now());

        let duplicate = account
            .portfolio_history
            .last()
            .is_some_and(|(last, _)| *last == timestamp);
        if duplicate {
            return Ok(());
        }

        let mut next = account.clone();
        next.portfolio_history.push((timestamp, value));
        self.storage.upsert_account(&next).await?;
        *account = next;
        Ok(())
    }

    /// Profit or loss versus the initial stake
    pub fn profit_loss(&self, portfolio_value: Decimal) -> Decimal {
        portfolio_value - self.initial_balance
    }

    /// Largest whole-share quantity the balance can cover at the spread-
    /// adjusted fill price. Used by the coordinator to clamp oversized
    /// buy proposals.
    pub fn max_affordable(&self, balance: Decimal, price: Decimal) -> u32 {
        let fill_price = price * (Decimal::ONE + self.spread);
        if fill_price <= Decimal::ZERO {
            return 0;
        }
        (balance / fill_price).floor().to_u32().unwrap_or(0)
    }

    /// JSON snapshot fed to the decision function. Read-only: valuation
    /// sampling happens through `record_valuation`.
    pub async fn report(&self, account: &Account) -> serde_json::Value {
        let value = self.portfolio_value(account).await;
        let pnl = self.profit_loss(value);
        let pnl_percent = if self.initial_balance > Decimal::ZERO {
            pnl / self.initial_balance * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        json!({
            "name": account.name,
            "balance": account.balance,
            "strategy": account.strategy,
            "holdings": account.holdings,
            "transactions": account.transactions,
            "portfolio_history": account.portfolio_history,
            "total_portfolio_value": value,
            "total_profit_loss": pnl,
            "total_profit_loss_percent": pnl_percent,
        })
    }

    /// Install a new strategy and wipe the account back to its initial
    /// state. Used when a trader's strategy text changes materially.
    pub async fn reset(&self, account: &mut Account, strategy: &str) -> Result<(), LedgerError> {
        let mut next = Account::new(&account.name, self.initial_balance);
        next.strategy = strategy.to_string();
        self.storage.upsert_account(&next).await?;
        *account = next;

        info!("{}: account reset with new strategy", account.name);
        Ok(())
    }

    pub async fn change_strategy(
        &self,
        account: &mut Account,
        strategy: &str,
    ) -> Result<(), LedgerError> {
        let mut next = account.clone();
        next.strategy = strategy.to_string();
        self.storage.upsert_account(&next).await?;
        *account = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Price source backed by a fixed table; symbols absent from the table
    /// are unpriceable
    struct FixedPrices {
        prices: Mutex<HashMap<String, Decimal>>,
    }

    impl FixedPrices {
        fn new(pairs: &[(&str, Decimal)]) -> Arc<Self> {
            Arc::new(Self {
                prices: Mutex::new(
                    pairs
                        .iter()
                        .map(|(s, p)| (s.to_string(), *p))
                        .collect(),
                ),
            })
        }

        fn set(&self, symbol: &str, price: Decimal) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }
    }

    #[async_trait]
    impl PriceSource for FixedPrices {
        async fn current_price(&self, symbol: &str) -> Option<Decimal> {
            self.prices.lock().unwrap().get(symbol).copied()
        }
    }

    async fn ledger_with(prices: Arc<FixedPrices>) -> Ledger {
        let store = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        store.init_schema().await.unwrap();
        Ledger::new(
            Arc::new(store),
            prices,
            Decimal::new(1_000_000, 2), // 10,000.00
            Decimal::new(2, 3),         // 0.002
        )
    }

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[tokio::test]
    async fn fresh_account_starts_at_initial_balance() {
        let prices = FixedPrices::new(&[]);
        let ledger = ledger_with(prices).await;

        let account = ledger.open("Warren").await.unwrap();
        assert_eq!(account.name, "warren");
        assert_eq!(account.balance, dec("10000.00"));
        assert!(account.holdings.is_empty());
        assert!(account.transactions.is_empty());
        // First valuation sample is seeded at creation
        assert_eq!(account.portfolio_history.len(), 1);
    }

    #[tokio::test]
    async fn buy_applies_spread_and_updates_holdings() {
        let prices = FixedPrices::new(&[("AAPL", dec("200"))]);
        let ledger = ledger_with(prices).await;
        let mut account = ledger.open("warren").await.unwrap();

        ledger
            .buy_shares(&mut account, "AAPL", 10, "test")
            .await
            .unwrap();

        assert_eq!(account.balance, dec("7996.00"));
        assert_eq!(account.holding("AAPL"), 10);
        assert_eq!(account.transactions.len(), 1);

        let tx = &account.transactions[0];
        assert_eq!(tx.symbol, "AAPL");
        assert_eq!(tx.quantity, 10);
        assert_eq!(tx.price, dec("200.40"));
        assert_eq!(tx.total(), dec("2004.00"));
    }

    #[tokio::test]
    async fn sell_to_zero_removes_the_holding() {
        let prices = FixedPrices::new(&[("AAPL", dec("200"))]);
        let ledger = ledger_with(prices.clone()).await;
        let mut account = ledger.open("warren").await.unwrap();

        ledger
            .buy_shares(&mut account, "AAPL", 10, "test")
            .await
            .unwrap();

        prices.set("AAPL", dec("210"));
        ledger
            .sell_shares(&mut account, "AAPL", 10, "test")
            .await
            .unwrap();

        assert_eq!(account.balance, dec("10091.80"));
        assert!(!account.holdings.contains_key("AAPL"));
        assert_eq!(account.transactions.len(), 2);

        let tx = &account.transactions[1];
        assert_eq!(tx.quantity, -10);
        assert_eq!(tx.price, dec("209.58"));
        assert_eq!(tx.total(), dec("-2095.80"));
    }

    #[tokio::test]
    async fn partial_sell_keeps_remaining_shares() {
        let prices = FixedPrices::new(&[("AAPL", dec("200"))]);
        let ledger = ledger_with(prices).await;
        let mut account = ledger.open("warren").await.unwrap();

        ledger
            .buy_shares(&mut account, "AAPL", 10, "test")
            .await
            .unwrap();
        ledger
            .sell_shares(&mut account, "AAPL", 4, "trim")
            .await
            .unwrap();

        assert_eq!(account.holding("AAPL"), 6);
    }

    #[tokio::test]
    async fn overdraft_buy_is_rejected_without_effect() {
        let prices = FixedPrices::new(&[("BRK.A", dec("700000"))]);
        let ledger = ledger_with(prices).await;
        let mut account = ledger.open("warren").await.unwrap();
        let before = account.clone();

        let err = ledger
            .buy_shares(&mut account, "BRK.A", 1, "yolo")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        assert_eq!(account.balance, before.balance);
        assert!(account.holdings.is_empty());
        assert!(account.transactions.is_empty());
    }

    #[tokio::test]
    async fn oversell_is_rejected_without_effect() {
        let prices = FixedPrices::new(&[("AAPL", dec("200"))]);
        let ledger = ledger_with(prices).await;
        let mut account = ledger.open("warren").await.unwrap();

        ledger
            .buy_shares(&mut account, "AAPL", 5, "test")
            .await
            .unwrap();
        let before = account.clone();

        let err = ledger
            .sell_shares(&mut account, "AAPL", 6, "test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientShares { requested: 6, held: 5, .. }
        ));

        assert_eq!(account.balance, before.balance);
        assert_eq!(account.holding("AAPL"), 5);
        assert_eq!(account.transactions.len(), before.transactions.len());
    }

    #[tokio::test]
    async fn unpriceable_symbol_blocks_the_trade() {
        let prices = FixedPrices::new(&[]);
        let ledger = ledger_with(prices).await;
        let mut account = ledger.open("warren").await.unwrap();

        let err = ledger
            .buy_shares(&mut account, "ZZZZ", 1, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::PriceUnavailable(_)));
    }

    #[tokio::test]
    async fn valuation_treats_unpriceable_holdings_as_zero() {
        let prices = FixedPrices::new(&[("AAPL", dec("100")), ("MSFT", dec("50"))]);
        let ledger = ledger_with(prices.clone()).await;
        let mut account = ledger.open("warren").await.unwrap();

        ledger
            .buy_shares(&mut account, "AAPL", 10, "test")
            .await
            .unwrap();
        ledger
            .buy_shares(&mut account, "MSFT", 10, "test")
            .await
            .unwrap();

        let full = ledger.portfolio_value(&account).await;
        assert_eq!(full, account.balance + dec("1000") + dec("500"));

        // MSFT goes dark: its position contributes 0, AAPL still counts
        prices.prices.lock().unwrap().remove("MSFT");
        let degraded = ledger.portfolio_value(&account).await;
        assert_eq!(degraded, account.balance + dec("1000"));
    }

    #[tokio::test]
    async fn valuation_samples_dedup_by_timestamp() {
        let prices = FixedPrices::new(&[]);
        let ledger = ledger_with(prices).await;
        let mut account = ledger.open("warren").await.unwrap();

        let len_after_open = account.portfolio_history.len();
        // Two samples inside the same second collapse into one
        ledger.record_valuation(&mut account).await.unwrap();
        ledger.record_valuation(&mut account).await.unwrap();
        assert!(account.portfolio_history.len() <= len_after_open + 1);
    }

    #[tokio::test]
    async fn deposit_and_withdraw_validate_amounts() {
        let prices = FixedPrices::new(&[]);
        let ledger = ledger_with(prices).await;
        let mut account = ledger.open("warren").await.unwrap();

        assert!(matches!(
            ledger.deposit(&mut account, dec("0")).await.unwrap_err(),
            LedgerError::InvalidAmount(_)
        ));
        assert!(matches!(
            ledger.deposit(&mut account, dec("-5")).await.unwrap_err(),
            LedgerError::InvalidAmount(_)
        ));

        ledger.deposit(&mut account, dec("500")).await.unwrap();
        assert_eq!(account.balance, dec("10500.00"));

        assert!(matches!(
            ledger
                .withdraw(&mut account, dec("99999"))
                .await
                .unwrap_err(),
            LedgerError::InsufficientFunds { .. }
        ));
        ledger.withdraw(&mut account, dec("500")).await.unwrap();
        assert_eq!(account.balance, dec("10000.00"));
    }

    #[tokio::test]
    async fn account_survives_reload() {
        let prices = FixedPrices::new(&[("AAPL", dec("200"))]);
        let store = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        store.init_schema().await.unwrap();
        let store: Arc<dyn Storage> = Arc::new(store);
        let ledger = Ledger::new(
            store.clone(),
            prices,
            Decimal::new(1_000_000, 2),
            Decimal::new(2, 3),
        );

        let mut account = ledger.open("warren").await.unwrap();
        ledger
            .buy_shares(&mut account, "AAPL", 3, "test")
            .await
            .unwrap();

        let reloaded = ledger.open("warren").await.unwrap();
        assert_eq!(reloaded.balance, account.balance);
        assert_eq!(reloaded.holdings, account.holdings);
        assert_eq!(reloaded.transactions, account.transactions);
        assert_eq!(reloaded.portfolio_history, account.portfolio_history);
    }

    #[tokio::test]
    async fn max_affordable_floors_to_whole_shares() {
        let prices = FixedPrices::new(&[]);
        let ledger = ledger_with(prices).await;

        // 10,000 / 200.40 = 49.9 -> 49 shares
        assert_eq!(ledger.max_affordable(dec("10000.00"), dec("200")), 49);
        assert_eq!(ledger.max_affordable(dec("100.00"), dec("200")), 0);
        assert_eq!(ledger.max_affordable(dec("10000.00"), dec("0")), 0);
    }

    #[tokio::test]
    async fn reset_restores_initial_state_with_new_strategy() {
        let prices = FixedPrices::new(&[("AAPL", dec("200"))]);
        let ledger = ledger_with(prices).await;
        let mut account = ledger.open("warren").await.unwrap();

        ledger
            .buy_shares(&mut account, "AAPL", 10, "test")
            .await
            .unwrap();
        ledger.reset(&mut account, "deep value").await.unwrap();

        assert_eq!(account.balance, dec("10000.00"));
        assert!(account.holdings.is_empty());
        assert!(account.transactions.is_empty());
        assert_eq!(account.strategy, "deep value");
    }
}
