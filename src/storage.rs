//! Storage layer - account rows and the raw API-call audit log
//!
//! One trait, two interchangeable backends (SQLite for local runs, Postgres
//! for deployments) chosen at startup from the database URL. Call sites
//! never branch on database kind; each backend owns its SQL dialect.
//!
//! Schema initialization is an explicit, idempotent step performed once at
//! process startup - the handle is then passed to every component.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Postgres, Row, Sqlite};
use tracing::info;

use crate::account::{Account, Transaction};
use crate::error::StorageError;

/// A stored upstream API call, as returned by cache lookups
#[derive(Debug, Clone)]
pub struct ApiCallRecord {
    pub id: i64,
    pub response_data: Value,
    pub created_at: DateTime<Utc>,
}

/// A new audit-log row for an upstream API call
#[derive(Debug, Clone)]
pub struct NewApiCall<'a> {
    pub provider: &'a str,
    pub function_name: &'a str,
    pub parameters: &'a Value,
    pub parameters_hash: &'a str,
    pub response_data: &'a Value,
    pub success: bool,
    pub error_message: Option<&'a str>,
    pub was_cached: bool,
    pub cache_age_seconds: i64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Create tables and indexes if they do not exist. Safe to call on
    /// every startup.
    async fn init_schema(&self) -> Result<(), StorageError>;

    /// Load an account by lowercase trader name
    async fn load_account(&self, name: &str) -> Result<Option<Account>, StorageError>;

    /// Replace-or-insert the full account snapshot in one statement
    async fn upsert_account(&self, account: &Account) -> Result<(), StorageError>;

    /// Most recent successful call for (provider, function, hash), if any.
    /// Age filtering happens in the cache layer so TTL changes apply
    /// retroactively to old rows.
    async fn latest_successful_call(
        &self,
        provider: &str,
        function_name: &str,
        parameters_hash: &str,
    ) -> Result<Option<ApiCallRecord>, StorageError>;

    /// Append one audit row; returns the new row id
    async fn insert_api_call(&self, call: &NewApiCall<'_>) -> Result<i64, StorageError>;
}

/// Open the backend matching the database URL scheme
pub async fn open(database_url: &str) -> Result<Arc<dyn Storage>, StorageError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        info!("Using Postgres storage");
        Ok(Arc::new(PostgresStorage::connect(database_url).await?))
    } else {
        info!("Using SQLite storage at {}", database_url);
        Ok(Arc::new(SqliteStorage::connect(database_url).await?))
    }
}

// --- Row (de)serialization helpers, shared by both backends ---

fn encode_holdings(holdings: &HashMap<String, u32>) -> String {
    serde_json::to_string(holdings).unwrap_or_else(|_| "{}".to_string())
}

fn encode_transactions(transactions: &[Transaction]) -> Result<String, StorageError> {
    serde_json::to_string(transactions)
        .map_err(|e| StorageError::Corrupt(format!("transactions encode: {e}")))
}

fn encode_history(history: &[(String, Decimal)]) -> Result<String, StorageError> {
    serde_json::to_string(history)
        .map_err(|e| StorageError::Corrupt(format!("portfolio history encode: {e}")))
}

type AccountRow = (String, String, String, String, String);

fn decode_account(name: &str, row: AccountRow) -> Result<Account, StorageError> {
    let (balance, strategy, holdings, transactions, history) = row;

    let balance = Decimal::from_str(&balance)
        .map_err(|e| StorageError::Corrupt(format!("balance for {name}: {e}")))?;
    let holdings: HashMap<String, u32> = serde_json::from_str(&holdings)
        .map_err(|e| StorageError::Corrupt(format!("holdings for {name}: {e}")))?;
    let transactions: Vec<Transaction> = serde_json::from_str(&transactions)
        .map_err(|e| StorageError::Corrupt(format!("transactions for {name}: {e}")))?;
    let portfolio_history: Vec<(String, Decimal)> = serde_json::from_str(&history)
        .map_err(|e| StorageError::Corrupt(format!("portfolio history for {name}: {e}")))?;

    Ok(Account {
        name: name.to_string(),
        balance,
        strategy,
        holdings,
        transactions,
        portfolio_history,
    })
}

fn decode_api_call(
    id: i64,
    response_data: String,
    created_at: String,
) -> Result<ApiCallRecord, StorageError> {
    let response_data: Value = serde_json::from_str(&response_data)
        .map_err(|e| StorageError::Corrupt(format!("api call {id} payload: {e}")))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StorageError::Corrupt(format!("api call {id} timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(ApiCallRecord {
        id,
        response_data,
        created_at,
    })
}

// --- SQLite backend ---

pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // In-memory databases are per-connection; a pool of one keeps the
        // schema visible to every query. Used by tests.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trader_accounts (
                trader_name TEXT PRIMARY KEY,
                balance TEXT NOT NULL,
                strategy TEXT NOT NULL DEFAULT '',
                holdings TEXT NOT NULL DEFAULT '{}',
                transactions TEXT NOT NULL DEFAULT '[]',
                portfolio_history TEXT NOT NULL DEFAULT '[]',
                last_updated TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_api_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                function_name TEXT NOT NULL,
                parameters TEXT NOT NULL,
                parameters_hash TEXT NOT NULL,
                response_data TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                error_message TEXT,
                was_cached BOOLEAN NOT NULL DEFAULT FALSE,
                cache_age_seconds INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_api_calls_hash \
             ON raw_api_calls (provider, function_name, parameters_hash)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_calls_created ON raw_api_calls (created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_account(&self, name: &str) -> Result<Option<Account>, StorageError> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT balance, strategy, holdings, transactions, portfolio_history \
             FROM trader_accounts WHERE trader_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| decode_account(name, r)).transpose()
    }

    async fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO trader_accounts \
             (trader_name, balance, strategy, holdings, transactions, portfolio_history, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.name)
        .bind(account.balance.to_string())
        .bind(&account.strategy)
        .bind(encode_holdings(&account.holdings))
        .bind(encode_transactions(&account.transactions)?)
        .bind(encode_history(&account.portfolio_history)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_successful_call(
        &self,
        provider: &str,
        function_name: &str,
        parameters_hash: &str,
    ) -> Result<Option<ApiCallRecord>, StorageError> {
        let row: Option<(i64, String, String)> = sqlx::query_as(
            "SELECT id, response_data, created_at FROM raw_api_calls \
             WHERE provider = ? AND function_name = ? AND parameters_hash = ? AND success = TRUE \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(provider)
        .bind(function_name)
        .bind(parameters_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, data, created)| decode_api_call(id, data, created))
            .transpose()
    }

    async fn insert_api_call(&self, call: &NewApiCall<'_>) -> Result<i64, StorageError> {
        let result = sqlx::query(
            "INSERT INTO raw_api_calls \
             (provider, function_name, parameters, parameters_hash, response_data, \
              success, error_message, was_cached, cache_age_seconds, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(call.provider)
        .bind(call.function_name)
        .bind(call.parameters.to_string())
        .bind(call.parameters_hash)
        .bind(call.response_data.to_string())
        .bind(call.success)
        .bind(call.error_message)
        .bind(call.was_cached)
        .bind(call.cache_age_seconds)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }
}

// --- Postgres backend ---

pub struct PostgresStorage {
    pool: Pool<Postgres>,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trader_accounts (
                trader_name TEXT PRIMARY KEY,
                balance TEXT NOT NULL,
                strategy TEXT NOT NULL DEFAULT '',
                holdings TEXT NOT NULL DEFAULT '{}',
                transactions TEXT NOT NULL DEFAULT '[]',
                portfolio_history TEXT NOT NULL DEFAULT '[]',
                last_updated TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_api_calls (
                id BIGSERIAL PRIMARY KEY,
                provider TEXT NOT NULL,
                function_name TEXT NOT NULL,
                parameters TEXT NOT NULL,
                parameters_hash TEXT NOT NULL,
                response_data TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                error_message TEXT,
                was_cached BOOLEAN NOT NULL DEFAULT FALSE,
                cache_age_seconds BIGINT NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_api_calls_hash \
             ON raw_api_calls (provider, function_name, parameters_hash)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_calls_created ON raw_api_calls (created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_account(&self, name: &str) -> Result<Option<Account>, StorageError> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT balance, strategy, holdings, transactions, portfolio_history \
             FROM trader_accounts WHERE trader_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| decode_account(name, r)).transpose()
    }

    async fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO trader_accounts \
             (trader_name, balance, strategy, holdings, transactions, portfolio_history, last_updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (trader_name) DO UPDATE SET \
                balance = EXCLUDED.balance, \
                strategy = EXCLUDED.strategy, \
                holdings = EXCLUDED.holdings, \
                transactions = EXCLUDED.transactions, \
                portfolio_history = EXCLUDED.portfolio_history, \
                last_updated = EXCLUDED.last_updated",
        )
        .bind(&account.name)
        .bind(account.balance.to_string())
        .bind(&account.strategy)
        .bind(encode_holdings(&account.holdings))
        .bind(encode_transactions(&account.transactions)?)
        .bind(encode_history(&account.portfolio_history)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_successful_call(
        &self,
        provider: &str,
        function_name: &str,
        parameters_hash: &str,
    ) -> Result<Option<ApiCallRecord>, StorageError> {
        let row: Option<(i64, String, String)> = sqlx::query_as(
            "SELECT id, response_data, created_at FROM raw_api_calls \
             WHERE provider = $1 AND function_name = $2 AND parameters_hash = $3 AND success = TRUE \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(provider)
        .bind(function_name)
        .bind(parameters_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, data, created)| decode_api_call(id, data, created))
            .transpose()
    }

    async fn insert_api_call(&self, call: &NewApiCall<'_>) -> Result<i64, StorageError> {
        let row = sqlx::query(
            "INSERT INTO raw_api_calls \
             (provider, function_name, parameters, parameters_hash, response_data, \
              success, error_message, was_cached, cache_age_seconds, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING id",
        )
        .bind(call.provider)
        .bind(call.function_name)
        .bind(call.parameters.to_string())
        .bind(call.parameters_hash)
        .bind(call.response_data.to_string())
        .bind(call.success)
        .bind(call.error_message)
        .bind(call.was_cached)
        .bind(call.cache_age_seconds)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("id"))
    }
}
