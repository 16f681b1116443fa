//! Trading Floor - scheduled paper-trading loop for AI trader personalities
//!
//! Startup order:
//! 1. Load settings (.env + trading-floor.toml + TRADING_FLOOR__* env)
//! 2. Open storage (SQLite or Postgres from the database URL) and init schema
//! 3. Wire cache, market gateway and ledger
//! 4. Run the supervised trading cycle loop

use std::sync::Arc;

use tracing::info;

use trading_floor::floor::{FloorOptions, TradingFloor};
use trading_floor::market::{
    AlphaVantageProvider, MarketDataGateway, PolygonProvider, TtlPolicy,
};
use trading_floor::{CacheStore, HoldEngine, Ledger, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real deployments use actual environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting Trading Floor...");

    let settings = Settings::load()?;
    info!(
        "{} trader(s) configured, cycle every {}s, database: {}",
        settings.traders.len(),
        settings.cycle_seconds,
        settings.database_url
    );

    let storage = trading_floor::storage::open(&settings.database_url).await?;
    storage.init_schema().await?;

    let cache = Arc::new(CacheStore::new(storage.clone()));
    let gateway = Arc::new(MarketDataGateway::new(
        cache,
        PolygonProvider::new(&settings.polygon_base_url, &settings.polygon_api_key)?,
        AlphaVantageProvider::new(
            &settings.alpha_vantage_base_url,
            &settings.alpha_vantage_api_key,
        )?,
        TtlPolicy::from(&settings.ttl),
    ));

    let ledger = Arc::new(Ledger::new(
        storage,
        gateway.clone(),
        settings.initial_balance,
        settings.spread,
    ));

    let floor = TradingFloor::new(
        ledger,
        gateway.clone(),
        gateway.clone(),
        gateway,
        Arc::new(HoldEngine),
        FloorOptions::from(&settings),
    );

    floor.run().await
}
