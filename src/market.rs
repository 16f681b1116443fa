//! Market data - upstream providers and the cache-first gateway
//!
//! Two HTTP providers (Polygon for prices, Alpha Vantage for search and
//! news) sit behind `MarketDataGateway`, which consults the `CacheStore`
//! before every upstream call and audits every response, success or
//! failure. Base URLs are injectable so tests can point providers at a
//! local mock server.
//!
//! "No data" (a clean response with nothing in it) is `Ok(None)`; only a
//! failed upstream call is an error. Callers never receive a fabricated
//! price.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::error::MarketError;
use crate::schedule::{eastern_now, timestamp_string};

/// Seam for anything that can price a symbol right now
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Best available current price, or None when the symbol cannot be
    /// priced. Implementations must not guess.
    async fn current_price(&self, symbol: &str) -> Option<Decimal>;
}

/// Seam for the upstream market open/closed probe
#[async_trait]
pub trait MarketStatusSource: Send + Sync {
    async fn reported_open(&self) -> Result<bool, MarketError>;
}

/// Seam for assembling the market briefing fed to decision engines
#[async_trait]
pub trait MarketContextSource: Send + Sync {
    async fn market_context(&self, symbols: &[String]) -> Value;

    /// Coordinator callback with each cycle's open/closed verdict. The
    /// gateway uses it to pick snapshot TTLs; mocks can ignore it.
    fn note_market_state(&self, _open: bool) {}
}

/// Cache lifetimes per upstream function. Applied at read time, so
/// changing a value here re-ages every row already on disk.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub last_trade: Duration,
    pub last_quote: Duration,
    pub aggregates: Duration,
    /// Snapshot endpoints (gainers/losers) while the market is open
    pub snapshot_open: Duration,
    /// Snapshots barely move outside the session, so cache much longer
    pub snapshot_closed: Duration,
    pub indicators: Duration,
    pub market_status: Duration,
    pub symbol_search: Duration,
    pub news_sentiment: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            last_trade: Duration::from_secs(10),
            last_quote: Duration::from_secs(10),
            aggregates: Duration::from_secs(300),
            snapshot_open: Duration::from_secs(60),
            snapshot_closed: Duration::from_secs(3600),
            indicators: Duration::from_secs(3600),
            market_status: Duration::from_secs(300),
            symbol_search: Duration::from_secs(86_400),
            news_sentiment: Duration::from_secs(1800),
        }
    }
}

/// Thin client for the Polygon REST API
pub struct PolygonProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl PolygonProvider {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, MarketError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MarketError::upstream("polygon", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, MarketError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .query(&[("apiKey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| MarketError::upstream("polygon", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MarketError::upstream("polygon", format!("HTTP {status}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| MarketError::upstream("polygon", e))
    }
}

/// Thin client for the Alpha Vantage query API
pub struct AlphaVantageProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantageProvider {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, MarketError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MarketError::upstream("alpha_vantage", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Alpha Vantage is a single endpoint keyed by a `function` parameter
    async fn query(
        &self,
        function: &str,
        params: &[(String, String)],
    ) -> Result<Value, MarketError> {
        let url = format!("{}/query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("function", function)])
            .query(params)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| MarketError::upstream("alpha_vantage", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MarketError::upstream(
                "alpha_vantage",
                format!("HTTP {status}"),
            ));
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|e| MarketError::upstream("alpha_vantage", e))?;

        // The API reports quota exhaustion and bad requests as 200s with
        // an explanatory key; treat both as an unavailable upstream
        for key in ["Error Message", "Note", "Information"] {
            if let Some(message) = payload.get(key).and_then(Value::as_str) {
                return Err(MarketError::upstream("alpha_vantage", message));
            }
        }

        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MoverDirection {
    Gainers,
    Losers,
}

impl MoverDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Gainers => "gainers",
            Self::Losers => "losers",
        }
    }
}

/// Cache-first access to market data.
///
/// Every public operation follows the same path: hash the parameters,
/// serve a fresh-enough audit row if one exists, otherwise call upstream,
/// record the outcome and return the live payload.
pub struct MarketDataGateway {
    cache: Arc<CacheStore>,
    polygon: PolygonProvider,
    alpha: AlphaVantageProvider,
    ttl: TtlPolicy,
    /// Last observed open/closed state; drives snapshot TTL selection.
    /// Defaults to closed, which only makes caching more aggressive.
    market_open: AtomicBool,
}

impl MarketDataGateway {
    pub fn new(
        cache: Arc<CacheStore>,
        polygon: PolygonProvider,
        alpha: AlphaVantageProvider,
        ttl: TtlPolicy,
    ) -> Self {
        Self {
            cache,
            polygon,
            alpha,
            ttl,
            market_open: AtomicBool::new(false),
        }
    }

    /// Called by the coordinator once per cycle with the gate result
    pub fn set_market_open(&self, open: bool) {
        self.market_open.store(open, Ordering::Relaxed);
    }

    fn snapshot_ttl(&self) -> Duration {
        if self.market_open.load(Ordering::Relaxed) {
            self.ttl.snapshot_open
        } else {
            self.ttl.snapshot_closed
        }
    }

    /// Cache-or-fetch for Polygon endpoints. Returns the raw payload; each
    /// operation extracts its own notion of "data" so cached no-data
    /// responses stay no-data for their full TTL.
    async fn polygon_cached(
        &self,
        function_name: &str,
        params: Value,
        path: String,
        query: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<Value, MarketError> {
        if let Some(hit) = self.cache.check("polygon", function_name, &params, ttl).await {
            return Ok(hit.payload);
        }

        match self.polygon.get_json(&path, &query).await {
            Ok(payload) => {
                self.cache
                    .save("polygon", function_name, &params, &payload, true, None)
                    .await;
                Ok(payload)
            }
            Err(e) => {
                self.cache
                    .save(
                        "polygon",
                        function_name,
                        &params,
                        &Value::Null,
                        false,
                        Some(&e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn alpha_cached(
        &self,
        function_name: &str,
        params: Value,
        query: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<Value, MarketError> {
        if let Some(hit) = self
            .cache
            .check("alpha_vantage", function_name, &params, ttl)
            .await
        {
            return Ok(hit.payload);
        }

        match self.alpha.query(function_name, &query).await {
            Ok(payload) => {
                self.cache
                    .save("alpha_vantage", function_name, &params, &payload, true, None)
                    .await;
                Ok(payload)
            }
            Err(e) => {
                self.cache
                    .save(
                        "alpha_vantage",
                        function_name,
                        &params,
                        &Value::Null,
                        false,
                        Some(&e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Most recent trade for a symbol
    pub async fn last_trade(&self, symbol: &str) -> Result<Option<Value>, MarketError> {
        let params = json!({ "ticker": symbol });
        let payload = self
            .polygon_cached(
                "last_trade",
                params,
                format!("/v2/last/trade/{symbol}"),
                Vec::new(),
                self.ttl.last_trade,
            )
            .await?;
        Ok(polygon_results(&payload))
    }

    /// Most recent NBBO quote for a symbol
    pub async fn last_quote(&self, symbol: &str) -> Result<Option<Value>, MarketError> {
        let params = json!({ "ticker": symbol });
        let payload = self
            .polygon_cached(
                "last_quote",
                params,
                format!("/v2/last/nbbo/{symbol}"),
                Vec::new(),
                self.ttl.last_quote,
            )
            .await?;
        Ok(polygon_results(&payload))
    }

    /// Daily OHLC bars over a trailing window
    pub async fn aggregates(
        &self,
        symbol: &str,
        timespan: &str,
        window_days: i64,
    ) -> Result<Option<Value>, MarketError> {
        let to = Utc::now().date_naive();
        let from = to - chrono::Duration::days(window_days);
        let (from, to) = (from.format("%Y-%m-%d").to_string(), to.format("%Y-%m-%d").to_string());

        let params = json!({
            "ticker": symbol,
            "timespan": timespan,
            "from": from,
            "to": to,
        });
        let payload = self
            .polygon_cached(
                "aggregates",
                params,
                format!("/v2/aggs/ticker/{symbol}/range/1/{timespan}/{from}/{to}"),
                vec![("limit".to_string(), "5000".to_string())],
                self.ttl.aggregates,
            )
            .await?;

        let empty = payload
            .get("resultsCount")
            .and_then(Value::as_i64)
            .is_some_and(|n| n == 0);
        if empty {
            return Ok(None);
        }
        Ok(polygon_results(&payload))
    }

    /// Technical indicator series (`macd`, `rsi` or `sma`)
    pub async fn indicator(
        &self,
        indicator: &str,
        symbol: &str,
    ) -> Result<Option<Value>, MarketError> {
        let params = json!({ "indicator": indicator, "ticker": symbol, "timespan": "day" });
        let payload = self
            .polygon_cached(
                indicator,
                params,
                format!("/v1/indicators/{indicator}/{symbol}"),
                vec![
                    ("timespan".to_string(), "day".to_string()),
                    ("series_type".to_string(), "close".to_string()),
                ],
                self.ttl.indicators,
            )
            .await?;
        Ok(polygon_results(&payload))
    }

    /// Market-wide top gainers or losers snapshot
    pub async fn movers(&self, direction: MoverDirection) -> Result<Option<Value>, MarketError> {
        let direction = direction.as_str();
        let params = json!({ "direction": direction });
        let payload = self
            .polygon_cached(
                direction,
                params,
                format!("/v2/snapshot/locale/us/markets/stocks/{direction}"),
                Vec::new(),
                self.snapshot_ttl(),
            )
            .await?;

        let tickers = payload.get("tickers").cloned();
        match tickers {
            Some(Value::Array(list)) if !list.is_empty() => Ok(Some(Value::Array(list))),
            _ => Ok(None),
        }
    }

    /// Most actively traded names, from the Alpha Vantage market snapshot
    pub async fn most_active(&self) -> Result<Option<Value>, MarketError> {
        let params = json!({});
        let payload = self
            .alpha_cached("TOP_GAINERS_LOSERS", params, Vec::new(), self.snapshot_ttl())
            .await?;

        match payload.get("most_actively_traded") {
            Some(Value::Array(list)) if !list.is_empty() => Ok(Some(Value::Array(list.clone()))),
            _ => Ok(None),
        }
    }

    /// Upstream open/closed report
    pub async fn market_status(&self) -> Result<bool, MarketError> {
        let params = json!({});
        let payload = self
            .polygon_cached(
                "market_status",
                params,
                "/v1/marketstatus/now".to_string(),
                Vec::new(),
                self.ttl.market_status,
            )
            .await?;

        Ok(payload.get("market").and_then(Value::as_str) == Some("open"))
    }

    /// Ticker lookup by keyword (Alpha Vantage)
    pub async fn symbol_search(&self, keywords: &str) -> Result<Option<Value>, MarketError> {
        let params = json!({ "keywords": keywords });
        let payload = self
            .alpha_cached(
                "SYMBOL_SEARCH",
                params,
                vec![("keywords".to_string(), keywords.to_string())],
                self.ttl.symbol_search,
            )
            .await?;

        match payload.get("bestMatches") {
            Some(Value::Array(matches)) if !matches.is_empty() => {
                Ok(Some(Value::Array(matches.clone())))
            }
            _ => Ok(None),
        }
    }

    /// Recent news with sentiment scores for a set of tickers
    pub async fn news_sentiment(&self, tickers: &[String]) -> Result<Option<Value>, MarketError> {
        let joined = tickers.join(",");
        let params = json!({ "tickers": joined });
        let payload = self
            .alpha_cached(
                "NEWS_SENTIMENT",
                params,
                vec![
                    ("tickers".to_string(), joined.clone()),
                    ("limit".to_string(), "10".to_string()),
                ],
                self.ttl.news_sentiment,
            )
            .await?;

        match payload.get("feed") {
            Some(Value::Array(feed)) if !feed.is_empty() => Ok(Some(Value::Array(feed.clone()))),
            _ => Ok(None),
        }
    }
}

/// Polygon envelope: data lives under `results` when `status` is OK
fn polygon_results(payload: &Value) -> Option<Value> {
    let ok = matches!(
        payload.get("status").and_then(Value::as_str),
        Some("OK") | Some("success")
    );
    if !ok {
        return None;
    }
    match payload.get("results") {
        Some(Value::Null) | None => None,
        Some(results) => Some(results.clone()),
    }
}

fn decimal_field(results: &Value, key: &str) -> Option<Decimal> {
    results.get(key).and_then(Value::as_f64).and_then(Decimal::from_f64)
}

#[async_trait]
impl PriceSource for MarketDataGateway {
    /// Resolution order: last trade price, else NBBO bid/ask midpoint,
    /// else unpriceable. A zero or negative price is never a price - a
    /// zeroed trade falls through to the quote, and the midpoint only
    /// counts when bid and ask are both positive.
    async fn current_price(&self, symbol: &str) -> Option<Decimal> {
        match self.last_trade(symbol).await {
            Ok(Some(results)) => match decimal_field(&results, "p") {
                Some(price) if price > Decimal::ZERO => return Some(price),
                Some(_) => debug!("Zero-priced last trade for {}, trying quote", symbol),
                None => {}
            },
            Ok(None) => debug!("No last trade for {}", symbol),
            Err(e) => warn!("Last trade fetch failed for {}: {}", symbol, e),
        }

        match self.last_quote(symbol).await {
            Ok(Some(results)) => {
                let ask = decimal_field(&results, "P");
                let bid = decimal_field(&results, "p");
                match (ask, bid) {
                    (Some(ask), Some(bid)) if ask > Decimal::ZERO && bid > Decimal::ZERO => {
                        Some((ask + bid) / Decimal::TWO)
                    }
                    _ => None,
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Quote fetch failed for {}: {}", symbol, e);
                None
            }
        }
    }
}

#[async_trait]
impl MarketStatusSource for MarketDataGateway {
    async fn reported_open(&self) -> Result<bool, MarketError> {
        self.market_status().await
    }
}

#[async_trait]
impl MarketContextSource for MarketDataGateway {
    /// Best-effort briefing for the decision engine. Sections that fail to
    /// fetch are simply absent; a degraded briefing beats no decision.
    async fn market_context(&self, symbols: &[String]) -> Value {
        let mut context = json!({
            "as_of": timestamp_string(&eastern_now()),
            "market_open": self.market_open.load(Ordering::Relaxed),
        });

        if let Ok(Some(gainers)) = self.movers(MoverDirection::Gainers).await {
            context["top_gainers"] = gainers;
        }
        if let Ok(Some(losers)) = self.movers(MoverDirection::Losers).await {
            context["top_losers"] = losers;
        }

        let mut quotes = serde_json::Map::new();
        for symbol in symbols {
            if let Some(price) = self.current_price(symbol).await {
                quotes.insert(symbol.clone(), json!(price));
            }
        }
        if !quotes.is_empty() {
            context["holdings_prices"] = Value::Object(quotes);
        }

        if !symbols.is_empty() {
            if let Ok(Some(news)) = self.news_sentiment(symbols).await {
                context["news"] = news;
            }
        }

        context
    }

    fn note_market_state(&self, open: bool) {
        self.set_market_open(open);
    }
}
