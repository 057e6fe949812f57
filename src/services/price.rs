//! Price oracle adapters.
//!
//! The engine only needs a live quote per symbol. Anything that is not a
//! strictly positive finite number is `PriceUnavailable`.

use crate::error::{EngineError, Result};
use crate::types::{MarketData, MAX_SCALE};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Live price together with the bar it was quoted from.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveQuote {
    pub price: Decimal,
    pub market_data: MarketData,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_live_price(&self, symbol: &str) -> Result<Decimal>;

    /// Price and OHLCV snapshot from a single lookup. Defaults to a flat bar
    /// at the live price.
    async fn get_quote(&self, symbol: &str) -> Result<LiveQuote> {
        let price = self.get_live_price(symbol).await?;
        Ok(LiveQuote {
            price,
            market_data: MarketData::from_price(price),
        })
    }
}

/// Convert a wire quote to a decimal price.
pub fn quote_to_decimal(symbol: &str, value: f64) -> Result<Decimal> {
    if !value.is_finite() || value <= 0.0 {
        return Err(EngineError::PriceUnavailable(format!(
            "{}: invalid quote {}",
            symbol, value
        )));
    }
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(MAX_SCALE).normalize())
        .filter(|d| *d > Decimal::ZERO)
        .ok_or_else(|| EngineError::PriceUnavailable(format!("{}: unrepresentable quote", symbol)))
}

fn non_negative(value: Option<f64>) -> Decimal {
    value
        .filter(|v| v.is_finite() && *v >= 0.0)
        .and_then(Decimal::from_f64_retain)
        .map(|d| d.round_dp(MAX_SCALE).normalize())
        .unwrap_or_default()
}

// =============================================================================
// HTTP oracle
// =============================================================================

#[derive(Debug, Serialize)]
struct QuotesRequest<'a> {
    symbols: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    #[serde(default)]
    quotes: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    symbol: String,
    price: Option<f64>,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
}

/// Client for the market data service.
#[derive(Clone)]
pub struct HttpPriceOracle {
    client: Client,
    base_url: String,
}

impl HttpPriceOracle {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("Reckon/0.1 (Order Execution Engine)")
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::PriceUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!("{}/api/market/quotes", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&QuotesRequest {
                symbols: vec![symbol],
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::PriceUnavailable(format!(
                "{}: market service returned {}",
                symbol,
                response.status()
            )));
        }

        let body: QuotesResponse = response.json().await?;
        body.quotes
            .into_iter()
            .find(|q| q.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| EngineError::PriceUnavailable(format!("{}: no quote returned", symbol)))
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn get_live_price(&self, symbol: &str) -> Result<Decimal> {
        let quote = self.fetch_quote(symbol).await?;
        let price = quote_to_decimal(symbol, quote.price.unwrap_or(f64::NAN))?;
        debug!("Quote {} = {}", symbol, price);
        Ok(price)
    }

    async fn get_quote(&self, symbol: &str) -> Result<LiveQuote> {
        let quote = self.fetch_quote(symbol).await?;
        let price = quote_to_decimal(symbol, quote.price.unwrap_or(f64::NAN))?;
        debug!("Quote {} = {}", symbol, price);

        let mut data = MarketData::from_price(price);
        if quote.open.is_some() {
            data.open = non_negative(quote.open);
        }
        if quote.close.is_some() {
            data.close = non_negative(quote.close);
        }
        if quote.high.is_some() && quote.low.is_some() {
            data.high = non_negative(quote.high);
            data.low = non_negative(quote.low);
        }
        data.volume = non_negative(quote.volume);

        // An inconsistent bar from upstream is replaced by a flat one.
        if data.validate().is_err() {
            data = MarketData::from_price(price);
        }
        Ok(LiveQuote {
            price,
            market_data: data,
        })
    }
}

// =============================================================================
// Static oracle
// =============================================================================

/// In-process quote table.
#[derive(Default)]
pub struct StaticPriceOracle {
    prices: DashMap<String, Decimal>,
    calls: AtomicUsize,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, symbol: &str, price: Decimal) -> Self {
        self.set_price(symbol, price);
        self
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_uppercase(), price);
    }

    /// Make the symbol unavailable.
    pub fn remove(&self, symbol: &str) {
        self.prices.remove(&symbol.to_uppercase());
    }

    /// Number of quote lookups served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn get_live_price(&self, symbol: &str) -> Result<Decimal> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.prices.get(&symbol.to_uppercase()) {
            Some(price) if *price > Decimal::ZERO => Ok(*price),
            Some(price) => Err(EngineError::PriceUnavailable(format!(
                "{}: non-positive quote {}",
                symbol, *price
            ))),
            None => Err(EngineError::PriceUnavailable(format!("{}: no quote", symbol))),
        }
    }
}

// =============================================================================
// Per-invocation memo
// =============================================================================

/// Caches successful quotes for the lifetime of one evaluation pass.
pub struct QuoteCache<'a> {
    oracle: &'a dyn PriceOracle,
    quotes: HashMap<String, Decimal>,
}

impl<'a> QuoteCache<'a> {
    pub fn new(oracle: &'a dyn PriceOracle) -> Self {
        Self {
            oracle,
            quotes: HashMap::new(),
        }
    }

    pub async fn price(&mut self, symbol: &str) -> Result<Decimal> {
        if let Some(price) = self.quotes.get(symbol) {
            return Ok(*price);
        }
        let price = self.oracle.get_live_price(symbol).await?;
        self.quotes.insert(symbol.to_string(), price);
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quote_conversion() {
        assert_eq!(quote_to_decimal("AAPL", 150.25).unwrap(), dec!(150.25));
        assert!(quote_to_decimal("AAPL", 0.0).is_err());
        assert!(quote_to_decimal("AAPL", -1.0).is_err());
        assert!(quote_to_decimal("AAPL", f64::NAN).is_err());
        assert!(quote_to_decimal("AAPL", f64::INFINITY).is_err());
    }

    #[tokio::test]
    async fn test_static_oracle() {
        let oracle = StaticPriceOracle::new().with_price("aapl", dec!(150));
        assert_eq!(oracle.get_live_price("AAPL").await.unwrap(), dec!(150));

        oracle.remove("AAPL");
        let err = oracle.get_live_price("AAPL").await.unwrap_err();
        assert!(matches!(err, EngineError::PriceUnavailable(_)));

        assert!(oracle.get_quote("MSFT").await.is_err());
    }

    #[tokio::test]
    async fn test_default_quote_is_one_lookup() {
        let oracle = StaticPriceOracle::new().with_price("AAPL", dec!(150));
        let quote = oracle.get_quote("AAPL").await.unwrap();

        assert_eq!(quote.price, dec!(150));
        assert_eq!(quote.market_data, MarketData::from_price(dec!(150)));
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_quote_cache_fetches_once_per_symbol() {
        let oracle = StaticPriceOracle::new()
            .with_price("AAPL", dec!(150))
            .with_price("MSFT", dec!(300));
        let mut cache = QuoteCache::new(&oracle);

        cache.price("AAPL").await.unwrap();
        cache.price("AAPL").await.unwrap();
        cache.price("MSFT").await.unwrap();
        assert_eq!(oracle.calls(), 2);
    }
}
