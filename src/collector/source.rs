//! Market data sources
//!
//! A `MarketSource` returns raw quotes for the markets it covers. The
//! collector owns timeouts and validation; sources only fetch.

use crate::error::SourceError;
use crate::types::{MarketKey, MarketQuote};
use async_trait::async_trait;
use std::sync::RwLock;
use tracing::debug;

/// Capability: produce market quotes for one upstream.
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Stable identifier used in logs, health tracking and sequence numbering.
    fn id(&self) -> &str;

    async fn fetch_market_data(&self) -> Result<Vec<MarketQuote>, SourceError>;
}

/// Polls an HTTP endpoint that answers with a JSON array of quotes.
pub struct HttpMarketSource {
    id: String,
    url: String,
    client: reqwest::Client,
}

impl HttpMarketSource {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("omniarb-bot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            id: id.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl MarketSource for HttpMarketSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_market_data(&self) -> Result<Vec<MarketQuote>, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            // without_url keeps API keys embedded in endpoint URLs out of logs
            .map_err(|e| SourceError::Transport(e.without_url().to_string()))?;

        let quotes: Vec<MarketQuote> = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.without_url().to_string()))?;

        debug!(source = %self.id, quotes = quotes.len(), "Fetched market data");
        Ok(quotes)
    }
}

/// Serves a fixed, replaceable set of quotes. Used for demos and replay.
pub struct StaticMarketSource {
    id: String,
    quotes: RwLock<Vec<MarketQuote>>,
}

impl StaticMarketSource {
    pub fn new(id: impl Into<String>, quotes: Vec<MarketQuote>) -> Self {
        Self {
            id: id.into(),
            quotes: RwLock::new(quotes),
        }
    }

    pub fn replace_quotes(&self, quotes: Vec<MarketQuote>) {
        let mut guard = self
            .quotes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = quotes;
    }
}

#[async_trait]
impl MarketSource for StaticMarketSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_market_data(&self) -> Result<Vec<MarketQuote>, SourceError> {
        let guard = self
            .quotes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(guard.clone())
    }
}

/// Check a quote before it can reach the store.
pub fn validate_quote(quote: &MarketQuote) -> Result<(), SourceError> {
    let malformed = |reason: &str| {
        Err(SourceError::Malformed(format!(
            "{}:{}:{}: {}",
            quote.chain_id, quote.venue_id, quote.pair, reason
        )))
    };

    if quote.chain_id.trim().is_empty() || quote.venue_id.trim().is_empty() {
        return malformed("empty chain or venue id");
    }
    let key = MarketKey::new(&quote.chain_id, &quote.venue_id, &quote.pair);
    if key.assets().is_none() {
        return malformed("pair is not BASE/QUOTE");
    }
    if !(quote.price.is_finite() && quote.price > 0.0) {
        return malformed("price must be finite and positive");
    }
    if !(quote.available_liquidity.is_finite() && quote.available_liquidity >= 0.0) {
        return malformed("liquidity must be finite and non-negative");
    }
    if !(quote.gas_price_estimate.is_finite() && quote.gas_price_estimate >= 0.0) {
        return malformed("gas price must be finite and non-negative");
    }
    Ok(())
}
