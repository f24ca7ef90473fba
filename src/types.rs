//! Core data structures shared by the Sense, Think and Execute stages.
//!
//! Prices are always quoted as units of QUOTE per one BASE for a pair
//! written `BASE/QUOTE`. Liquidity is measured in BASE units, gas price
//! estimates in QUOTE units per gas unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one market: a trading pair on a venue on a chain.
///
/// Ordered so that every walk over a snapshot is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketKey {
    pub chain_id: String,
    pub venue_id: String,
    pub pair: String,
}

impl MarketKey {
    pub fn new(chain_id: &str, venue_id: &str, pair: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            venue_id: venue_id.to_string(),
            pair: pair.to_string(),
        }
    }

    /// Split `BASE/QUOTE` into its assets. None if the pair is not of that form.
    pub fn assets(&self) -> Option<(&str, &str)> {
        let (base, quote) = self.pair.split_once('/')?;
        let (base, quote) = (base.trim(), quote.trim());
        if base.is_empty() || quote.is_empty() || base == quote || quote.contains('/') {
            return None;
        }
        Some((base, quote))
    }
}

impl fmt::Display for MarketKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.venue_id, self.pair)
    }
}

/// Raw market state as returned by a source, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub chain_id: String,
    pub venue_id: String,
    pub pair: String,
    pub price: f64,
    #[serde(alias = "liquidity")]
    pub available_liquidity: f64,
    #[serde(default, alias = "gas_price")]
    pub gas_price_estimate: f64,
    /// Source-side observation time; the collector stamps fetch time when absent.
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl MarketQuote {
    pub fn key(&self) -> MarketKey {
        MarketKey::new(&self.chain_id, &self.venue_id, &self.pair)
    }
}

/// One versioned observation of a market, owned by the snapshot store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshotEntry {
    pub key: MarketKey,
    pub price: f64,
    pub available_liquidity: f64,
    pub gas_price_estimate: f64,
    pub observed_at: DateTime<Utc>,
    pub source_sequence: u64,
}

impl MarketSnapshotEntry {
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.observed_at
    }
}

/// Direction of a trade leg against its pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LegSide {
    /// Spend QUOTE, receive BASE.
    Buy,
    /// Spend BASE, receive QUOTE.
    Sell,
}

impl fmt::Display for LegSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LegSide::Buy => write!(f, "buy"),
            LegSide::Sell => write!(f, "sell"),
        }
    }
}

/// One swap within an arbitrage route, pinned to the entry it was priced from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub key: MarketKey,
    pub side: LegSide,
    /// Entry price the leg was analyzed at (QUOTE per BASE).
    pub price: f64,
    /// BASE units this leg moves through the pool.
    pub base_amount: f64,
    pub entry_observed_at: DateTime<Utc>,
    pub entry_sequence: u64,
}

impl TradeLeg {
    /// Conversion rate from the asset spent to the asset received.
    pub fn rate(&self) -> f64 {
        match self.side {
            LegSide::Buy => 1.0 / self.price,
            LegSide::Sell => self.price,
        }
    }
}

/// A ranked arbitrage route derived from one market snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Hex SHA-256 over the strategy name and the legs' input entries.
    pub id: String,
    pub strategy: String,
    pub legs: Vec<TradeLeg>,
    /// Asset the route starts and ends in; profits are denominated in it.
    pub start_asset: String,
    /// Notional committed at the first leg, in the start asset.
    pub trade_amount: f64,
    pub expected_gross_profit: f64,
    pub estimated_gas_cost: f64,
    pub expected_net_profit: f64,
    pub gas_units: u64,
    pub snapshot_version: u64,
    pub snapshot_taken_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn profit_ratio(&self) -> f64 {
        if self.trade_amount <= 0.0 {
            return 0.0;
        }
        self.expected_net_profit / self.trade_amount
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> &str {
        &self.id[..12.min(self.id.len())]
    }

    pub fn route(&self) -> String {
        self.legs
            .iter()
            .map(|leg| format!("{} {}", leg.side, leg.key))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Opportunity({} | {} | net {:.4} {} | {:.2}%)",
            self.short_id(),
            self.route(),
            self.expected_net_profit,
            self.start_asset,
            self.profit_ratio() * 100.0
        )
    }
}

/// Gas bid attached to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GasBid {
    /// Price per gas unit, in the route's start asset.
    pub price_per_gas: f64,
    pub gas_limit: u64,
}

impl GasBid {
    pub fn bumped(self, factor: f64) -> Self {
        Self {
            price_per_gas: self.price_per_gas * factor,
            gas_limit: self.gas_limit,
        }
    }
}

/// Settlement result reported by a submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub tx_hash: String,
    /// Proceeds over the committed notional, before gas, in the start asset.
    pub gross_proceeds: f64,
    pub gas_used: u64,
}
