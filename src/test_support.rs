//! Fixtures and mock sources/submitters for unit tests.

use crate::arbitrage::executor::route_gross_profit;
use crate::arbitrage::{AnalyzerConfig, CoordinatorSettings, CycleArbitrage, Strategy, TradeSubmitter};
use crate::collector::MarketSource;
use crate::config::BotConfig;
use crate::error::{ExecutionError, SourceError};
use crate::market::SnapshotStore;
use crate::types::{
    GasBid, LegSide, MarketKey, MarketQuote, MarketSnapshotEntry, Opportunity, TradeLeg, TxOutcome,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GAS_PRICE: f64 = 0.000025;

pub fn quote(chain: &str, venue: &str, pair: &str, price: f64) -> MarketQuote {
    MarketQuote {
        chain_id: chain.to_string(),
        venue_id: venue.to_string(),
        pair: pair.to_string(),
        price,
        available_liquidity: 10.0,
        gas_price_estimate: GAS_PRICE,
        observed_at: None,
    }
}

pub fn snapshot_entry(chain: &str, venue: &str, pair: &str, price: f64) -> MarketSnapshotEntry {
    MarketSnapshotEntry {
        key: MarketKey::new(chain, venue, pair),
        price,
        available_liquidity: 10.0,
        gas_price_estimate: GAS_PRICE,
        observed_at: Utc::now() - chrono::Duration::seconds(1),
        source_sequence: 1,
    }
}

pub fn leg(venue: &str, side: LegSide, price: f64, base_amount: f64) -> TradeLeg {
    TradeLeg {
        key: MarketKey::new("eth", venue, "ETH/USDC"),
        side,
        price,
        base_amount,
        entry_observed_at: Utc::now(),
        entry_sequence: 1,
    }
}

pub fn analyzer_config() -> AnalyzerConfig {
    AnalyzerConfig {
        min_profit_threshold: 0.01,
        max_trade_amount: 1.0,
        gas_limit: 300_000,
        gas_per_leg: 100_000,
        max_leg_count: 2,
    }
}

pub fn coordinator_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        staleness_bound: Duration::from_secs(30),
        price_tolerance: 0.005,
        gas_limit: 300_000,
        gas_bump_factor: 1.125,
        max_retries: 3,
        submit_timeout: Duration::from_secs(1),
        max_concurrent_executions: 4,
        record_retention: Duration::from_secs(300),
    }
}

pub fn test_config() -> BotConfig {
    BotConfig {
        rpc_endpoints: vec!["https://rpc.test".to_string()],
        ..BotConfig::default()
    }
}

/// Store holding ETH/USDC on `venue-a` and `venue-b`.
pub fn seeded_store(price_a: f64, price_b: f64) -> Arc<SnapshotStore> {
    let store = Arc::new(SnapshotStore::new());
    store.write_batch(vec![
        snapshot_entry("eth", "venue-a", "ETH/USDC", price_a),
        snapshot_entry("eth", "venue-b", "ETH/USDC", price_b),
    ]);
    store
}

/// Best opportunity in the store's current snapshot.
pub fn opportunity_for(store: &SnapshotStore) -> Opportunity {
    CycleArbitrage::new(analyzer_config())
        .analyze(&store.snapshot())
        .into_iter()
        .next()
        .expect("store holds a profitable route")
}

/// Always answers with a transport error.
pub struct FailingSource {
    id: String,
}

impl FailingSource {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl MarketSource for FailingSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_market_data(&self) -> Result<Vec<MarketQuote>, SourceError> {
        Err(SourceError::Transport("connection refused".into()))
    }
}

/// Answers only after `delay`.
pub struct SlowSource {
    id: String,
    delay: Duration,
}

impl SlowSource {
    pub fn new(id: &str, delay: Duration) -> Self {
        Self {
            id: id.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl MarketSource for SlowSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_market_data(&self) -> Result<Vec<MarketQuote>, SourceError> {
        tokio::time::sleep(self.delay).await;
        Ok(vec![quote("eth", &self.id, "ETH/USDC", 2000.0)])
    }
}

fn settled(legs: &[TradeLeg]) -> TxOutcome {
    TxOutcome {
        tx_hash: format!("0x{}", "a".repeat(64)),
        gross_proceeds: route_gross_profit(legs),
        gas_used: 100_000 * legs.len() as u64,
    }
}

/// Counts calls and settles every submission.
#[derive(Default)]
pub struct CountingSubmitter {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TradeSubmitter for CountingSubmitter {
    fn name(&self) -> &str {
        "counting"
    }

    async fn submit(
        &self,
        _opportunity_id: &str,
        legs: &[TradeLeg],
        _bid: GasBid,
    ) -> Result<TxOutcome, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(settled(legs))
    }
}

/// Replays scripted results in order, then settles.
pub struct ScriptedSubmitter {
    script: Mutex<VecDeque<Result<TxOutcome, ExecutionError>>>,
    bids: Mutex<Vec<GasBid>>,
    keys: Mutex<Vec<String>>,
}

impl ScriptedSubmitter {
    pub fn new(script: Vec<Result<TxOutcome, ExecutionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            bids: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn bids(&self) -> Vec<GasBid> {
        self.bids.lock().unwrap().clone()
    }

    /// Opportunity ids seen, one per attempt.
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl TradeSubmitter for ScriptedSubmitter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(
        &self,
        opportunity_id: &str,
        legs: &[TradeLeg],
        bid: GasBid,
    ) -> Result<TxOutcome, ExecutionError> {
        self.bids.lock().unwrap().push(bid);
        self.keys.lock().unwrap().push(opportunity_id.to_string());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(settled(legs)))
    }
}

/// Settles every submission after `delay`.
pub struct DelayedSubmitter {
    delay: Duration,
    pub settled: AtomicUsize,
}

impl DelayedSubmitter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            settled: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TradeSubmitter for DelayedSubmitter {
    fn name(&self) -> &str {
        "delayed"
    }

    async fn submit(
        &self,
        _opportunity_id: &str,
        legs: &[TradeLeg],
        _bid: GasBid,
    ) -> Result<TxOutcome, ExecutionError> {
        tokio::time::sleep(self.delay).await;
        self.settled.fetch_add(1, Ordering::SeqCst);
        Ok(settled(legs))
    }
}
