//! Opportunity Analyzer
//!
//! Walks a market snapshot for closed conversion cycles (2 up to
//! `max_leg_count` legs, each on a distinct market) and keeps those whose
//! modeled net profit clears `min_profit_threshold`.
//!
//! Every market `BASE/QUOTE` at price `p` yields two directed edges:
//! BASE -> QUOTE at rate `p` (sell) and QUOTE -> BASE at rate `1/p` (buy).
//!
//! Analysis is pure: no I/O, no shared state. The same snapshot always
//! yields the same opportunities in the same order.

use crate::config::BotConfig;
use crate::market::MarketSnapshot;
use crate::types::{LegSide, MarketSnapshotEntry, Opportunity, TradeLeg};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Capability: turn a snapshot into ranked opportunities.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Ranked best first. Must be deterministic for a given snapshot.
    fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Opportunity>;
}

/// Analyzer tuning, derived from `BotConfig`.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub min_profit_threshold: f64,
    /// BASE units moved on a route's first leg.
    pub max_trade_amount: f64,
    pub gas_limit: u64,
    pub gas_per_leg: u64,
    pub max_leg_count: usize,
}

impl From<&BotConfig> for AnalyzerConfig {
    fn from(config: &BotConfig) -> Self {
        Self {
            min_profit_threshold: config.min_profit_threshold,
            max_trade_amount: config.max_trade_amount,
            gas_limit: config.gas_limit,
            gas_per_leg: config.gas_per_leg,
            max_leg_count: config.max_leg_count,
        }
    }
}

/// One directed conversion edge over a snapshot entry.
#[derive(Debug, Clone, Copy)]
struct Edge<'a> {
    entry: &'a MarketSnapshotEntry,
    side: LegSide,
    from: &'a str,
    to: &'a str,
    rate: f64,
}

impl Edge<'_> {
    /// Asset gas is quoted in for this market.
    fn quote_asset(&self) -> &str {
        match self.side {
            LegSide::Buy => self.from,
            LegSide::Sell => self.to,
        }
    }

    fn rank(&self) -> (&crate::types::MarketKey, LegSide) {
        (&self.entry.key, self.side)
    }

    /// True when `self` would be the canonical first leg of a cycle that
    /// currently starts at `start`: buys come before sells, then `(key, side)`.
    fn precedes(&self, start: &Edge) -> bool {
        match (self.side, start.side) {
            (LegSide::Buy, LegSide::Sell) => true,
            (LegSide::Sell, LegSide::Buy) => false,
            _ => self.rank() < start.rank(),
        }
    }
}

/// Cross-venue / cross-pair cycle arbitrage.
pub struct CycleArbitrage {
    config: AnalyzerConfig,
}

impl CycleArbitrage {
    pub const NAME: &'static str = "cycle-arbitrage";

    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn build_edges<'a>(snapshot: &'a MarketSnapshot) -> Vec<Edge<'a>> {
        let mut edges = Vec::with_capacity(snapshot.len() * 2);
        for entry in snapshot.iter() {
            if !(entry.price.is_finite() && entry.price > 0.0) {
                continue;
            }
            let Some((base, quote)) = entry.key.assets() else {
                continue;
            };
            edges.push(Edge {
                entry,
                side: LegSide::Buy,
                from: quote,
                to: base,
                rate: 1.0 / entry.price,
            });
            edges.push(Edge {
                entry,
                side: LegSide::Sell,
                from: base,
                to: quote,
                rate: entry.price,
            });
        }
        edges
    }

    /// Enumerate simple cycles, each reported once. The first leg is the
    /// smallest `(key, side)` buy in the cycle, or the smallest sell when the
    /// cycle has no buy.
    fn find_cycles<'a>(&self, edges: &[Edge<'a>]) -> Vec<Vec<Edge<'a>>> {
        let mut outgoing: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.from).or_default().push(idx);
        }

        let mut cycles = Vec::new();
        for (start_idx, start) in edges.iter().enumerate() {
            let mut path = vec![start_idx];
            let mut visited = vec![start.from, start.to];
            self.extend_path(edges, &outgoing, &mut path, &mut visited, &mut cycles);
        }
        cycles
    }

    fn extend_path<'a>(
        &self,
        edges: &[Edge<'a>],
        outgoing: &BTreeMap<&str, Vec<usize>>,
        path: &mut Vec<usize>,
        visited: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<Edge<'a>>>,
    ) {
        let start = edges[path[0]];
        let at = edges[path[path.len() - 1]].to;
        let Some(next) = outgoing.get(at) else {
            return;
        };

        for &idx in next {
            let edge = edges[idx];
            if path.iter().any(|&p| edges[p].entry.key == edge.entry.key) {
                continue;
            }
            if edge.precedes(&start) {
                continue;
            }

            if edge.to == start.from {
                let mut cycle: Vec<Edge<'a>> = path.iter().map(|&p| edges[p]).collect();
                cycle.push(edge);
                cycles.push(cycle);
            } else if path.len() + 1 < self.config.max_leg_count && !visited.contains(&edge.to) {
                path.push(idx);
                visited.push(edge.to);
                self.extend_path(edges, outgoing, path, visited, cycles);
                visited.pop();
                path.pop();
            }
        }
    }

    /// Price a cycle. None when it fails the gas, liquidity or profit gates.
    fn evaluate(&self, cycle: &[Edge], snapshot: &MarketSnapshot) -> Option<Opportunity> {
        let legs_count = cycle.len() as u64;
        let gas_units = self.config.gas_per_leg.checked_mul(legs_count)?;
        if gas_units > self.config.gas_limit {
            return None;
        }

        // assets[i] is held before leg i; cumulative[i] is units of assets[i]
        // per unit of the start asset.
        let mut assets = Vec::with_capacity(cycle.len() + 1);
        let mut cumulative = Vec::with_capacity(cycle.len() + 1);
        assets.push(cycle[0].from);
        cumulative.push(1.0_f64);
        for edge in cycle {
            assets.push(edge.to);
            cumulative.push(cumulative[cumulative.len() - 1] * edge.rate);
        }

        let trade_amount = match cycle[0].side {
            LegSide::Buy => self.config.max_trade_amount * cycle[0].entry.price,
            LegSide::Sell => self.config.max_trade_amount,
        };
        let round_trip = cumulative[cycle.len()];
        let gross = trade_amount * (round_trip - 1.0);

        let mut gas_cost = 0.0;
        let mut legs = Vec::with_capacity(cycle.len());
        for (i, edge) in cycle.iter().enumerate() {
            let leg_gas = edge.entry.gas_price_estimate * self.config.gas_per_leg as f64;
            let quote = edge.quote_asset();
            let position = assets.iter().position(|a| *a == quote)?;
            gas_cost += leg_gas / cumulative[position];

            let base_amount = match edge.side {
                LegSide::Buy => trade_amount * cumulative[i + 1],
                LegSide::Sell => trade_amount * cumulative[i],
            };
            if base_amount > edge.entry.available_liquidity {
                return None;
            }
            legs.push(TradeLeg {
                key: edge.entry.key.clone(),
                side: edge.side,
                price: edge.entry.price,
                base_amount,
                entry_observed_at: edge.entry.observed_at,
                entry_sequence: edge.entry.source_sequence,
            });
        }

        let net = gross - gas_cost;
        if !(net.is_finite() && net > 0.0) {
            return None;
        }
        if net / trade_amount < self.config.min_profit_threshold {
            return None;
        }

        Some(Opportunity {
            id: opportunity_id(self.name(), &legs),
            strategy: self.name().to_string(),
            start_asset: cycle[0].from.to_string(),
            legs,
            trade_amount,
            expected_gross_profit: gross,
            estimated_gas_cost: gas_cost,
            expected_net_profit: net,
            gas_units,
            snapshot_version: snapshot.version(),
            snapshot_taken_at: snapshot.taken_at(),
        })
    }
}

impl Strategy for CycleArbitrage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Vec<Opportunity> {
        let edges = Self::build_edges(snapshot);
        let mut opportunities: Vec<Opportunity> = self
            .find_cycles(&edges)
            .iter()
            .filter_map(|cycle| self.evaluate(cycle, snapshot))
            .collect();
        opportunities.sort_by(rank_opportunities);
        opportunities
    }
}

/// Net profit descending, then gas ascending, then id ascending.
pub fn rank_opportunities(a: &Opportunity, b: &Opportunity) -> Ordering {
    b.expected_net_profit
        .total_cmp(&a.expected_net_profit)
        .then_with(|| a.estimated_gas_cost.total_cmp(&b.estimated_gas_cost))
        .then_with(|| a.id.cmp(&b.id))
}

/// Hex SHA-256 over the strategy and each leg's input entry.
pub fn opportunity_id(strategy: &str, legs: &[TradeLeg]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy.as_bytes());
    for leg in legs {
        hasher.update([0u8]);
        hasher.update(leg.key.to_string().as_bytes());
        hasher.update(leg.side.to_string().as_bytes());
        hasher.update(leg.price.to_bits().to_be_bytes());
        hasher.update(leg.entry_observed_at.to_rfc3339().as_bytes());
        hasher.update(leg.entry_sequence.to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{analyzer_config, snapshot_entry};
    use chrono::Utc;

    fn snapshot(entries: Vec<MarketSnapshotEntry>) -> MarketSnapshot {
        MarketSnapshot::from_entries(7, Utc::now(), entries)
    }

    #[test]
    fn test_small_spread_excluded_after_gas() {
        // gross 20, gas 5, net 15 -> 0.75% < 1%
        let snap = snapshot(vec![
            snapshot_entry("eth", "venue-a", "ETH/USDC", 2000.0),
            snapshot_entry("eth", "venue-b", "ETH/USDC", 2020.0),
        ]);
        let analyzer = CycleArbitrage::new(analyzer_config());
        assert!(analyzer.analyze(&snap).is_empty());
    }

    #[test]
    fn test_wide_spread_included() {
        let snap = snapshot(vec![
            snapshot_entry("eth", "venue-a", "ETH/USDC", 2000.0),
            snapshot_entry("eth", "venue-b", "ETH/USDC", 2060.0),
        ]);
        let analyzer = CycleArbitrage::new(analyzer_config());
        let opps = analyzer.analyze(&snap);

        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_eq!(opp.legs.len(), 2);
        assert_eq!(opp.legs[0].side, LegSide::Buy);
        assert_eq!(opp.legs[0].key.venue_id, "venue-a");
        assert_eq!(opp.legs[1].side, LegSide::Sell);
        assert_eq!(opp.legs[1].key.venue_id, "venue-b");
        assert_eq!(opp.start_asset, "USDC");
        assert!((opp.trade_amount - 2000.0).abs() < 1e-9);
        assert!((opp.expected_gross_profit - 60.0).abs() < 1e-6);
        assert!((opp.estimated_gas_cost - 5.0).abs() < 1e-9);
        assert!((opp.expected_net_profit - 55.0).abs() < 1e-6);
        assert!((opp.profit_ratio() - 0.0275).abs() < 1e-9);
        assert_eq!(opp.gas_units, 200_000);
        assert_eq!(opp.snapshot_version, 7);
    }

    #[test]
    fn test_ranked_by_net_profit() {
        let snap = snapshot(vec![
            snapshot_entry("eth", "venue-a", "ETH/USDC", 2000.0),
            snapshot_entry("eth", "venue-b", "ETH/USDC", 2060.0),
            snapshot_entry("eth", "venue-c", "ETH/USDC", 2100.0),
        ]);
        let opps = CycleArbitrage::new(analyzer_config()).analyze(&snap);

        // a->c net 95, a->b net 55, b->c net 35
        assert_eq!(opps.len(), 3);
        for pair in opps.windows(2) {
            assert!(pair[0].expected_net_profit >= pair[1].expected_net_profit);
        }
        assert_eq!(opps[0].legs[1].key.venue_id, "venue-c");
        assert!(opps.iter().all(|o| o.profit_ratio() >= 0.01));
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let snap = snapshot(vec![
            snapshot_entry("eth", "venue-c", "ETH/USDC", 2100.0),
            snapshot_entry("bsc", "pancake", "ETH/USDC", 2055.0),
            snapshot_entry("eth", "venue-a", "ETH/USDC", 2000.0),
            snapshot_entry("eth", "venue-b", "ETH/USDC", 2060.0),
        ]);
        let mut config = analyzer_config();
        config.max_leg_count = 3;
        config.gas_limit = 300_000;
        let analyzer = CycleArbitrage::new(config);

        let first: Vec<String> = analyzer.analyze(&snap).into_iter().map(|o| o.id).collect();
        for _ in 0..5 {
            let again: Vec<String> = analyzer.analyze(&snap).into_iter().map(|o| o.id).collect();
            assert_eq!(first, again);
        }
        assert!(!first.is_empty());
    }

    #[test]
    fn test_triangular_route() {
        // 2000 USDC -> 1 ETH -> 0.05 BTC -> 2100 USDC
        let mut eth_btc = snapshot_entry("eth", "uniswap", "ETH/BTC", 0.05);
        eth_btc.gas_price_estimate = 0.000025 / 40_000.0;
        let snap = snapshot(vec![
            snapshot_entry("eth", "uniswap", "ETH/USDC", 2000.0),
            eth_btc,
            snapshot_entry("eth", "sushi", "BTC/USDC", 42000.0),
        ]);
        let mut config = analyzer_config();
        config.max_leg_count = 3;
        let opps = CycleArbitrage::new(config).analyze(&snap);

        let tri = opps
            .iter()
            .find(|o| o.legs.len() == 3)
            .expect("triangular cycle found");
        assert_eq!(tri.start_asset, "USDC");
        assert!((tri.expected_gross_profit - 100.0).abs() < 1e-6);
        assert!((tri.estimated_gas_cost - 7.5).abs() < 1e-6);
        assert_eq!(tri.gas_units, 300_000);
        // each rotation is reported once
        assert_eq!(opps.iter().filter(|o| o.legs.len() == 3).count(), 1);
    }

    #[test]
    fn test_sell_only_cycle_found() {
        // ETH -> 2000 USDC -> 1.01 ETH, both legs sells on inverse pairs
        let mut eth_usdc = snapshot_entry("eth", "venue-a", "ETH/USDC", 2000.0);
        let mut usdc_eth = snapshot_entry("eth", "venue-b", "USDC/ETH", 0.000505);
        for entry in [&mut eth_usdc, &mut usdc_eth] {
            entry.gas_price_estimate = 0.0;
            entry.available_liquidity = 10_000.0;
        }
        let mut config = analyzer_config();
        config.min_profit_threshold = 0.005;
        let opps = CycleArbitrage::new(config).analyze(&snapshot(vec![eth_usdc, usdc_eth]));

        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert!(opp.legs.iter().all(|leg| leg.side == LegSide::Sell));
        assert_eq!(opp.legs[0].key.venue_id, "venue-a");
        assert_eq!(opp.start_asset, "ETH");
        assert!((opp.trade_amount - 1.0).abs() < 1e-12);
        assert!((opp.expected_gross_profit - 0.01).abs() < 1e-9);
        assert!((opp.legs[1].base_amount - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_gas_limit_excludes_long_routes() {
        let snap = snapshot(vec![
            snapshot_entry("eth", "uniswap", "ETH/USDC", 2000.0),
            snapshot_entry("eth", "uniswap", "ETH/BTC", 0.05),
            snapshot_entry("eth", "sushi", "BTC/USDC", 42000.0),
        ]);
        let mut config = analyzer_config();
        config.max_leg_count = 3;
        config.gas_limit = 250_000;
        let opps = CycleArbitrage::new(config).analyze(&snap);
        assert!(opps.iter().all(|o| o.legs.len() == 2));
    }

    #[test]
    fn test_thin_liquidity_excluded() {
        let mut thin = snapshot_entry("eth", "venue-b", "ETH/USDC", 2060.0);
        thin.available_liquidity = 0.5;
        let snap = snapshot(vec![snapshot_entry("eth", "venue-a", "ETH/USDC", 2000.0), thin]);
        assert!(CycleArbitrage::new(analyzer_config()).analyze(&snap).is_empty());
    }

    #[test]
    fn test_id_changes_with_input_entries() {
        let a = snapshot(vec![
            snapshot_entry("eth", "venue-a", "ETH/USDC", 2000.0),
            snapshot_entry("eth", "venue-b", "ETH/USDC", 2060.0),
        ]);
        let mut bumped = snapshot_entry("eth", "venue-b", "ETH/USDC", 2060.0);
        bumped.source_sequence += 1;
        let b = snapshot(vec![snapshot_entry("eth", "venue-a", "ETH/USDC", 2000.0), bumped]);

        let analyzer = CycleArbitrage::new(analyzer_config());
        assert_ne!(analyzer.analyze(&a)[0].id, analyzer.analyze(&b)[0].id);
    }
}
