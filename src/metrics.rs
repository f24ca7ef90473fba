//! Performance counters
//!
//! Process-wide accumulators written only by the execution coordinator.
//! Everyone else reads a `CountersSnapshot`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CounterState {
    opportunities_detected: u64,
    trades_executed: u64,
    trades_abandoned: u64,
    total_profit: f64,
    total_gas_cost: f64,
    largest_profit: f64,
    reset_at: DateTime<Utc>,
}

impl Default for CounterState {
    fn default() -> Self {
        Self {
            opportunities_detected: 0,
            trades_executed: 0,
            trades_abandoned: 0,
            total_profit: 0.0,
            total_gas_cost: 0.0,
            largest_profit: 0.0,
            reset_at: Utc::now(),
        }
    }
}

/// Shared counters; mutation is crate-private.
#[derive(Debug, Default)]
pub struct PerformanceCounters {
    state: RwLock<CounterState>,
}

impl PerformanceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn reset(&self) {
        *self.state.write().await = CounterState::default();
    }

    pub(crate) async fn record_detected(&self, count: usize) {
        self.state.write().await.opportunities_detected += count as u64;
    }

    pub(crate) async fn record_completed(&self, realized_profit: f64, gas_cost: f64) {
        let mut state = self.state.write().await;
        state.trades_executed += 1;
        state.total_profit += realized_profit;
        state.total_gas_cost += gas_cost;
        state.largest_profit = state.largest_profit.max(realized_profit);
    }

    pub(crate) async fn record_abandoned(&self) {
        self.state.write().await.trades_abandoned += 1;
    }

    /// Read-only copy for display.
    pub async fn snapshot(&self) -> CountersSnapshot {
        let state = self.state.read().await;
        let finished = state.trades_executed + state.trades_abandoned;
        CountersSnapshot {
            opportunities_detected: state.opportunities_detected,
            trades_executed: state.trades_executed,
            trades_abandoned: state.trades_abandoned,
            total_profit: state.total_profit,
            total_gas_cost: state.total_gas_cost,
            largest_profit: state.largest_profit,
            success_rate: if finished > 0 {
                state.trades_executed as f64 / finished as f64
            } else {
                0.0
            },
            average_profit: if state.trades_executed > 0 {
                state.total_profit / state.trades_executed as f64
            } else {
                0.0
            },
            since: state.reset_at,
        }
    }
}

/// Point-in-time copy of the performance counters.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    /// Distinct opportunities claimed for execution. Ids already owned and
    /// those cut by the per-cycle limit are not counted.
    pub opportunities_detected: u64,
    pub trades_executed: u64,
    pub trades_abandoned: u64,
    pub total_profit: f64,
    pub total_gas_cost: f64,
    pub largest_profit: f64,
    /// Completed over terminal executions.
    pub success_rate: f64,
    pub average_profit: f64,
    pub since: DateTime<Utc>,
}

impl CountersSnapshot {
    /// Render a text report.
    pub fn report(&self) -> String {
        let mut report = String::new();
        report.push_str("═══════════════════════════════════════════════\n");
        report.push_str("  OMNIARB SESSION SUMMARY\n");
        report.push_str("═══════════════════════════════════════════════\n");
        report.push_str(&format!("  Since:                 {}\n", self.since.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("  Opportunities found:   {}\n", self.opportunities_detected));
        report.push_str(&format!("  Trades executed:       {}\n", self.trades_executed));
        report.push_str(&format!("  Trades abandoned:      {}\n", self.trades_abandoned));
        report.push_str(&format!("  Success rate:          {:.1}%\n", self.success_rate * 100.0));
        report.push_str(&format!("  Total profit:          {:.4}\n", self.total_profit));
        report.push_str(&format!("  Average profit:        {:.4}\n", self.average_profit));
        report.push_str(&format!("  Largest profit:        {:.4}\n", self.largest_profit));
        report.push_str(&format!("  Total gas cost:        {:.4}\n", self.total_gas_cost));
        report.push_str("═══════════════════════════════════════════════\n");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rates_and_averages() {
        let counters = PerformanceCounters::new();
        counters.record_detected(4).await;
        counters.record_completed(50.0, 5.0).await;
        counters.record_completed(30.0, 5.0).await;
        counters.record_abandoned().await;

        let snap = counters.snapshot().await;
        assert_eq!(snap.opportunities_detected, 4);
        assert_eq!(snap.trades_executed, 2);
        assert!((snap.success_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(snap.average_profit, 40.0);
        assert_eq!(snap.total_gas_cost, 10.0);
        assert_eq!(snap.largest_profit, 50.0);
        assert!(snap.report().contains("Trades executed:       2"));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let counters = PerformanceCounters::new();
        counters.record_completed(10.0, 1.0).await;
        counters.reset().await;

        let snap = counters.snapshot().await;
        assert_eq!(snap.trades_executed, 0);
        assert_eq!(snap.total_profit, 0.0);
        assert_eq!(snap.success_rate, 0.0);
    }
}
