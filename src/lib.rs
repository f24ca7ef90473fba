//! OmniArb Bot Library
//!
//! Multi-chain DEX arbitrage pipeline: the Sense collector keeps a versioned
//! market snapshot store fresh, the analyzer (Think) derives ranked
//! opportunities from one snapshot, and the execution coordinator (Execute)
//! drives each opportunity through a claim/submit/retry state machine.

pub mod arbitrage;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod market;
pub mod metrics;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use arbitrage::{
    CycleArbitrage, DryRunSubmitter, ExecutionCoordinator, ExecutionRecord, ExecutionState,
    RelaySubmitter, Strategy, TradeSubmitter,
};
pub use collector::{HttpMarketSource, MarketSource, SenseCollector, StaticMarketSource};
pub use config::BotConfig;
pub use engine::{CycleSummary, NeuralOrchestrator, RunSummary};
pub use error::{AbandonReason, ConfigError, ExecutionError, PipelineError, SourceError};
pub use market::{MarketSnapshot, SnapshotStore};
pub use metrics::{CountersSnapshot, PerformanceCounters};
pub use types::{MarketKey, MarketQuote, MarketSnapshotEntry, Opportunity, TradeLeg};
