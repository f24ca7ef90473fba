//! Arbitrage Module
//!
//! Opportunity analysis (Think) and the execution state machine (Execute).

pub mod coordinator;
pub mod detector;
pub mod executor;
pub mod record;

pub use coordinator::{CoordinatorSettings, DispatchOutcome, ExecutionCoordinator};
pub use detector::{AnalyzerConfig, CycleArbitrage, Strategy};
pub use executor::{DryRunSubmitter, RelaySubmitter, TradeSubmitter};
pub use record::{ExecutionRecord, ExecutionState};
