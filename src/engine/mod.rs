//! Pipeline engine
//!
//! Lifecycle and scheduling for the Sense -> Think -> Execute loop.

pub mod orchestrator;

pub use orchestrator::{CycleSummary, NeuralOrchestrator, RunSummary};
