//! Market state module
//!
//! Versioned store of the newest observation per market and the immutable
//! snapshots the analyzer reads.

pub mod snapshot;
pub mod store;

pub use snapshot::{MarketSnapshot, SnapshotExport};
pub use store::SnapshotStore;
