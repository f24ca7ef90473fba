//! Point-in-time market view
//!
//! A `MarketSnapshot` shares the store's map at the instant it was taken.
//! Later writes copy the map, so the view never changes underneath a reader.

use crate::types::{MarketKey, MarketSnapshotEntry};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Immutable, consistent view of the snapshot store.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    version: u64,
    taken_at: DateTime<Utc>,
    entries: Arc<BTreeMap<MarketKey, MarketSnapshotEntry>>,
}

impl MarketSnapshot {
    pub(crate) fn new(
        version: u64,
        taken_at: DateTime<Utc>,
        entries: Arc<BTreeMap<MarketKey, MarketSnapshotEntry>>,
    ) -> Self {
        Self {
            version,
            taken_at,
            entries,
        }
    }

    /// Build a snapshot directly from entries (analysis of recorded data, tests).
    /// Later entries for the same key replace earlier ones.
    pub fn from_entries<I>(version: u64, taken_at: DateTime<Utc>, entries: I) -> Self
    where
        I: IntoIterator<Item = MarketSnapshotEntry>,
    {
        let map = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Self::new(version, taken_at, Arc::new(map))
    }

    /// Store write generation at capture time.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn get(&self, key: &MarketKey) -> Option<&MarketSnapshotEntry> {
        self.entries.get(key)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &MarketSnapshotEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn export(&self) -> SnapshotExport {
        SnapshotExport {
            version: self.version,
            taken_at: self.taken_at,
            entries: self.entries.values().cloned().collect(),
        }
    }
}

/// Serializable form of a snapshot, written by the data collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotExport {
    pub version: u64,
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<MarketSnapshotEntry>,
}

impl SnapshotExport {
    /// Write as pretty JSON through a temp file and rename.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize snapshot")?;
        let temp_path = path.as_ref().with_extension("tmp");
        std::fs::write(&temp_path, json).context("Failed to write temp file")?;
        std::fs::rename(&temp_path, path.as_ref()).context("Failed to rename temp file")?;
        Ok(())
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        serde_json::from_str(&content).context("Failed to parse snapshot file")
    }

    /// Rebuild a snapshot for offline analysis.
    pub fn into_snapshot(self) -> MarketSnapshot {
        MarketSnapshot::from_entries(self.version, self.taken_at, self.entries)
    }
}
