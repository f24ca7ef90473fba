//! Market Snapshot Store
//!
//! The single mutable structure shared by the pipeline. All mutation goes
//! through `write`/`write_batch`/`evict_stale`; readers take a `MarketSnapshot`.
//!
//! The map lives behind an `Arc` and writers copy it when a snapshot still
//! holds the previous generation, so `snapshot()` is a pointer clone and a
//! snapshot contains exactly the entries present at one instant.

use crate::market::MarketSnapshot;
use crate::types::{MarketKey, MarketSnapshotEntry};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct StoreInner {
    entries: Arc<BTreeMap<MarketKey, MarketSnapshotEntry>>,
    /// Newest observed_at accepted per key; survives eviction so a delayed
    /// update for an evicted market is still dropped.
    watermarks: HashMap<MarketKey, DateTime<Utc>>,
    version: u64,
}

impl StoreInner {
    fn accepts(&self, entry: &MarketSnapshotEntry) -> bool {
        match self.watermarks.get(&entry.key) {
            Some(newest) => entry.observed_at > *newest,
            None => true,
        }
    }

    fn insert(&mut self, entry: MarketSnapshotEntry) {
        self.watermarks.insert(entry.key.clone(), entry.observed_at);
        Arc::make_mut(&mut self.entries).insert(entry.key.clone(), entry);
    }
}

/// Thread-safe, versioned store of the newest entry per market.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: RwLock<StoreInner>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or supersede the entry for its key. Returns false (no-op) when
    /// the store already holds an observation at least as new.
    pub fn write(&self, entry: MarketSnapshotEntry) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.accepts(&entry) {
            trace!(key = %entry.key, observed_at = %entry.observed_at, "Dropped out-of-order entry");
            return false;
        }
        inner.insert(entry);
        inner.version += 1;
        true
    }

    /// Apply one collection round under a single lock, so no snapshot sees
    /// part of a round. Returns the number of accepted entries.
    pub fn write_batch<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = MarketSnapshotEntry>,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut accepted = 0;
        for entry in entries {
            if inner.accepts(&entry) {
                inner.insert(entry);
                accepted += 1;
            }
        }
        if accepted > 0 {
            inner.version += 1;
        }
        accepted
    }

    /// Consistent point-in-time view.
    pub fn snapshot(&self) -> MarketSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        MarketSnapshot::new(inner.version, Utc::now(), Arc::clone(&inner.entries))
    }

    /// Remove entries observed more than `max_age` ago. Returns how many were removed.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        self.evict_stale_at(max_age, Utc::now())
    }

    pub(crate) fn evict_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let stale: Vec<MarketKey> = inner
            .entries
            .values()
            .filter(|entry| entry.age_at(now) > max_age)
            .map(|entry| entry.key.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let entries = Arc::make_mut(&mut inner.entries);
        for key in &stale {
            entries.remove(key);
            debug!(key = %key, "Evicted stale market");
        }
        inner.version += 1;
        stale.len()
    }

    pub fn get(&self, key: &MarketKey) -> Option<MarketSnapshotEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current write generation.
    pub fn version(&self) -> u64 {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(venue: &str, price: f64, secs: i64) -> MarketSnapshotEntry {
        MarketSnapshotEntry {
            key: MarketKey::new("eth", venue, "ETH/USDC"),
            price,
            available_liquidity: 10.0,
            gas_price_estimate: 0.000025,
            observed_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            source_sequence: secs as u64,
        }
    }

    #[test]
    fn test_write_supersedes_only_newer() {
        let store = SnapshotStore::new();
        assert!(store.write(entry("uniswap", 2000.0, 10)));
        assert!(store.write(entry("uniswap", 2010.0, 20)));

        // older and equal timestamps are silently dropped
        assert!(!store.write(entry("uniswap", 1990.0, 15)));
        assert!(!store.write(entry("uniswap", 1980.0, 20)));

        let key = MarketKey::new("eth", "uniswap", "ETH/USDC");
        assert_eq!(store.get(&key).unwrap().price, 2010.0);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_observed_at_is_monotonic_per_key() {
        let store = SnapshotStore::new();
        let key = MarketKey::new("eth", "uniswap", "ETH/USDC");
        let mut newest = None;

        for secs in [5, 3, 9, 9, 1, 12, 11, 20, 2] {
            store.write(entry("uniswap", 2000.0 + secs as f64, secs));
            let current = store.get(&key).unwrap().observed_at;
            if let Some(prev) = newest {
                assert!(current >= prev);
            }
            newest = Some(current);
        }
        assert_eq!(store.get(&key).unwrap().source_sequence, 20);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = SnapshotStore::new();
        store.write(entry("uniswap", 2000.0, 10));
        let before = store.snapshot();

        store.write_batch(vec![entry("uniswap", 2050.0, 11), entry("sushi", 2020.0, 11)]);
        let after = store.snapshot();

        assert_eq!(before.len(), 1);
        assert_eq!(before.iter().next().unwrap().price, 2000.0);
        assert_eq!(after.len(), 2);
        assert!(after.version() > before.version());
    }

    #[test]
    fn test_batch_counts_accepted_only() {
        let store = SnapshotStore::new();
        store.write(entry("uniswap", 2000.0, 10));
        let accepted = store.write_batch(vec![
            entry("uniswap", 1999.0, 5),
            entry("sushi", 2001.0, 10),
        ]);
        assert_eq!(accepted, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_evict_stale_keeps_watermark() {
        let store = SnapshotStore::new();
        store.write(entry("uniswap", 2000.0, 0));
        store.write(entry("sushi", 2000.0, 50));

        let now = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        let removed = store.evict_stale_at(Duration::from_secs(30), now);
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);

        // a delayed copy of the evicted observation must not resurrect it
        assert!(!store.write(entry("uniswap", 2000.0, 0)));
        assert_eq!(store.evict_stale_at(Duration::from_secs(30), now), 0);
    }
}
