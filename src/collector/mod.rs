//! Sense Collector
//!
//! Polls every market source concurrently, validates what comes back and
//! feeds the snapshot store. A failing or slow source is logged as degraded
//! and left out of the round; it never aborts the round for the others.
//!
//! Rounds are serialized: a background tick that finds a round still in
//! flight is skipped rather than queued.

pub mod health;
pub mod source;

pub use health::SourceHealth;
pub use source::{validate_quote, HttpMarketSource, MarketSource, StaticMarketSource};

use crate::config::BotConfig;
use crate::error::SourceError;
use crate::market::SnapshotStore;
use crate::types::{MarketQuote, MarketSnapshotEntry};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, info, warn};

/// Collector tuning, derived from `BotConfig`.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub scan_interval: Duration,
    pub source_timeout: Duration,
    pub max_concurrent_sources: usize,
}

impl From<&BotConfig> for CollectorSettings {
    fn from(config: &BotConfig) -> Self {
        Self {
            scan_interval: config.scan_interval(),
            source_timeout: config.source_timeout(),
            max_concurrent_sources: config.max_concurrent_sources.max(1),
        }
    }
}

/// Outcome of one collection round.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub round: u64,
    pub sources_ok: usize,
    pub sources_degraded: Vec<(String, SourceError)>,
    pub entries_accepted: usize,
    /// Entries the store rejected as not newer than what it holds.
    pub entries_dropped: usize,
    pub elapsed: Duration,
}

impl RoundReport {
    /// True when no source contributed to the round.
    pub fn all_failed(&self) -> bool {
        self.sources_ok == 0
    }

    pub fn source_count(&self) -> usize {
        self.sources_ok + self.sources_degraded.len()
    }
}

struct CollectorShared {
    sources: Vec<Arc<dyn MarketSource>>,
    store: Arc<SnapshotStore>,
    settings: CollectorSettings,
    health: DashMap<String, SourceHealth>,
    rounds: AtomicU64,
    coalesced: AtomicU64,
    round_lock: Mutex<()>,
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Sense stage: sources in, store writes out.
pub struct SenseCollector {
    shared: Arc<CollectorShared>,
    background: Mutex<Option<LoopHandle>>,
}

impl SenseCollector {
    pub fn new(
        sources: Vec<Arc<dyn MarketSource>>,
        store: Arc<SnapshotStore>,
        settings: CollectorSettings,
    ) -> Self {
        let health = sources
            .iter()
            .map(|s| (s.id().to_string(), SourceHealth::default()))
            .collect();
        Self {
            shared: Arc::new(CollectorShared {
                sources,
                store,
                settings,
                health,
                rounds: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                round_lock: Mutex::new(()),
            }),
            background: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<SnapshotStore> {
        Arc::clone(&self.shared.store)
    }

    pub fn source_count(&self) -> usize {
        self.shared.sources.len()
    }

    /// Run one round now, waiting for any in-flight background round first.
    pub async fn poll_once(&self) -> RoundReport {
        let _round = self.shared.round_lock.lock().await;
        self.shared.run_round().await
    }

    /// Start the background collection loop. No-op when already running.
    pub async fn activate(&self) {
        let mut background = self.background.lock().await;
        if background.is_some() {
            debug!("Collector already active");
            return;
        }

        let (shutdown, mut stop) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let period = shared.settings.scan_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = IntervalStream::new(ticker);

            loop {
                tokio::select! {
                    _ = ticks.next() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let Ok(_round) = shared.round_lock.try_lock() else {
                    let skipped = shared.coalesced.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(skipped, "Previous round still running, tick coalesced");
                    continue;
                };
                shared.run_round().await;
            }
            debug!("Collector loop stopped");
        });

        info!(
            sources = self.shared.sources.len(),
            interval_ms = period.as_millis() as u64,
            "Sense collector activated"
        );
        *background = Some(LoopHandle { shutdown, task });
    }

    /// Stop the background loop, letting an in-flight round finish.
    pub async fn deactivate(&self) {
        let Some(handle) = self.background.lock().await.take() else {
            return;
        };
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            warn!("Collector loop ended abnormally: {}", e);
        }
        info!(
            rounds = self.shared.rounds.load(Ordering::Relaxed),
            coalesced = self.shared.coalesced.load(Ordering::Relaxed),
            "Sense collector deactivated"
        );
    }

    pub async fn is_active(&self) -> bool {
        self.background.lock().await.is_some()
    }

    pub fn health(&self, source_id: &str) -> Option<SourceHealth> {
        self.shared.health.get(source_id).map(|h| h.clone())
    }

    /// Health of every source, ordered by id.
    pub fn health_report(&self) -> Vec<(String, SourceHealth)> {
        let mut report: Vec<_> = self
            .shared
            .health
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Ticks skipped because a round was still running.
    pub fn coalesced_rounds(&self) -> u64 {
        self.shared.coalesced.load(Ordering::Relaxed)
    }
}

impl CollectorShared {
    /// Caller must hold `round_lock`.
    async fn run_round(&self) -> RoundReport {
        let started = Instant::now();
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let source_timeout = self.settings.source_timeout;

        let pending: Vec<futures::future::BoxFuture<'static, FetchResult>> = self
            .sources
            .iter()
            .cloned()
            .map(|source| fetch_with_timeout(source, source_timeout).boxed())
            .collect();
        let mut fetches = stream::iter(pending).buffer_unordered(self.settings.max_concurrent_sources);

        // The round as a whole never outlives one scan interval.
        let mut results = Vec::with_capacity(self.sources.len());
        let drained = timeout(self.settings.scan_interval, async {
            while let Some(result) = fetches.next().await {
                results.push(result);
            }
        })
        .await;
        drop(fetches);

        let mut report = RoundReport {
            round,
            ..RoundReport::default()
        };
        let mut entries = Vec::new();
        let mut answered = HashSet::with_capacity(results.len());

        for (source, result) in results {
            answered.insert(source.id().to_string());
            match result.and_then(|quotes| {
                quotes.iter().try_for_each(validate_quote)?;
                Ok(quotes)
            }) {
                Ok(quotes) => {
                    let fetched_at = Utc::now();
                    let sequence = self
                        .health
                        .entry(source.id().to_string())
                        .or_default()
                        .record_success(fetched_at);
                    entries.extend(quotes.into_iter().map(|quote| MarketSnapshotEntry {
                        key: quote.key(),
                        price: quote.price,
                        available_liquidity: quote.available_liquidity,
                        gas_price_estimate: quote.gas_price_estimate,
                        observed_at: quote.observed_at.unwrap_or(fetched_at),
                        source_sequence: sequence,
                    }));
                    report.sources_ok += 1;
                }
                Err(e) => self.degrade(&mut report, source.id(), e),
            }
        }

        if drained.is_err() {
            for source in &self.sources {
                if !answered.contains(source.id()) {
                    self.degrade(
                        &mut report,
                        source.id(),
                        SourceError::Timeout(self.settings.scan_interval),
                    );
                }
            }
        }

        let produced = entries.len();
        report.entries_accepted = self.store.write_batch(entries);
        report.entries_dropped = produced - report.entries_accepted;
        report.elapsed = started.elapsed();

        debug!(
            round,
            ok = report.sources_ok,
            degraded = report.sources_degraded.len(),
            accepted = report.entries_accepted,
            dropped = report.entries_dropped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Collection round complete"
        );
        report
    }

    fn degrade(&self, report: &mut RoundReport, source_id: &str, error: SourceError) {
        warn!(source = %source_id, error = %error, "Degraded source excluded from round");
        self.health
            .entry(source_id.to_string())
            .or_default()
            .record_failure(&error);
        report.sources_degraded.push((source_id.to_string(), error));
    }
}

type FetchResult = (Arc<dyn MarketSource>, Result<Vec<MarketQuote>, SourceError>);

async fn fetch_with_timeout(source: Arc<dyn MarketSource>, limit: Duration) -> FetchResult {
    let result = match timeout(limit, source.fetch_market_data()).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(limit)),
    };
    (source, result)
}
