//! Execution Coordinator
//!
//! Drives each opportunity through the execution state machine:
//! claim (exactly once per id), revalidate against the live store, submit
//! with retries and gas bumps, then account the terminal result.
//!
//! Revalidation and liquidity reservation happen under one lock, so two
//! opportunities sharing a leg cannot both commit the same liquidity. The
//! later one is abandoned as stale.

use crate::arbitrage::executor::{quote_conversions, TradeSubmitter};
use crate::arbitrage::record::ExecutionRecord;
use crate::config::BotConfig;
use crate::error::{AbandonReason, AlreadyClaimed, ExecutionError, RetryableKind};
use crate::market::SnapshotStore;
use crate::metrics::PerformanceCounters;
use crate::types::{GasBid, LegSide, MarketKey, MarketSnapshotEntry, Opportunity, TxOutcome};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Coordinator tuning, derived from `BotConfig`.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub staleness_bound: Duration,
    pub price_tolerance: f64,
    pub gas_limit: u64,
    pub gas_bump_factor: f64,
    pub max_retries: u32,
    pub submit_timeout: Duration,
    pub max_concurrent_executions: usize,
    pub record_retention: Duration,
}

impl From<&BotConfig> for CoordinatorSettings {
    fn from(config: &BotConfig) -> Self {
        Self {
            staleness_bound: config.staleness_bound(),
            price_tolerance: config.price_tolerance,
            gas_limit: config.gas_limit,
            gas_bump_factor: config.gas_bump_factor,
            max_retries: config.max_retries,
            submit_timeout: config.submit_timeout(),
            max_concurrent_executions: config.max_concurrent_executions.max(1),
            record_retention: config.record_retention(),
        }
    }
}

/// Result of handing a batch of opportunities to the coordinator.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Terminal records, in completion order.
    pub records: Vec<ExecutionRecord>,
    pub already_claimed: usize,
    /// Left out by the per-cycle limit.
    pub not_dispatched: usize,
}

pub struct ExecutionCoordinator {
    store: Arc<SnapshotStore>,
    submitter: Arc<dyn TradeSubmitter>,
    counters: Arc<PerformanceCounters>,
    settings: CoordinatorSettings,
    records: DashMap<String, ExecutionRecord>,
    /// Liquidity committed by in-flight executions, per market.
    reservations: Mutex<HashMap<MarketKey, f64>>,
    permits: Arc<Semaphore>,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<SnapshotStore>,
        submitter: Arc<dyn TradeSubmitter>,
        counters: Arc<PerformanceCounters>,
        settings: CoordinatorSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_executions));
        Self {
            store,
            submitter,
            counters,
            settings,
            records: DashMap::new(),
            reservations: Mutex::new(HashMap::new()),
            permits,
        }
    }

    pub fn submitter_name(&self) -> &str {
        self.submitter.name()
    }

    /// `Pending -> Claimed`. Exactly one caller wins per opportunity id.
    pub fn claim(&self, opportunity: &Opportunity) -> Result<(), AlreadyClaimed> {
        match self.records.entry(opportunity.id.clone()) {
            Entry::Occupied(_) => Err(AlreadyClaimed(opportunity.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(ExecutionRecord::claimed(opportunity));
                debug!(id = %opportunity.short_id(), "Opportunity claimed");
                Ok(())
            }
        }
    }

    /// Claim and drive one opportunity to a terminal state.
    pub async fn execute(&self, opportunity: Opportunity) -> Result<ExecutionRecord, AlreadyClaimed> {
        self.claim(&opportunity)?;
        self.counters.record_detected(1).await;
        match self.prepare(&opportunity) {
            Ok(bid) => {
                let _permit = self.permits.acquire().await.ok();
                Ok(self.submit_with_retries(&opportunity, bid).await)
            }
            Err(reason) => Ok(self.abandon(&opportunity, reason, false).await),
        }
    }

    /// Claim and revalidate in rank order, then execute the survivors
    /// concurrently (bounded by `max_concurrent_executions`). With a `limit`,
    /// only the best `limit` opportunities are dispatched. Only newly claimed
    /// opportunities count as detected.
    pub async fn dispatch(
        self: &Arc<Self>,
        mut opportunities: Vec<Opportunity>,
        limit: Option<usize>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        if let Some(limit) = limit {
            if opportunities.len() > limit {
                let surplus = opportunities.split_off(limit);
                for skipped in &surplus {
                    info!(id = %skipped.short_id(), net = skipped.expected_net_profit, "Not dispatched: per-cycle limit reached");
                }
                outcome.not_dispatched = surplus.len();
            }
        }
        let mut tasks = JoinSet::new();
        let mut claimed = 0;

        for opportunity in opportunities {
            if let Err(owned) = self.claim(&opportunity) {
                debug!("{}", owned);
                outcome.already_claimed += 1;
                continue;
            }
            claimed += 1;
            match self.prepare(&opportunity) {
                Ok(bid) => {
                    let coordinator = Arc::clone(self);
                    let permits = Arc::clone(&self.permits);
                    tasks.spawn(async move {
                        let _permit = permits.acquire_owned().await.ok();
                        coordinator.submit_with_retries(&opportunity, bid).await
                    });
                }
                Err(reason) => {
                    outcome
                        .records
                        .push(self.abandon(&opportunity, reason, false).await);
                }
            }
        }

        self.counters.record_detected(claimed).await;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(record) => outcome.records.push(record),
                Err(e) => error!("Execution task failed: {}", e),
            }
        }
        outcome
    }

    /// `Claimed -> Submitted` gate: check the opportunity against the live
    /// store and reserve its liquidity. Returns the opening gas bid.
    fn prepare(&self, opportunity: &Opportunity) -> Result<GasBid, AbandonReason> {
        let now = Utc::now();
        let bound = chrono::Duration::from_std(self.settings.staleness_bound)
            .unwrap_or(chrono::Duration::MAX);
        let stale = |detail: String| Err(AbandonReason::StaleOpportunity(detail));

        let age = now - opportunity.snapshot_taken_at;
        if age > bound {
            return stale(format!(
                "snapshot v{} is {}ms old",
                opportunity.snapshot_version,
                age.num_milliseconds()
            ));
        }

        let mut reserved = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(conversions) = quote_conversions(&opportunity.legs) else {
            return Err(AbandonReason::Fatal("route has a leg without BASE/QUOTE assets".into()));
        };

        // bid in the start asset: the dearest leg's gas price, converted
        let mut price_per_gas = 0.0_f64;
        for (leg, conversion) in opportunity.legs.iter().zip(&conversions) {
            let Some(current) = self.store.get(&leg.key) else {
                return stale(format!("{} no longer in store", leg.key));
            };
            if current.age_at(now) > bound {
                return stale(format!("{} last observed {}", leg.key, current.observed_at));
            }

            let tolerance = self.settings.price_tolerance;
            let worse = match leg.side {
                LegSide::Buy => current.price > leg.price * (1.0 + tolerance),
                LegSide::Sell => current.price < leg.price * (1.0 - tolerance),
            };
            if worse {
                return stale(format!(
                    "{} {} price moved {} -> {}",
                    leg.side, leg.key, leg.price, current.price
                ));
            }

            let held = reserved.get(&leg.key).copied().unwrap_or(0.0);
            if current.available_liquidity - held < leg.base_amount {
                return stale(format!(
                    "{} liquidity {} ({} reserved) below {}",
                    leg.key, current.available_liquidity, held, leg.base_amount
                ));
            }
            price_per_gas = price_per_gas.max(current.gas_price_estimate / conversion);
        }

        for leg in &opportunity.legs {
            *reserved.entry(leg.key.clone()).or_insert(0.0) += leg.base_amount;
        }
        Ok(GasBid {
            price_per_gas,
            gas_limit: self.settings.gas_limit,
        })
    }

    async fn submit_with_retries(&self, opportunity: &Opportunity, mut bid: GasBid) -> ExecutionRecord {
        loop {
            let attempt = self
                .update(&opportunity.id, |record| record.submitted(bid))
                .unwrap_or(1);
            info!(
                id = %opportunity.short_id(),
                attempt,
                gas_price = bid.price_per_gas,
                submitter = self.submitter.name(),
                "Submitting trade"
            );

            let result = match timeout(
                self.settings.submit_timeout,
                self.submitter.submit(&opportunity.id, &opportunity.legs, bid),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::timeout(self.settings.submit_timeout)),
            };

            let error = match result {
                Ok(outcome) => return self.complete(opportunity, bid, outcome).await,
                Err(error) => error,
            };

            self.update(&opportunity.id, |record| record.failed(&error));
            warn!(id = %opportunity.short_id(), attempt, error = %error, "Trade attempt failed");

            if error.is_retryable() && attempt < self.settings.max_retries {
                bid = bid.bumped(self.settings.gas_bump_factor);
                continue;
            }

            if let ExecutionError::Retryable {
                kind: RetryableKind::UnknownOutcome,
                ..
            } = &error
            {
                error!(
                    id = %opportunity.id,
                    attempts = attempt,
                    "Settlement still unknown after final attempt, reconcile with the relay"
                );
            }
            let reason = if error.is_retryable() {
                AbandonReason::RetriesExhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                }
            } else {
                AbandonReason::Fatal(error.to_string())
            };
            return self.abandon(opportunity, reason, true).await;
        }
    }

    async fn complete(&self, opportunity: &Opportunity, bid: GasBid, outcome: TxOutcome) -> ExecutionRecord {
        let gas_cost = outcome.gas_used as f64 * bid.price_per_gas;
        let realized = outcome.gross_proceeds - gas_cost;

        let record = self
            .update(&opportunity.id, |record| {
                record.completed(&outcome, realized);
                record.clone()
            })
            .unwrap_or_else(|| ExecutionRecord::claimed(opportunity));
        self.counters.record_completed(realized, gas_cost).await;

        self.apply_fills(opportunity);
        self.release(opportunity);

        info!(
            id = %opportunity.short_id(),
            tx = %outcome.tx_hash,
            realized_profit = realized,
            gas_used = outcome.gas_used,
            "Trade completed"
        );
        record
    }

    async fn abandon(&self, opportunity: &Opportunity, reason: AbandonReason, reserved: bool) -> ExecutionRecord {
        warn!(id = %opportunity.short_id(), reason = %reason, "Execution abandoned");
        let record = self
            .update(&opportunity.id, |record| {
                record.abandoned(reason.clone());
                record.clone()
            })
            .unwrap_or_else(|| ExecutionRecord::claimed(opportunity));
        self.counters.record_abandoned().await;
        if reserved {
            self.release(opportunity);
        }
        record
    }

    /// Supersede each leg's store entry with the liquidity the trade consumed.
    fn apply_fills(&self, opportunity: &Opportunity) {
        let now = Utc::now();
        for leg in &opportunity.legs {
            let Some(current) = self.store.get(&leg.key) else {
                continue;
            };
            let updated = MarketSnapshotEntry {
                available_liquidity: (current.available_liquidity - leg.base_amount).max(0.0),
                observed_at: now.max(current.observed_at + chrono::Duration::nanoseconds(1)),
                source_sequence: current.source_sequence + 1,
                ..current
            };
            if !self.store.write(updated) {
                debug!(key = %leg.key, "Fill superseded by a newer observation");
            }
        }
    }

    fn release(&self, opportunity: &Opportunity) {
        let mut reserved = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for leg in &opportunity.legs {
            if let Some(held) = reserved.get_mut(&leg.key) {
                *held -= leg.base_amount;
                if *held <= f64::EPSILON {
                    reserved.remove(&leg.key);
                }
            }
        }
    }

    fn update<T>(&self, id: &str, f: impl FnOnce(&mut ExecutionRecord) -> T) -> Option<T> {
        self.records.get_mut(id).map(|mut record| f(record.value_mut()))
    }

    pub fn record(&self, id: &str) -> Option<ExecutionRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// All known records, oldest first.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    pub fn in_flight(&self) -> usize {
        self.records.iter().filter(|r| !r.is_terminal()).count()
    }

    /// Drop terminal records older than the retention window.
    pub fn prune(&self) -> usize {
        self.prune_before(Utc::now())
    }

    pub(crate) fn prune_before(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.settings.record_retention)
            .unwrap_or(chrono::Duration::MAX);
        let before = self.records.len();
        self.records.retain(|_, record| match record.finished_at {
            Some(finished) if record.is_terminal() => now - finished <= retention,
            _ => true,
        });
        before - self.records.len()
    }
}
