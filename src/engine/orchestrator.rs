//! Neural Orchestrator
//!
//! Owns one Sense -> Think -> Execute pipeline: builds the collector,
//! analyzer and coordinator around a shared snapshot store, runs cycles on
//! the scan interval and stops only at cycle boundaries.

use crate::arbitrage::{
    CoordinatorSettings, DryRunSubmitter, ExecutionCoordinator, ExecutionRecord, ExecutionState,
    Strategy, TradeSubmitter,
};
use crate::collector::{CollectorSettings, MarketSource, SenseCollector, SourceHealth};
use crate::config::BotConfig;
use crate::error::{ConfigError, PipelineError};
use crate::market::SnapshotStore;
use crate::metrics::{CountersSnapshot, PerformanceCounters};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{error, info, warn};

/// What one `run_cycle` did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub snapshot_version: u64,
    pub markets: usize,
    pub sources_ok: usize,
    pub sources_degraded: usize,
    pub evicted: usize,
    pub opportunities_found: usize,
    pub executions_attempted: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub already_claimed: usize,
    pub not_dispatched: usize,
    pub realized_profit: f64,
    pub elapsed_ms: u64,
}

/// Totals for one `run` session.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub opportunities_found: usize,
    pub executions_attempted: usize,
    pub counters: CountersSnapshot,
    pub elapsed_ms: u64,
}

pub struct NeuralOrchestrator {
    config: BotConfig,
    store: Arc<SnapshotStore>,
    collector: SenseCollector,
    strategy: Arc<dyn Strategy>,
    coordinator: Arc<ExecutionCoordinator>,
    counters: Arc<PerformanceCounters>,
    active: AtomicBool,
    cycles: AtomicU64,
    stop: watch::Sender<bool>,
}

impl NeuralOrchestrator {
    /// Validate the configuration and wire the pipeline. Counters start at zero.
    ///
    /// With auto trading off the coordinator always gets a dry-run submitter
    /// and `live_submitter` is never called.
    pub fn new(
        config: BotConfig,
        sources: Vec<Arc<dyn MarketSource>>,
        strategy: Arc<dyn Strategy>,
        live_submitter: Option<Arc<dyn TradeSubmitter>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let submitter: Arc<dyn TradeSubmitter> = if config.enable_auto_trading {
            live_submitter.ok_or(ConfigError::MissingSubmitter)?
        } else {
            Arc::new(DryRunSubmitter::new(config.simulated_slippage, config.gas_per_leg))
        };

        let store = Arc::new(SnapshotStore::new());
        let counters = Arc::new(PerformanceCounters::new());
        let collector = SenseCollector::new(
            sources,
            Arc::clone(&store),
            CollectorSettings::from(&config),
        );
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&store),
            submitter,
            Arc::clone(&counters),
            CoordinatorSettings::from(&config),
        ));
        let (stop, _) = watch::channel(false);

        info!(
            config = %config,
            strategy = strategy.name(),
            submitter = coordinator.submitter_name(),
            "Orchestrator initialized"
        );

        Ok(Self {
            config,
            store,
            collector,
            strategy,
            coordinator,
            counters,
            active: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            stop,
        })
    }

    /// Poll the sources once and start the collector loop.
    pub async fn activate(&self) -> Result<(), PipelineError> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let first_round = self.collector.poll_once().await;
        if first_round.all_failed() {
            error!(sources = first_round.source_count(), "No market source reachable");
            return Err(PipelineError::AllSourcesUnavailable {
                sources: first_round.source_count(),
            });
        }

        self.collector.activate().await;
        self.active.store(true, Ordering::SeqCst);

        let mode = if self.config.enable_auto_trading { "AUTO" } else { "SIMULATION" };
        info!(
            mode,
            sources_ok = first_round.sources_ok,
            sources_degraded = first_round.sources_degraded.len(),
            markets = self.store.len(),
            "Pipeline activated"
        );
        Ok(())
    }

    /// Stop the collector and any `run` loop at its next cycle boundary.
    pub async fn deactivate(&self) {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        self.stop.send_replace(true);
        self.collector.deactivate().await;
        if was_active {
            info!("Pipeline deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// One Sense poll, one analysis pass, dispatch of every opportunity found.
    pub async fn run_cycle(&self) -> Result<CycleSummary, PipelineError> {
        if !self.is_active() {
            return Err(PipelineError::Inactive);
        }
        let started = Instant::now();
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;

        // Sense
        let round = self.collector.poll_once().await;
        if round.all_failed() {
            error!(cycle, sources = round.source_count(), "All market sources unavailable");
            return Err(PipelineError::AllSourcesUnavailable {
                sources: round.source_count(),
            });
        }
        let evicted = self.store.evict_stale(self.config.staleness_bound());
        let snapshot = self.store.snapshot();

        // Think
        let opportunities = self.strategy.analyze(&snapshot);
        let found = opportunities.len();
        if let Some(best) = opportunities.first() {
            info!(cycle, found, best = %best, "Opportunities detected");
        }

        // Execute
        let outcome = self
            .coordinator
            .dispatch(opportunities, self.config.max_executions_per_cycle)
            .await;
        self.coordinator.prune();

        let count = |state: ExecutionState| outcome.records.iter().filter(|r| r.state == state).count();
        let summary = CycleSummary {
            cycle,
            snapshot_version: snapshot.version(),
            markets: snapshot.len(),
            sources_ok: round.sources_ok,
            sources_degraded: round.sources_degraded.len(),
            evicted,
            opportunities_found: found,
            executions_attempted: outcome.records.len(),
            completed: count(ExecutionState::Completed),
            abandoned: count(ExecutionState::Abandoned),
            already_claimed: outcome.already_claimed,
            not_dispatched: outcome.not_dispatched,
            realized_profit: outcome.records.iter().filter_map(|r| r.realized_profit).sum(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            cycle,
            markets = summary.markets,
            found = summary.opportunities_found,
            attempted = summary.executions_attempted,
            completed = summary.completed,
            abandoned = summary.abandoned,
            profit = summary.realized_profit,
            elapsed_ms = summary.elapsed_ms,
            "Cycle complete"
        );
        Ok(summary)
    }

    /// Run cycles every scan interval until `duration` elapses or
    /// `deactivate()` is called. Always deactivates before returning.
    ///
    /// A stop request is sticky: one made before or during activation ends
    /// the run before its first cycle, and after `deactivate()` a new run
    /// needs `reinitialize()`. A duration too large to represent runs until
    /// deactivated.
    pub async fn run(&self, duration: Option<Duration>) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let mut stop = self.stop.subscribe();
        if let Err(e) = self.activate().await {
            self.deactivate().await;
            return Err(e);
        }

        let deadline = duration.and_then(|d| tokio::time::Instant::now().checked_add(d));
        let mut ticker = interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cycles = 0;
        let mut found = 0;
        let mut attempted = 0;

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
                _ = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    info!("Run duration elapsed");
                    break Ok(());
                }
            }
            if *stop.borrow_and_update() {
                break Ok(());
            }

            match self.run_cycle().await {
                Ok(summary) => {
                    cycles += 1;
                    found += summary.opportunities_found;
                    attempted += summary.executions_attempted;
                }
                Err(PipelineError::Inactive) => break Ok(()),
                Err(e) => break Err(e),
            }

            if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
                info!("Run duration elapsed");
                break Ok(());
            }
        };

        self.deactivate().await;

        let counters = self.counters.snapshot().await;
        info!(
            cycles,
            opportunities = counters.opportunities_detected,
            trades = counters.trades_executed,
            total_profit = counters.total_profit,
            average_profit = counters.average_profit,
            "Session summary"
        );
        info!("\n{}", counters.report());

        if let Err(e) = &result {
            warn!("Run stopped: {}", e);
        }
        result.map(|()| RunSummary {
            cycles,
            opportunities_found: found,
            executions_attempted: attempted,
            counters,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Read-only view of the performance counters.
    pub async fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot().await
    }

    /// Zero the counters and the cycle number and clear any stop request,
    /// for a fresh session. Refused while the pipeline is active.
    pub async fn reinitialize(&self) -> Result<(), PipelineError> {
        if self.is_active() {
            return Err(PipelineError::Active);
        }
        self.counters.reset().await;
        self.cycles.store(0, Ordering::Relaxed);
        self.stop.send_replace(false);
        info!("Performance counters reset");
        Ok(())
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.coordinator.records()
    }

    pub fn source_health(&self) -> Vec<(String, SourceHealth)> {
        self.collector.health_report()
    }

    pub fn store(&self) -> Arc<SnapshotStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::{AnalyzerConfig, CycleArbitrage};
    use crate::collector::StaticMarketSource;
    use crate::test_support::{
        quote, test_config, CountingSubmitter, DelayedSubmitter, FailingSource, SlowSource,
    };
    use tokio_test::assert_ok;

    fn strategy(config: &BotConfig) -> Arc<dyn Strategy> {
        Arc::new(CycleArbitrage::new(AnalyzerConfig::from(config)))
    }

    fn wide_spread() -> Arc<dyn MarketSource> {
        Arc::new(StaticMarketSource::new(
            "static",
            vec![
                quote("eth", "venue-a", "ETH/USDC", 2000.0),
                quote("eth", "venue-b", "ETH/USDC", 2060.0),
            ],
        ))
    }

    #[tokio::test]
    async fn test_simulation_never_calls_live_submitter() {
        let config = test_config();
        let live = Arc::new(CountingSubmitter::default());
        let orchestrator = NeuralOrchestrator::new(
            config.clone(),
            vec![wide_spread()],
            strategy(&config),
            Some(live.clone() as Arc<dyn TradeSubmitter>),
        )
        .unwrap();

        assert_ok!(orchestrator.activate().await);
        let summary = orchestrator.run_cycle().await.unwrap();
        orchestrator.deactivate().await;

        assert_eq!(summary.opportunities_found, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(live.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        let records = orchestrator.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ExecutionState::Completed);
        assert!(records[0].tx_hash.as_deref().unwrap().starts_with("dry-run-"));

        let counters = orchestrator.counters().await;
        assert_eq!(counters.trades_executed, 1);
        assert_eq!(counters.opportunities_detected, 1);
    }

    #[tokio::test]
    async fn test_run_cycle_requires_activation() {
        let config = test_config();
        let orchestrator =
            NeuralOrchestrator::new(config.clone(), vec![wide_spread()], strategy(&config), None).unwrap();
        assert!(matches!(orchestrator.run_cycle().await, Err(PipelineError::Inactive)));
    }

    #[tokio::test]
    async fn test_activation_fails_without_sources() {
        let config = test_config();
        let orchestrator = NeuralOrchestrator::new(
            config.clone(),
            vec![
                Arc::new(FailingSource::new("a")) as Arc<dyn MarketSource>,
                Arc::new(FailingSource::new("b")),
            ],
            strategy(&config),
            None,
        )
        .unwrap();

        let err = orchestrator.activate().await.unwrap_err();
        assert!(matches!(err, PipelineError::AllSourcesUnavailable { sources: 2 }));
        assert!(!orchestrator.is_active());
    }

    #[tokio::test]
    async fn test_cycle_survives_degraded_sources() {
        let mut config = test_config();
        config.source_timeout_ms = 50;
        let sources: Vec<Arc<dyn MarketSource>> = vec![
            Arc::new(SlowSource::new("slow-a", Duration::from_secs(30))),
            wide_spread(),
            Arc::new(SlowSource::new("slow-b", Duration::from_secs(30))),
        ];
        let orchestrator = NeuralOrchestrator::new(config.clone(), sources, strategy(&config), None).unwrap();

        orchestrator.activate().await.unwrap();
        let summary = orchestrator.run_cycle().await.unwrap();
        orchestrator.deactivate().await;

        assert_eq!(summary.sources_ok, 1);
        assert_eq!(summary.sources_degraded, 2);
        assert!(summary.markets > 0);
        assert_eq!(summary.opportunities_found, 1);
    }

    #[tokio::test]
    async fn test_auto_trading_requires_submitter() {
        let mut config = test_config();
        config.enable_auto_trading = true;
        config.submit_endpoint = Some("https://relay.example".into());

        let result = NeuralOrchestrator::new(config.clone(), vec![wide_spread()], strategy(&config), None);
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::MissingSubmitter))
        ));
    }

    #[tokio::test]
    async fn test_auto_trading_uses_live_submitter() {
        let mut config = test_config();
        config.enable_auto_trading = true;
        config.submit_endpoint = Some("https://relay.example".into());
        let live = Arc::new(CountingSubmitter::default());

        let orchestrator = NeuralOrchestrator::new(
            config.clone(),
            vec![wide_spread()],
            strategy(&config),
            Some(live.clone() as Arc<dyn TradeSubmitter>),
        )
        .unwrap();
        orchestrator.activate().await.unwrap();
        let summary = orchestrator.run_cycle().await.unwrap();
        orchestrator.deactivate().await;

        assert_eq!(summary.completed, 1);
        assert_eq!(live.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_for_duration() {
        let mut config = test_config();
        config.scan_interval = 0.05;
        let orchestrator =
            NeuralOrchestrator::new(config.clone(), vec![wide_spread()], strategy(&config), None).unwrap();

        let summary = orchestrator.run(Some(Duration::from_millis(180))).await.unwrap();

        assert!(summary.cycles >= 2);
        assert!(summary.counters.trades_executed >= 2);
        assert!(!orchestrator.is_active());
    }

    #[tokio::test]
    async fn test_reinitialize_zeroes_counters() {
        let config = test_config();
        let orchestrator =
            NeuralOrchestrator::new(config.clone(), vec![wide_spread()], strategy(&config), None).unwrap();

        orchestrator.activate().await.unwrap();
        orchestrator.run_cycle().await.unwrap();
        assert!(matches!(orchestrator.reinitialize().await, Err(PipelineError::Active)));
        orchestrator.deactivate().await;

        assert_ok!(orchestrator.reinitialize().await);
        let counters = orchestrator.counters().await;
        assert_eq!(counters.trades_executed, 0);
        assert_eq!(counters.opportunities_detected, 0);
    }

    #[tokio::test]
    async fn test_deactivate_stops_run() {
        let mut config = test_config();
        config.scan_interval = 0.02;
        let orchestrator = Arc::new(
            NeuralOrchestrator::new(config.clone(), vec![wide_spread()], strategy(&config), None).unwrap(),
        );

        let runner = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run(None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.deactivate().await;

        let summary = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run stops after deactivate")
            .unwrap()
            .unwrap();
        assert!(summary.cycles >= 1);
    }

    #[tokio::test]
    async fn test_deactivate_during_activation_stops_run() {
        let mut config = test_config();
        config.scan_interval = 1.0;
        let slow: Arc<dyn MarketSource> = Arc::new(SlowSource::new("slow", Duration::from_millis(300)));
        let orchestrator =
            Arc::new(NeuralOrchestrator::new(config.clone(), vec![slow], strategy(&config), None).unwrap());

        let runner = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run(None).await })
        };
        // still inside the first poll of activate()
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.deactivate().await;

        let summary = tokio::time::timeout(Duration::from_secs(3), runner)
            .await
            .expect("run stops after deactivate during activation")
            .unwrap()
            .unwrap();
        assert_eq!(summary.cycles, 0);
        assert!(!orchestrator.is_active());
    }

    #[tokio::test]
    async fn test_stop_request_persists_until_reinitialize() {
        let mut config = test_config();
        config.scan_interval = 0.02;
        let orchestrator =
            NeuralOrchestrator::new(config.clone(), vec![wide_spread()], strategy(&config), None).unwrap();

        orchestrator.deactivate().await;
        let summary = orchestrator.run(None).await.unwrap();
        assert_eq!(summary.cycles, 0);

        assert_ok!(orchestrator.reinitialize().await);
        let summary = orchestrator.run(Some(Duration::from_millis(60))).await.unwrap();
        assert!(summary.cycles >= 1);
    }

    #[tokio::test]
    async fn test_unrepresentable_duration_runs_until_deactivated() {
        let mut config = test_config();
        config.scan_interval = 0.02;
        let orchestrator = Arc::new(
            NeuralOrchestrator::new(config.clone(), vec![wide_spread()], strategy(&config), None).unwrap(),
        );

        let runner = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run(Some(Duration::MAX)).await })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!runner.is_finished());
        orchestrator.deactivate().await;

        let summary = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run stops after deactivate")
            .unwrap()
            .unwrap();
        assert!(summary.cycles >= 1);
    }

    #[tokio::test]
    async fn test_deactivate_lets_submitted_trade_settle() {
        let mut config = test_config();
        config.scan_interval = 0.02;
        config.enable_auto_trading = true;
        config.submit_endpoint = Some("https://relay.example".into());
        let live = Arc::new(DelayedSubmitter::new(Duration::from_millis(300)));
        let orchestrator = Arc::new(
            NeuralOrchestrator::new(
                config.clone(),
                vec![wide_spread()],
                strategy(&config),
                Some(live.clone() as Arc<dyn TradeSubmitter>),
            )
            .unwrap(),
        );

        let runner = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run(None).await })
        };
        let in_flight = tokio::time::timeout(Duration::from_secs(3), async {
            while !orchestrator
                .records()
                .iter()
                .any(|r| r.state == ExecutionState::Submitted)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(in_flight.is_ok(), "a trade reaches Submitted");
        orchestrator.deactivate().await;

        let summary = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run stops after deactivate")
            .unwrap()
            .unwrap();

        let records = orchestrator.records();
        assert_eq!(records.len(), 1);
        assert!(records.iter().all(|r| r.state.is_terminal()));
        assert_eq!(records[0].state, ExecutionState::Completed);
        assert_eq!(live.settled.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(summary.counters.trades_executed, 1);
    }
}
