//! Data Collector Binary
//!
//! Runs only the Sense stage: polls every configured endpoint on the scan
//! interval and writes the current market snapshot to a JSON file that
//! offline analysis can read back.
//!
//! Usage:
//!   data-collector --config config/omniarb.toml --output data/market_snapshot.json

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use omniarb_bot::collector::{CollectorSettings, HttpMarketSource, MarketSource, SenseCollector};
use omniarb_bot::{BotConfig, SnapshotStore};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Sense-only collector that dumps market snapshots as JSON
#[derive(Parser)]
#[command(name = "data-collector", version)]
struct Args {
    #[arg(short, long, env = "OMNIARB_CONFIG", default_value = "config/omniarb.toml")]
    config: PathBuf,

    /// Snapshot file written after every round
    #[arg(short, long, env = "SNAPSHOT_FILE", default_value = "data/market_snapshot.json")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("omniarb_bot=info,data_collector=info")),
        )
        .init();

    let args = Args::parse();

    info!("===========================================");
    info!("   OmniArb Data Collector");
    info!("===========================================");

    let config = BotConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    config.validate().context("Invalid configuration")?;
    info!("{}", config);

    let sources = config
        .rpc_endpoints
        .iter()
        .enumerate()
        .map(|(i, url)| {
            HttpMarketSource::new(format!("rpc-{}", i), url.clone())
                .map(|s| Arc::new(s) as Arc<dyn MarketSource>)
                .context("Failed to build HTTP client")
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(parent) = args.output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let store = Arc::new(SnapshotStore::new());
    let collector = SenseCollector::new(sources, Arc::clone(&store), CollectorSettings::from(&config));

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    let mut ticker = interval(config.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = signals.next() => {
                info!(signal = ?signal, "Shutdown signal received");
                break;
            }
        }

        let round = collector.poll_once().await;
        if round.all_failed() {
            warn!(round = round.round, "No source answered this round");
        }
        store.evict_stale(config.staleness_bound());

        let snapshot = store.snapshot();
        match snapshot.export().write_to_file(&args.output) {
            Ok(()) => info!(
                round = round.round,
                markets = snapshot.len(),
                version = snapshot.version(),
                "Snapshot written to {}",
                args.output.display()
            ),
            Err(e) => error!("Failed to write snapshot: {:#}", e),
        }
    }

    for (source, health) in collector.health_report() {
        info!(
            source = %source,
            successes = health.total_successes,
            failures = health.total_failures,
            "Source health"
        );
    }
    Ok(())
}
