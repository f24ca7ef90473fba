//! OmniArb Bot
//!
//! Main entry point. Loads configuration, builds one HTTP market source per
//! configured endpoint and runs the Sense -> Think -> Execute pipeline for a
//! fixed duration or until SIGINT/SIGTERM.
//!
//! Exit code 0 on clean shutdown, 1 when startup fails (bad configuration,
//! no reachable source).

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use omniarb_bot::arbitrage::AnalyzerConfig;
use omniarb_bot::{
    BotConfig, CycleArbitrage, HttpMarketSource, MarketSource, NeuralOrchestrator, RelaySubmitter,
    TradeSubmitter,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// OmniArb Bot: multi-chain DEX arbitrage (Sense -> Think -> Execute)
#[derive(Parser)]
#[command(name = "omniarb-bot", version)]
struct Args {
    /// TOML configuration file (defaults apply when missing)
    #[arg(short, long, env = "OMNIARB_CONFIG", default_value = "config/omniarb.toml")]
    config: PathBuf,

    /// Stop after this many seconds (runs until interrupted when omitted)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, env = "OMNIARB_LOG_JSON")]
    log_json: bool,
}

fn init_logging(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("omniarb_bot=info"));

    if json {
        fmt().json().with_env_filter(env_filter).with_target(true).init();
    } else {
        fmt().with_env_filter(env_filter).with_target(false).init();
    }
}

fn banner(config: &BotConfig) {
    info!("===========================================");
    info!("   OmniArb Bot: Sense -> Think -> Execute");
    info!("===========================================");
    info!("Endpoints: {}", config.rpc_endpoints.len());
    info!("Min profit threshold: {:.2}%", config.min_profit_threshold * 100.0);
    info!("Max trade amount: {}", config.max_trade_amount);
    info!("Max legs per route: {}", config.max_leg_count);
    info!("Scan interval: {}s", config.scan_interval);
    if config.enable_auto_trading {
        warn!("Auto trading ENABLED: trades are submitted to the execution relay");
    } else {
        info!("Auto trading disabled: simulation mode");
    }
}

/// Build the pipeline from configuration.
fn build(config: BotConfig) -> Result<NeuralOrchestrator> {
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

    let live = match (config.enable_auto_trading, &config.submit_endpoint) {
        (true, Some(endpoint)) => {
            let relay = RelaySubmitter::new(endpoint.clone()).context("Failed to build relay client")?;
            Some(Arc::new(relay) as Arc<dyn TradeSubmitter>)
        }
        _ => None,
    };

    let strategy = Arc::new(CycleArbitrage::new(AnalyzerConfig::from(&config)));
    NeuralOrchestrator::new(config, sources, strategy, live).context("Invalid configuration")
}

async fn run(args: Args) -> Result<()> {
    let config = BotConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    config.validate().context("Invalid configuration")?;
    banner(&config);

    let orchestrator = Arc::new(build(config)?);

    // SIGINT/SIGTERM stop the pipeline at the next cycle boundary
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    let handle = signals.handle();
    let stopper = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            // keep listening: a repeat signal re-sends the stop request
            while let Some(signal) = signals.next().await {
                info!(signal, "Shutdown signal received, finishing current cycle");
                orchestrator.deactivate().await;
            }
        })
    };

    let result = orchestrator.run(args.duration.map(Duration::from_secs)).await;
    handle.close();
    let _ = stopper.await;

    let summary = result.context("Pipeline failed")?;
    info!(
        cycles = summary.cycles,
        opportunities = summary.opportunities_found,
        executions = summary.executions_attempted,
        elapsed_ms = summary.elapsed_ms,
        "Shutdown complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_json);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
