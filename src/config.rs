//! Configuration management
//!
//! Settings come from an optional TOML file, then environment variables
//! (after loading `.env`) override individual keys. `validate()` must pass
//! before the orchestrator is built.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Longest accepted scan interval, one day.
const MAX_SCAN_INTERVAL_SECS: f64 = 86_400.0;

/// Bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    // Sources
    pub rpc_endpoints: Vec<String>,
    pub source_timeout_ms: u64,
    pub max_concurrent_sources: usize,

    // Trading parameters
    pub min_profit_threshold: f64,
    /// In BASE units of a route's first leg.
    pub max_trade_amount: f64,
    pub gas_limit: u64,
    pub gas_per_leg: u64,
    pub max_leg_count: usize,

    // Timing (seconds)
    pub scan_interval: f64,
    pub staleness_bound: f64,

    // Execution
    pub enable_auto_trading: bool,
    pub submit_endpoint: Option<String>,
    pub submit_timeout_ms: u64,
    pub max_retries: u32,
    pub gas_bump_factor: f64,
    pub price_tolerance: f64,
    pub max_concurrent_executions: usize,
    pub max_executions_per_cycle: Option<usize>,
    pub record_retention_secs: u64,

    // Dry-run modelling
    pub simulated_slippage: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            rpc_endpoints: Vec::new(),
            source_timeout_ms: 2_000,
            max_concurrent_sources: 8,
            min_profit_threshold: 0.01,
            max_trade_amount: 1.0,
            gas_limit: 300_000,
            gas_per_leg: 100_000,
            max_leg_count: 2,
            scan_interval: 5.0,
            staleness_bound: 30.0,
            enable_auto_trading: false,
            submit_endpoint: None,
            submit_timeout_ms: 10_000,
            max_retries: 3,
            gas_bump_factor: 1.125,
            price_tolerance: 0.005,
            max_concurrent_executions: 4,
            max_executions_per_cycle: Some(3),
            record_retention_secs: 300,
            simulated_slippage: 0.05,
        }
    }
}

impl BotConfig {
    /// Load from a TOML file (defaults when it does not exist), then apply
    /// environment overrides. Does not validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let parsed = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            info!("Configuration loaded from {}", path.display());
            parsed
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.rpc_endpoints = dedup_endpoints(std::mem::take(&mut config.rpc_endpoints));
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.rpc_endpoints = dedup_endpoints(config.rpc_endpoints);
        Ok(config)
    }

    /// Override fields from environment-style lookups.
    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoints) = lookup("RPC_ENDPOINTS") {
            self.rpc_endpoints = parse_list(&endpoints);
        }
        if let Some(v) = lookup("MIN_PROFIT_THRESHOLD") {
            self.min_profit_threshold = parse_env("min_profit_threshold", &v)?;
        }
        if let Some(v) = lookup("MAX_TRADE_AMOUNT") {
            self.max_trade_amount = parse_env("max_trade_amount", &v)?;
        }
        if let Some(v) = lookup("GAS_LIMIT") {
            self.gas_limit = parse_env("gas_limit", &v)?;
        }
        if let Some(v) = lookup("SCAN_INTERVAL") {
            self.scan_interval = parse_env("scan_interval", &v)?;
        }
        if let Some(v) = lookup("ENABLE_AUTO_TRADING") {
            self.enable_auto_trading = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.max_retries = parse_env("max_retries", &v)?;
        }
        if let Some(v) = lookup("STALENESS_BOUND") {
            self.staleness_bound = parse_env("staleness_bound", &v)?;
        }
        if let Some(v) = lookup("SUBMIT_ENDPOINT") {
            let v = v.trim();
            self.submit_endpoint = (!v.is_empty()).then(|| v.to_string());
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if !(self.min_profit_threshold > 0.0 && self.min_profit_threshold < 1.0) {
            return Err(ConfigError::invalid(
                "min_profit_threshold",
                format!("{} is outside (0, 1)", self.min_profit_threshold),
            ));
        }
        if !(self.max_trade_amount.is_finite() && self.max_trade_amount > 0.0) {
            return Err(ConfigError::invalid("max_trade_amount", "must be positive"));
        }
        if self.gas_limit == 0 {
            return Err(ConfigError::invalid("gas_limit", "must be positive"));
        }
        if self.gas_per_leg == 0 {
            return Err(ConfigError::invalid("gas_per_leg", "must be positive"));
        }
        if !(2..=4).contains(&self.max_leg_count) {
            return Err(ConfigError::invalid(
                "max_leg_count",
                format!("{} is outside 2..=4", self.max_leg_count),
            ));
        }
        let scan_interval = seconds("scan_interval", self.scan_interval)?;
        if scan_interval.as_secs_f64() > MAX_SCAN_INTERVAL_SECS {
            return Err(ConfigError::invalid(
                "scan_interval",
                format!("{} exceeds {} seconds", self.scan_interval, MAX_SCAN_INTERVAL_SECS),
            ));
        }
        seconds("staleness_bound", self.staleness_bound)?;
        if self.source_timeout_ms == 0 || self.submit_timeout_ms == 0 {
            return Err(ConfigError::invalid("timeouts", "must be positive"));
        }
        if self.max_concurrent_sources == 0 || self.max_concurrent_executions == 0 {
            return Err(ConfigError::invalid("concurrency limits", "must be positive"));
        }
        if self.max_executions_per_cycle == Some(0) {
            return Err(ConfigError::invalid("max_executions_per_cycle", "must be positive"));
        }
        if !(self.gas_bump_factor.is_finite() && self.gas_bump_factor > 1.0) {
            return Err(ConfigError::invalid("gas_bump_factor", "must be greater than 1"));
        }
        if !(0.0..1.0).contains(&self.price_tolerance) {
            return Err(ConfigError::invalid("price_tolerance", "must be within [0, 1)"));
        }
        if !(0.0..1.0).contains(&self.simulated_slippage) {
            return Err(ConfigError::invalid("simulated_slippage", "must be within [0, 1)"));
        }
        if self.enable_auto_trading && self.submit_endpoint.is_none() {
            return Err(ConfigError::MissingSubmitEndpoint);
        }
        Ok(())
    }

    /// Saturates when called on a configuration that failed `validate()`.
    pub fn scan_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.scan_interval).unwrap_or(Duration::MAX)
    }

    pub fn staleness_bound(&self) -> Duration {
        Duration::try_from_secs_f64(self.staleness_bound).unwrap_or(Duration::MAX)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn record_retention(&self) -> Duration {
        Duration::from_secs(self.record_retention_secs)
    }
}

/// Hides endpoint URLs, which often embed API keys.
impl fmt::Display for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "BotConfig(endpoints={}, auto_trading={}, min_profit={:.2}%, max_trade={}, legs<={}, scan={}s)",
            self.rpc_endpoints.len(),
            self.enable_auto_trading,
            self.min_profit_threshold * 100.0,
            self.max_trade_amount,
            self.max_leg_count,
            self.scan_interval
        )
    }
}

/// A positive number of seconds that fits in a `Duration`.
fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        Ok(_) => Err(ConfigError::invalid(field, "must be positive")),
        Err(e) => Err(ConfigError::invalid(field, format!("{}: {}", value, e))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Order-preserving de-duplication.
fn dedup_endpoints(endpoints: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    endpoints
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty() && seen.insert(e.clone()))
        .collect()
}

fn parse_env<T: FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(field, format!("{:?}: {}", value, e)))
}
