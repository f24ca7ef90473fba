//! Trade submission
//!
//! `TradeSubmitter` is the only path to the outside world for a trade.
//! `DryRunSubmitter` models the result without side effects and is what the
//! coordinator uses whenever auto trading is off. `RelaySubmitter` hands the
//! legs to an execution relay that signs and settles them.

use crate::error::ExecutionError;
use crate::types::{GasBid, LegSide, TradeLeg, TxOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Capability: submit a route and report how it settled.
///
/// Every attempt for one opportunity carries the same `opportunity_id`, so an
/// implementation that reaches the outside world can use it as an
/// idempotency key and settle a route at most once.
#[async_trait]
pub trait TradeSubmitter: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(
        &self,
        opportunity_id: &str,
        legs: &[TradeLeg],
        bid: GasBid,
    ) -> Result<TxOutcome, ExecutionError>;
}

/// Notional a route commits at its first leg, in the start asset.
pub fn route_notional(legs: &[TradeLeg]) -> f64 {
    match legs.first() {
        Some(leg) if leg.side == LegSide::Buy => leg.base_amount * leg.price,
        Some(leg) => leg.base_amount,
        None => 0.0,
    }
}

/// Gross profit the legs' prices imply, in the start asset.
pub fn route_gross_profit(legs: &[TradeLeg]) -> f64 {
    let round_trip: f64 = legs.iter().map(TradeLeg::rate).product();
    route_notional(legs) * (round_trip - 1.0)
}

/// For each leg, units of that leg's QUOTE asset per unit of the start asset,
/// taken at the first point of the route that holds the QUOTE asset.
/// Dividing a leg's gas price by its factor prices gas in the start asset.
pub fn quote_conversions(legs: &[TradeLeg]) -> Option<Vec<f64>> {
    let first = legs.first()?;
    let (base, quote) = first.key.assets()?;
    let mut held = vec![match first.side {
        LegSide::Buy => quote,
        LegSide::Sell => base,
    }];
    let mut cumulative = vec![1.0_f64];
    for leg in legs {
        let (base, quote) = leg.key.assets()?;
        held.push(match leg.side {
            LegSide::Buy => base,
            LegSide::Sell => quote,
        });
        cumulative.push(cumulative[cumulative.len() - 1] * leg.rate());
    }

    legs.iter()
        .map(|leg| {
            let (_, quote) = leg.key.assets()?;
            let position = held.iter().position(|asset| *asset == quote)?;
            Some(cumulative[position])
        })
        .collect()
}

/// Computes would-be results from the legs alone.
pub struct DryRunSubmitter {
    slippage: f64,
    gas_per_leg: u64,
    submissions: AtomicU64,
}

impl DryRunSubmitter {
    pub fn new(slippage: f64, gas_per_leg: u64) -> Self {
        Self {
            slippage,
            gas_per_leg,
            submissions: AtomicU64::new(0),
        }
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    fn tx_hash(legs: &[TradeLeg]) -> String {
        let mut hasher = Sha256::new();
        for leg in legs {
            hasher.update(leg.key.to_string().as_bytes());
            hasher.update(leg.side.to_string().as_bytes());
            hasher.update(leg.entry_sequence.to_be_bytes());
        }
        format!("dry-run-{}", &hex::encode(hasher.finalize())[..16])
    }
}

#[async_trait]
impl TradeSubmitter for DryRunSubmitter {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn submit(
        &self,
        _opportunity_id: &str,
        legs: &[TradeLeg],
        bid: GasBid,
    ) -> Result<TxOutcome, ExecutionError> {
        if legs.is_empty() {
            return Err(ExecutionError::Fatal("empty route".into()));
        }
        self.submissions.fetch_add(1, Ordering::Relaxed);

        let gross = route_gross_profit(legs);
        let outcome = TxOutcome {
            tx_hash: Self::tx_hash(legs),
            gross_proceeds: gross * (1.0 - self.slippage),
            gas_used: (self.gas_per_leg * legs.len() as u64).min(bid.gas_limit),
        };
        info!(
            tx = %outcome.tx_hash,
            proceeds = outcome.gross_proceeds,
            gas_used = outcome.gas_used,
            "Dry run: would execute trade (simulation)"
        );
        Ok(outcome)
    }
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    /// Idempotency key: the relay settles each id at most once and answers
    /// repeats with the original settlement.
    opportunity_id: &'a str,
    legs: &'a [TradeLeg],
    gas_bid: GasBid,
}

#[derive(Debug, Deserialize)]
struct RelayRejection {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Posts routes to an execution relay over HTTP.
///
/// The relay answers `200` with a `TxOutcome` body once the trade settled.
/// Rejections carry `{"code", "message"}`; `underpriced_gas` and `nonce_too_low`
/// are retryable, as are 429 and 5xx responses. Everything else is fatal.
/// A `200` whose body cannot be read leaves the outcome unknown; it is
/// retried under the same opportunity id to fetch the settlement.
pub struct RelaySubmitter {
    endpoint: String,
    client: reqwest::Client,
}

impl RelaySubmitter {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("omniarb-bot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    fn classify(status: reqwest::StatusCode, body: &str) -> ExecutionError {
        let rejection: RelayRejection = serde_json::from_str(body).unwrap_or(RelayRejection {
            code: String::new(),
            message: body.chars().take(200).collect(),
        });
        let detail = format!("relay returned {}: {} {}", status, rejection.code, rejection.message);

        match rejection.code.as_str() {
            "underpriced_gas" | "replacement_underpriced" => return ExecutionError::underpriced(detail),
            "nonce_too_low" | "transient" => return ExecutionError::transient(detail),
            _ => {}
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ExecutionError::transient(detail)
        } else {
            ExecutionError::Fatal(detail)
        }
    }

    fn read_settlement(opportunity_id: &str, body: &str) -> Result<TxOutcome, ExecutionError> {
        serde_json::from_str(body).map_err(|e| {
            error!(
                id = %opportunity_id,
                error = %e,
                "Relay accepted trade but settlement is unreadable, outcome unknown"
            );
            ExecutionError::unknown_outcome(format!("unreadable settlement: {}", e))
        })
    }
}

#[async_trait]
impl TradeSubmitter for RelaySubmitter {
    fn name(&self) -> &str {
        "relay"
    }

    async fn submit(
        &self,
        opportunity_id: &str,
        legs: &[TradeLeg],
        bid: GasBid,
    ) -> Result<TxOutcome, ExecutionError> {
        let request = RelayRequest {
            opportunity_id,
            legs,
            gas_bid: bid,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutionError::transient(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, &body));
        }

        let body = response.text().await.map_err(|e| {
            ExecutionError::unknown_outcome(format!("settlement body lost: {}", e.without_url()))
        })?;
        let outcome = Self::read_settlement(opportunity_id, &body)?;
        debug!(tx = %outcome.tx_hash, gas_used = outcome.gas_used, "Relay settled trade");
        Ok(outcome)
    }
}
