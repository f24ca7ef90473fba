//! Error taxonomy for the arbitrage pipeline.
//!
//! Per-source and per-opportunity failures are absorbed where they happen
//! (collector and coordinator). Only configuration errors and a round in
//! which no source answered reach the orchestrator's caller.

use std::time::Duration;
use thiserror::Error;

/// Configuration rejected at load or validation time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no RPC endpoints configured")]
    NoEndpoints,

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("auto trading requires a submit endpoint for the execution relay")]
    MissingSubmitEndpoint,

    #[error("auto trading enabled but no live trade submitter was supplied")]
    MissingSubmitter,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A source that could not contribute to a collection round.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("source unavailable: no response within {0:?}")]
    Timeout(Duration),

    #[error("source unavailable: {0}")]
    Transport(String),

    #[error("source unavailable: malformed data: {0}")]
    Malformed(String),
}

/// Failure class for errors that may succeed on resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableKind {
    Timeout,
    TransientRpc,
    UnderpricedGas,
    /// The submitter cannot tell whether the trade settled.
    UnknownOutcome,
}

/// Error returned by a trade submitter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("retryable execution error ({kind:?}): {message}")]
    Retryable { kind: RetryableKind, message: String },

    #[error("fatal execution error: {0}")]
    Fatal(String),
}

impl ExecutionError {
    pub fn timeout(elapsed: Duration) -> Self {
        Self::Retryable {
            kind: RetryableKind::Timeout,
            message: format!("no settlement within {:?}", elapsed),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Retryable {
            kind: RetryableKind::TransientRpc,
            message: message.into(),
        }
    }

    pub fn underpriced(message: impl Into<String>) -> Self {
        Self::Retryable {
            kind: RetryableKind::UnderpricedGas,
            message: message.into(),
        }
    }

    pub fn unknown_outcome(message: impl Into<String>) -> Self {
        Self::Retryable {
            kind: RetryableKind::UnknownOutcome,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Why an execution record ended in `Abandoned`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AbandonReason {
    #[error("stale opportunity: {0}")]
    StaleOpportunity(String),

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("{0}")]
    Fatal(String),
}

/// Benign signal: another caller already owns this opportunity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("opportunity {0} already claimed")]
pub struct AlreadyClaimed(pub String);

/// Errors that stop the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("all {sources} market sources unavailable")]
    AllSourcesUnavailable { sources: usize },

    #[error("orchestrator is not active")]
    Inactive,

    #[error("orchestrator is active")]
    Active,
}
