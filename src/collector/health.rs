//! Per-source health tracking

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rolling health of one market source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceHealth {
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    /// Sequence number handed to the source's last accepted round.
    pub sequence: u64,
}

impl SourceHealth {
    /// Record a successful round and return the sequence number for its entries.
    pub fn record_success(&mut self, at: DateTime<Utc>) -> u64 {
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.last_success = Some(at);
        self.sequence += 1;
        self.sequence
    }

    pub fn record_failure(&mut self, error: impl ToString) {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures > 0
    }
}
