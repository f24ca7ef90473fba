//! Execution state machine
//!
//! `Pending -> Claimed -> Submitted -> {Completed | Failed -> (Submitted | Abandoned)}`,
//! plus `Claimed -> Abandoned` when revalidation finds the opportunity stale.

use crate::error::{AbandonReason, ExecutionError};
use crate::types::{GasBid, Opportunity, TxOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecutionState {
    Pending,
    Claimed,
    Submitted,
    Completed,
    Failed,
    Abandoned,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Submitted)
                | (Claimed, Abandoned)
                | (Submitted, Completed)
                | (Submitted, Failed)
                | (Failed, Submitted)
                | (Failed, Abandoned)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one claimed opportunity. Mutated only by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub opportunity_id: String,
    pub route: String,
    pub expected_net_profit: f64,
    pub state: ExecutionState,
    /// Every state visited, in order.
    pub history: Vec<ExecutionState>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub gas_bid: Option<GasBid>,
    pub tx_hash: Option<String>,
    pub realized_profit: Option<f64>,
    pub gas_used: Option<u64>,
    #[serde(skip)]
    pub abandon_reason: Option<AbandonReason>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// A record that has just won the claim.
    pub fn claimed(opportunity: &Opportunity) -> Self {
        let mut record = Self {
            opportunity_id: opportunity.id.clone(),
            route: opportunity.route(),
            expected_net_profit: opportunity.expected_net_profit,
            state: ExecutionState::Pending,
            history: vec![ExecutionState::Pending],
            attempts: 0,
            last_error: None,
            gas_bid: None,
            tx_hash: None,
            realized_profit: None,
            gas_used: None,
            abandon_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        record.transition(ExecutionState::Claimed);
        record
    }

    fn transition(&mut self, next: ExecutionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
        self.history.push(next);
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Enter `Submitted` for a new attempt. Returns the attempt number.
    pub fn submitted(&mut self, bid: GasBid) -> u32 {
        self.transition(ExecutionState::Submitted);
        self.attempts += 1;
        self.gas_bid = Some(bid);
        self.attempts
    }

    pub fn failed(&mut self, error: &ExecutionError) {
        self.transition(ExecutionState::Failed);
        self.last_error = Some(error.to_string());
    }

    pub fn completed(&mut self, outcome: &TxOutcome, realized_profit: f64) {
        self.transition(ExecutionState::Completed);
        self.tx_hash = Some(outcome.tx_hash.clone());
        self.gas_used = Some(outcome.gas_used);
        self.realized_profit = Some(realized_profit);
    }

    pub fn abandoned(&mut self, reason: AbandonReason) {
        self.transition(ExecutionState::Abandoned);
        self.last_error = Some(reason.to_string());
        self.abandon_reason = Some(reason);
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
