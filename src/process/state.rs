//! Process states and per-phase timing records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of an [`EvolutionProcess`](super::EvolutionProcess).
///
/// Main chain: `Pending` → `Generating` → `Testing` → `Validating` →
/// `AwaitingApproval` → `Applying` → `Completed`. `Rollback` is entered only
/// from a failed `Applying` and always ends in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Not started.
    Pending,
    /// Building the evolution request.
    Generating,
    /// Producing code and running it in a sandbox.
    Testing,
    /// Scoring the sandbox outcome.
    Validating,
    /// Waiting for automatic or human approval.
    AwaitingApproval,
    /// Applying the approved change.
    Applying,
    /// Restoring the pre-change snapshot after a failed apply.
    Rollback,
    /// Change applied.
    Completed,
    /// A phase failed.
    Failed,
    /// Cancelled from outside.
    Cancelled,
    /// Approval declined.
    Rejected,
}

impl ProcessState {
    /// `true` for `Completed`, `Failed`, `Cancelled` and `Rejected`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Rejected
        )
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Testing => "testing",
            Self::Validating => "validating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Applying => "applying",
            Self::Rollback => "rollback",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Still in progress.
    Running,
    /// Finished normally.
    Completed,
    /// Raised an error.
    Failed,
    /// Interrupted by cancellation or rejection.
    Cancelled,
}

/// Timing of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Phase this record covers.
    pub phase: ProcessState,
    /// When the phase began.
    pub started_at: DateTime<Utc>,
    /// When the phase ended, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// Outcome so far.
    pub status: PhaseStatus,
    /// Wall time in milliseconds, once ended.
    pub duration_ms: Option<u64>,
}

impl PhaseRecord {
    pub(crate) fn start(phase: ProcessState) -> Self {
        Self {
            phase,
            started_at: Utc::now(),
            ended_at: None,
            status: PhaseStatus::Running,
            duration_ms: None,
        }
    }

    pub(crate) fn finish(&mut self, status: PhaseStatus) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.status = status;
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}
