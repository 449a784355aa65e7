//! Typed process errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::ProcessState;

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The evolution request could not be built.
    GenerationFailed,
    /// Snapshot, code generation or sandbox execution raised an error.
    TestingFailed,
    /// Validation raised an error.
    ValidationFailed,
    /// The policy store or approval UI raised an error.
    ApprovalFailed,
    /// Applying the change failed; rollback was attempted.
    ApplicationFailed,
    /// `execute` was called on a process that is not pending.
    InvalidState,
}

impl ErrorCode {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerationFailed => "GENERATION_FAILED",
            Self::TestingFailed => "TESTING_FAILED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ApprovalFailed => "APPROVAL_FAILED",
            Self::ApplicationFailed => "APPLICATION_FAILED",
            Self::InvalidState => "INVALID_STATE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an evolution process, tagged with the phase it happened in.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code} during {phase}: {message}")]
pub struct ProcessError {
    /// Failure category.
    pub code: ErrorCode,
    /// Human-readable cause.
    pub message: String,
    /// Phase that failed.
    pub phase: ProcessState,
    /// Extra structured context, e.g. rollback outcome.
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl ProcessError {
    /// Error without details.
    pub fn new(code: ErrorCode, message: impl Into<String>, phase: ProcessState) -> Self {
        Self {
            code,
            message: message.into(),
            phase,
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
