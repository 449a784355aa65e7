//! # tokio-evolution-orchestrator
//!
//! Generation scheduling, parent selection and a per-candidate evolution
//! state machine for self-improving coding agents over Tokio.
//!
//! ## Architecture
//!
//! ```text
//! Archive ──eligible parents──► SelectionEngine ──picks──► PopulationManager
//!    ▲                                                        │ tasks
//!    └────────── evaluated / force-failed agents ◄── ExecutionBackend
//!
//! ImprovementHypothesis ──► EvolutionOrchestrator (Semaphore) ──► EvolutionProcess
//!     generating → testing → validating → awaiting_approval → applying
//! ```
//!
//! [`EvolutionLoop`](evolution_loop::EvolutionLoop) repeats the population
//! cycle across generations; progress is published on an
//! [`EventBus`](events::EventBus).

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod agent;
pub mod archive;
pub mod backend;
pub mod config;
pub mod events;
pub mod evolution_loop;
pub mod metrics;
pub mod orchestrator;
pub mod population;
pub mod process;
pub mod selection;
pub mod store;

// Re-exports for convenience
pub use agent::{Agent, AgentStatus, Fitness};
pub use archive::{ArchiveManager, InMemoryArchive};
pub use config::EngineConfig;
pub use evolution_loop::{EvolutionLoop, LoopConfig};
pub use orchestrator::{EvolutionOrchestrator, OrchestratorStatus};
pub use population::PopulationManager;
pub use process::{EvolutionProcess, ImprovementHypothesis, ProcessError, ProcessState};
pub use selection::{SelectionEngine, SelectionMethod};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use tokio_evolution_orchestrator::{init_tracing, OrchestratorError};
/// # fn example() -> Result<(), OrchestratorError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level engine errors.
///
/// Every module error converts into a variant here so binaries can use a
/// single `Result<_, OrchestratorError>`.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Generation scheduling failed.
    #[error(transparent)]
    Population(#[from] population::PopulationError),

    /// An evolution process failed.
    #[error(transparent)]
    Process(#[from] process::ProcessError),

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// The resumability store could not be set up.
    #[error(transparent)]
    Store(#[from] store::StoreError),

    /// A spawned task panicked or was aborted.
    #[error("task join failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_converts() {
        let err: OrchestratorError = process::ProcessError::new(
            process::ErrorCode::TestingFailed,
            "boom",
            ProcessState::Testing,
        )
        .into();
        assert!(err.to_string().contains("TESTING_FAILED"));
    }

    #[test]
    fn test_selection_error_surfaces_through_population() {
        let err: OrchestratorError =
            population::PopulationError::from(selection::SelectionError::NoEligibleParents).into();
        assert!(matches!(err, OrchestratorError::Population(_)));
    }

    #[test]
    fn test_second_tracing_init_is_error_not_panic() {
        let _ = init_tracing();
        assert!(init_tracing().is_err());
    }
}
