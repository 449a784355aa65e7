//! # EvolutionLoop — multi-generation driver
//!
//! ## Responsibility
//! Repeat select → build → wait → close for up to `max_generations`
//! generations on top of a [`PopulationManager`].
//!
//! ## Guarantees
//! - Barrier: a generation is only closed after every task reported a
//!   terminal status or `generation_timeout` elapsed; on timeout the
//!   transition force-fails the stragglers
//! - Graceful stop: a shutdown signal is honoured between generations and
//!   while waiting; the generation in flight is still closed
//! - Ends cleanly when no eligible parents remain
//!
//! ## NOT Responsible For
//! - Running tasks (workers report via `PopulationManager::update_agent_status`)

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::population::{GenerationResult, GenerationStats, PopulationError, PopulationManager};
use crate::selection::SelectionError;

/// Loop limits.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Generations to run before stopping.
    pub max_generations: u32,
    /// Longest wait for one generation's tasks.
    pub generation_timeout: Duration,
    /// Fallback re-check interval while waiting.
    pub poll_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_generations: 10,
            generation_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&EngineConfig> for LoopConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_generations: config.evolution.max_generations,
            generation_timeout: Duration::from_secs(config.evolution.task_timeout_secs),
            poll_interval: Duration::from_millis(config.process.status_poll_interval_ms),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `max_generations` reached.
    MaxGenerations,
    /// The shutdown signal fired.
    Shutdown,
    /// The archive had no eligible parents.
    NoEligibleParents,
}

/// Result of a loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSummary {
    /// Per-generation statistics, oldest first.
    pub generations: Vec<GenerationStats>,
    /// Per-generation summaries, oldest first.
    pub results: Vec<GenerationResult>,
    /// Generations that hit `generation_timeout`.
    pub timed_out: Vec<u32>,
    /// Why the loop ended.
    pub stop_reason: StopReason,
}

/// Drives a [`PopulationManager`] across generations.
#[derive(Debug)]
pub struct EvolutionLoop {
    manager: Arc<PopulationManager>,
    config: LoopConfig,
}

impl EvolutionLoop {
    /// Loop over `manager`.
    pub fn new(manager: Arc<PopulationManager>, config: LoopConfig) -> Self {
        Self { manager, config }
    }

    /// Run until `max_generations`, shutdown or parent exhaustion.
    ///
    /// # Errors
    /// Propagates store and archive failures from the manager.
    /// `NoEligibleParents` is a normal stop, not an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<LoopSummary, PopulationError> {
        let mut summary = LoopSummary {
            generations: Vec::new(),
            results: Vec::new(),
            timed_out: Vec::new(),
            stop_reason: StopReason::MaxGenerations,
        };

        for _ in 0..self.config.max_generations {
            if *shutdown.borrow() {
                summary.stop_reason = StopReason::Shutdown;
                break;
            }

            let generation = self.manager.next_generation_number().await;
            match self.manager.create_next_generation().await {
                Ok(children) => {
                    info!(generation, children = children.len(), "generation started");
                }
                Err(PopulationError::Selection(SelectionError::NoEligibleParents)) => {
                    info!(generation, "no eligible parents, stopping");
                    summary.stop_reason = StopReason::NoEligibleParents;
                    break;
                }
                Err(e) => return Err(e),
            }

            let completed = tokio::select! {
                done = self.manager.wait_for_generation(
                    generation,
                    self.config.generation_timeout,
                    self.config.poll_interval,
                ) => done,
                Ok(_) = shutdown.wait_for(|stop| *stop) => {
                    summary.stop_reason = StopReason::Shutdown;
                    false
                }
            };
            if !completed && summary.stop_reason != StopReason::Shutdown {
                warn!(generation, "generation timed out, failing unfinished agents");
                summary.timed_out.push(generation);
            }

            let stats = self.manager.transition_generation().await?;
            let result = self.manager.process_generation_results(generation).await;
            summary.generations.push(stats);
            summary.results.push(result);

            let health = self.manager.get_population_health().await;
            if !health.healthy {
                for issue in &health.issues {
                    warn!(generation, issue = %issue.description, "population health");
                }
            }

            if summary.stop_reason == StopReason::Shutdown {
                break;
            }
        }

        info!(
            generations = summary.generations.len(),
            reason = ?summary.stop_reason,
            "evolution loop finished"
        );
        Ok(summary)
    }
}
