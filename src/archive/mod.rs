//! # Archive — durable record of evaluated agents
//!
//! ## Responsibility
//! Define the [`ArchiveManager`] contract that the population layer consumes:
//! lookup by id and generation, the eligible parent pool, the generation
//! counter, and population-level convergence signals.
//!
//! ## Guarantees
//! - Single source of truth: an agent reported `evaluated` lives here, not in
//!   the population's active set
//! - Object-safe: consumed as `Arc<dyn ArchiveManager>`
//!
//! ## NOT Responsible For
//! - Parent selection (see: `selection`)
//! - In-flight agents (see: `population`)
//!
//! ## Modules
//! - [`memory`] — [`InMemoryArchive`], a complete in-process implementation
//!   with optional JSON persistence

pub mod memory;

pub use memory::{ArchiveUpdateMethod, InMemoryArchive};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::Agent;

/// Errors produced by archive implementations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The referenced agent is not in the archive.
    #[error("agent not found in archive: {0}")]
    AgentNotFound(String),

    /// Writing the archive to durable storage failed.
    #[error("archive persistence failed: {0}")]
    Persistence(String),

    /// The archive could not be serialized or deserialized.
    #[error("archive serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem I/O error.
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Population-level convergence signals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceMetrics {
    /// Consecutive generation increments without a new best accuracy.
    pub stagnation_count: u32,
    /// Distinct root lineages among eligible parents divided by their count.
    pub diversity_score: f64,
    /// Best archive accuracy recorded at each generation boundary.
    #[serde(default)]
    pub best_fitness_history: Vec<f64>,
    /// Mean accuracy of each closed generation's evaluated agents.
    #[serde(default)]
    pub mean_fitness_history: Vec<f64>,
}

/// Summary metadata describing the archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    /// Current generation counter.
    pub current_generation: u32,
    /// Total number of agents stored.
    pub total_agents: usize,
    /// Best accuracy among eligible agents.
    pub best_accuracy: Option<f64>,
    /// Convergence signals.
    pub convergence_metrics: ConvergenceMetrics,
}

/// Snapshot of the archive's contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveState {
    /// Every agent id in insertion order.
    pub agent_ids: Vec<String>,
    /// Aggregate metadata.
    pub metadata: ArchiveMetadata,
}

/// Contract for the durable store of evaluated agents.
#[async_trait]
pub trait ArchiveManager: Send + Sync {
    /// Look up an agent by id.
    async fn get_agent(&self, id: &str) -> Option<Agent>;

    /// Agents with status `evaluated` and a fitness record.
    async fn get_eligible_parents(&self) -> Vec<Agent>;

    /// Agents belonging to `generation`.
    async fn get_agents_by_generation(&self, generation: u32) -> Vec<Agent>;

    /// Every stored agent.
    async fn get_all_agents(&self) -> Vec<Agent>;

    /// The eligible agent with the highest accuracy.
    async fn get_best_agent(&self) -> Option<Agent>;

    /// Current generation counter.
    async fn get_current_generation(&self) -> u32;

    /// Close the current generation and return the new counter value.
    async fn increment_generation(&self) -> u32;

    /// Insert or replace an agent record.
    async fn add_agent(&self, agent: Agent) -> Result<(), ArchiveError>;

    /// Increment `children_count` on a stored parent.
    async fn record_child(&self, parent_id: &str) -> Result<u32, ArchiveError>;

    /// Flush the archive to durable storage.
    async fn persist_to_disk(&self) -> Result<(), ArchiveError>;

    /// Snapshot of ids and metadata.
    async fn get_archive_state(&self) -> ArchiveState;
}
