//! # Population — generation lifecycle
//!
//! ## Responsibility
//! Build generations of child agents from selected parents, track them until
//! they are evaluated, and summarise each generation at its boundary.
//!
//! ## Modules
//! - [`task`] — `EvolutionTask`, `SelfImproveEntry`, `GenerationResult`
//! - [`entry`] — fitness-driven choice of improvement strategy
//! - [`health`] — generation statistics and advisory diagnostics
//! - [`manager`] — [`PopulationManager`], the stateful scheduler

pub mod entry;
pub mod health;
pub mod manager;
pub mod task;

pub use entry::generate_self_improve_entry;
pub use health::{
    diagnose, GenerationStats, HealthIssue, HealthIssueKind, HealthThresholds, PopulationHealth,
};
pub use manager::{
    EvolutionMetrics, GenerationFitness, GenerationPhase, PopulationConfig, PopulationError,
    PopulationManager,
};
pub use task::{
    task_priority, EvolutionTask, GenerationResult, SelectedEntry, SelfImproveEntry, TaskStatus,
};
