//! # Agent — candidate code variant
//!
//! ## Responsibility
//! Define the [`Agent`] record that flows through a generation: its identity,
//! genealogy, lifecycle status, and the [`Fitness`] reported by the execution
//! backend once it has been evaluated.
//!
//! ## Guarantees
//! - Time-ordered ids: [`new_agent_id`] sorts lexically by creation time
//! - Serializable: every type round-trips through serde (JSON ↔ Rust)
//! - Non-panicking: all operations are infallible or return `Option`
//!
//! ## NOT Responsible For
//! - Ownership transfer between the active set and the archive (see: `population`)
//! - Durable storage of evaluated agents (see: `archive`)

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an [`Agent`].
///
/// Agents progress: `Pending` → `Running` → `Evaluated` | `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Created, waiting for the execution backend to pick up its task.
    Pending,
    /// The execution backend is generating or evaluating this agent.
    Running,
    /// Evaluation finished; `fitness` is populated.
    Evaluated,
    /// Generation or evaluation failed, or the generation closed without a result.
    Failed,
}

impl AgentStatus {
    /// Returns `true` for `Evaluated` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Evaluated | Self::Failed)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Evaluated => write!(f, "evaluated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Benchmark outcome of an evaluated agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fitness {
    /// Fraction of benchmark instances resolved, in `[0.0, 1.0]`.
    pub accuracy: f64,
    /// Number of resolved benchmark instances.
    pub resolved_count: u32,
    /// Number of unresolved benchmark instances.
    pub unresolved_count: u32,
    /// Number of instances for which the agent produced an empty patch.
    pub empty_patch_count: u32,
    /// Whether the agent's code compiled.
    pub compilation_success: bool,
    /// Whether any run exceeded the model context window.
    pub context_length_exceeded: bool,
    /// Identifiers of the unresolved instances, used to target follow-up work.
    #[serde(default)]
    pub unresolved_ids: Vec<String>,
}

impl Fitness {
    /// Build a fitness record from resolved/unresolved counts.
    ///
    /// Accuracy is `resolved / (resolved + unresolved)`, or `0.0` when both are zero.
    pub fn from_counts(resolved_count: u32, unresolved_count: u32) -> Self {
        let total = u64::from(resolved_count) + u64::from(unresolved_count);
        let accuracy = if total == 0 {
            0.0
        } else {
            f64::from(resolved_count) / total as f64
        };
        Self {
            accuracy,
            resolved_count,
            unresolved_count,
            empty_patch_count: 0,
            compilation_success: true,
            context_length_exceeded: false,
            unresolved_ids: Vec::new(),
        }
    }

    /// Build a fitness record with only an accuracy value.
    pub fn with_accuracy(accuracy: f64) -> Self {
        Self {
            accuracy: accuracy.clamp(0.0, 1.0),
            resolved_count: 0,
            unresolved_count: 0,
            empty_patch_count: 0,
            compilation_success: true,
            context_length_exceeded: false,
            unresolved_ids: Vec::new(),
        }
    }
}

/// Bookkeeping attached to every agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// How many children have been created from this agent.
    pub children_count: u32,
    /// When the agent record was allocated.
    pub created_at: DateTime<Utc>,
    /// When the agent reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Reason for failure, if any.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            children_count: 0,
            created_at: Utc::now(),
            finished_at: None,
            failure_reason: None,
        }
    }
}

/// A candidate code variant produced by one generation.
///
/// # Example
///
/// ```rust
/// use tokio_evolution_orchestrator::agent::{Agent, AgentStatus, Fitness};
///
/// let seed = Agent::seed("initial").with_fitness(Fitness::with_accuracy(0.4));
/// let child = Agent::child_of(&seed, 1);
/// assert_eq!(child.parent_id.as_deref(), Some("initial"));
/// assert_eq!(child.status, AgentStatus::Pending);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique, time-ordered identifier.
    pub id: String,
    /// Parent agent id; `None` only for generation-0 seeds.
    pub parent_id: Option<String>,
    /// Generation this agent belongs to.
    pub generation: u32,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Populated once the agent has been evaluated.
    #[serde(default)]
    pub fitness: Option<Fitness>,
    /// Selection and lifecycle bookkeeping.
    #[serde(default)]
    pub metadata: AgentMetadata,
}

impl Agent {
    /// Create a pending generation-0 seed with the given id.
    pub fn seed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            generation: 0,
            status: AgentStatus::Pending,
            fitness: None,
            metadata: AgentMetadata::default(),
        }
    }

    /// Allocate a new pending child of `parent` in `generation`.
    pub fn child_of(parent: &Agent, generation: u32) -> Self {
        Self {
            id: new_agent_id(),
            parent_id: Some(parent.id.clone()),
            generation,
            status: AgentStatus::Pending,
            fitness: None,
            metadata: AgentMetadata::default(),
        }
    }

    /// Mark the agent evaluated with `fitness`.
    pub fn with_fitness(mut self, fitness: Fitness) -> Self {
        self.status = AgentStatus::Evaluated;
        self.fitness = Some(fitness);
        self.metadata.finished_at = Some(Utc::now());
        self
    }

    /// Accuracy if the agent has been evaluated.
    pub fn accuracy(&self) -> Option<f64> {
        self.fitness.as_ref().map(|f| f.accuracy)
    }

    /// `true` if the agent may be chosen as a parent.
    pub fn is_eligible_parent(&self) -> bool {
        self.status == AgentStatus::Evaluated && self.fitness.is_some()
    }

    /// Set a terminal failure with a reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = AgentStatus::Failed;
        self.metadata.failure_reason = Some(reason.into());
        self.metadata.finished_at = Some(Utc::now());
    }
}

/// Allocate a new agent id: zero-padded millisecond timestamp plus a random suffix.
pub fn new_agent_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis:013}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_status_terminal() {
        assert!(!AgentStatus::Pending.is_terminal());
        assert!(!AgentStatus::Running.is_terminal());
        assert!(AgentStatus::Evaluated.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_agent_status_display_is_snake_case() {
        assert_eq!(AgentStatus::Evaluated.to_string(), "evaluated");
        let json = serde_json::to_string(&AgentStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn test_fitness_from_counts() {
        let f = Fitness::from_counts(13, 7);
        assert!((f.accuracy - 0.65).abs() < 1e-9);
        assert_eq!(Fitness::from_counts(0, 0).accuracy, 0.0);
    }

    #[test]
    fn test_fitness_from_counts_near_u32_max() {
        let f = Fitness::from_counts(u32::MAX, u32::MAX);
        assert!((f.accuracy - 0.5).abs() < 1e-9);
        assert_eq!(f.resolved_count, u32::MAX);

        let f = Fitness::from_counts(u32::MAX, 1);
        assert!(f.accuracy < 1.0 && f.accuracy > 0.999);
        assert_eq!(Fitness::from_counts(0, u32::MAX).accuracy, 0.0);
    }

    #[test]
    fn test_with_accuracy_clamps() {
        assert_eq!(Fitness::with_accuracy(1.7).accuracy, 1.0);
        assert_eq!(Fitness::with_accuracy(-0.2).accuracy, 0.0);
    }

    #[test]
    fn test_child_links_parent_and_starts_pending() {
        let parent = Agent::seed("p").with_fitness(Fitness::with_accuracy(0.5));
        let child = Agent::child_of(&parent, 3);
        assert_eq!(child.parent_id.as_deref(), Some("p"));
        assert_eq!(child.generation, 3);
        assert_eq!(child.status, AgentStatus::Pending);
        assert_eq!(child.metadata.children_count, 0);
        assert!(child.fitness.is_none());
    }

    #[test]
    fn test_eligibility_requires_evaluated_fitness() {
        let mut a = Agent::seed("a");
        assert!(!a.is_eligible_parent());
        a.status = AgentStatus::Evaluated;
        assert!(!a.is_eligible_parent());
        let a = a.with_fitness(Fitness::with_accuracy(0.1));
        assert!(a.is_eligible_parent());
    }

    #[test]
    fn test_mark_failed_records_reason() {
        let mut a = Agent::seed("a");
        a.mark_failed("timeout");
        assert_eq!(a.status, AgentStatus::Failed);
        assert_eq!(a.metadata.failure_reason.as_deref(), Some("timeout"));
        assert!(a.metadata.finished_at.is_some());
    }

    #[test]
    fn test_agent_ids_are_unique_and_time_prefixed() {
        let a = new_agent_id();
        let b = new_agent_id();
        assert_ne!(a, b);
        assert_eq!(a.split('-').next().map(str::len), Some(13));
    }
}
