//! Work items and generation summaries produced by the population manager.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::new_agent_id;

/// Lowest task priority.
pub const MIN_PRIORITY: f64 = 0.0;
/// Highest task priority.
pub const MAX_PRIORITY: f64 = 10.0;

/// Improvement strategy requested for one child agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelfImproveEntry {
    /// The parent produced empty patches; make it always emit a diff.
    SolveEmptyPatches,
    /// The parent's results are noisy; push accuracy toward `target_accuracy`.
    SolveStochasticity {
        /// Accuracy the child should reach, in `[0, 1]`.
        target_accuracy: f64,
    },
    /// The parent overflowed its context window.
    #[serde(rename = "solve_contextlength")]
    SolveContextLength,
    /// Target one specific unresolved benchmark instance.
    SolveInstance {
        /// Benchmark instance id.
        instance_id: String,
    },
    /// No specific weakness detected.
    GeneralImprovement,
}

impl SelfImproveEntry {
    /// Wire tag of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SolveEmptyPatches => "solve_empty_patches",
            Self::SolveStochasticity { .. } => "solve_stochasticity",
            Self::SolveContextLength => "solve_contextlength",
            Self::SolveInstance { .. } => "solve_instance",
            Self::GeneralImprovement => "general_improvement",
        }
    }

    /// One-line instruction handed to the code generator.
    pub fn instruction(&self) -> String {
        match self {
            Self::SolveEmptyPatches => {
                "Ensure the agent always produces a non-empty patch.".to_string()
            }
            Self::SolveStochasticity { target_accuracy } => format!(
                "Make the agent's results more consistent; target accuracy {target_accuracy:.2}."
            ),
            Self::SolveContextLength => {
                "Keep the agent within the model context window.".to_string()
            }
            Self::SolveInstance { instance_id } => {
                format!("Make the agent resolve benchmark instance {instance_id}.")
            }
            Self::GeneralImprovement => "Improve the agent's overall accuracy.".to_string(),
        }
    }
}

impl fmt::Display for SelfImproveEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SolveInstance { instance_id } => write!(f, "solve_instance:{instance_id}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Status of an [`EvolutionTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, not yet picked up.
    Pending,
    /// Being executed.
    Running,
    /// Finished with an evaluated agent.
    Completed,
    /// Finished without an evaluated agent.
    Failed,
}

impl TaskStatus {
    /// `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of submitted self-improvement work; exactly one per created agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionTask {
    /// Task id.
    pub id: String,
    /// Agent the new child is derived from.
    pub parent_commit_id: String,
    /// Requested improvement strategy.
    pub entry: SelfImproveEntry,
    /// Scheduling priority in `[0, 10]`.
    pub priority: f64,
    /// Generation the child belongs to.
    pub generation: u32,
    /// Current status.
    pub status: TaskStatus,
    /// Id of the child agent this task produces.
    pub assigned_to: String,
    /// When the task was built.
    pub created_at: DateTime<Utc>,
}

impl EvolutionTask {
    /// Pending task producing `child_id` from `parent_id`.
    pub fn new(
        parent_id: impl Into<String>,
        entry: SelfImproveEntry,
        priority: f64,
        generation: u32,
        child_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("task-{}", new_agent_id()),
            parent_commit_id: parent_id.into(),
            entry,
            priority,
            generation,
            status: TaskStatus::Pending,
            assigned_to: child_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Priority derived from the parent's accuracy: `clamp(5 + accuracy * 5, 0, 10)`.
pub fn task_priority(parent_accuracy: f64) -> f64 {
    (5.0 + parent_accuracy * 5.0).clamp(MIN_PRIORITY, MAX_PRIORITY)
}

/// A parent paired with the improvement it should undergo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedEntry {
    /// Parent agent id.
    pub parent_id: String,
    /// Requested improvement.
    pub entry: SelfImproveEntry,
}

impl SelectedEntry {
    /// Pair `parent_id` with `entry`.
    pub fn new(parent_id: impl Into<String>, entry: SelfImproveEntry) -> Self {
        Self {
            parent_id: parent_id.into(),
            entry,
        }
    }
}

/// Immutable summary of a finished generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Generation number.
    pub generation: u32,
    /// Parent/entry pairs the generation was built from.
    pub self_improve_entries: Vec<SelectedEntry>,
    /// Every agent id produced.
    pub children: Vec<String>,
    /// Children whose code compiled.
    pub children_compiled: Vec<String>,
    /// Archive agent ids at summary time.
    pub archive: Vec<String>,
    /// When the summary was built.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_priority_range() {
        assert_eq!(task_priority(0.0), 5.0);
        assert_eq!(task_priority(1.0), 10.0);
        assert!((task_priority(0.65) - 8.25).abs() < 1e-9);
        assert_eq!(task_priority(3.0), 10.0);
        assert_eq!(task_priority(-2.0), 0.0);
    }

    #[test]
    fn test_entry_tags() {
        let json = serde_json::to_value(SelfImproveEntry::SolveContextLength).unwrap();
        assert_eq!(json["kind"], "solve_contextlength");
        let json = serde_json::to_value(SelfImproveEntry::SolveInstance {
            instance_id: "django-1".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "solve_instance");
        assert_eq!(json["instance_id"], "django-1");
    }

    #[test]
    fn test_entry_display_includes_instance() {
        let e = SelfImproveEntry::SolveInstance {
            instance_id: "x-9".into(),
        };
        assert_eq!(e.to_string(), "solve_instance:x-9");
        assert_eq!(SelfImproveEntry::GeneralImprovement.to_string(), "general_improvement");
    }

    #[test]
    fn test_new_task_is_pending_and_assigned() {
        let t = EvolutionTask::new("p", SelfImproveEntry::SolveEmptyPatches, 6.0, 2, "c");
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.assigned_to, "c");
        assert_eq!(t.parent_commit_id, "p");
        assert!(t.id.starts_with("task-"));
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
