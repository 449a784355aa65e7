//! # Population health diagnostics
//!
//! ## Responsibility
//! Turn convergence metrics and generation statistics into advisory
//! [`HealthIssue`]s, each with a recommendation.
//!
//! ## Guarantees
//! - Advisory only: nothing here blocks a generation transition
//! - Independent checks: issues are not mutually exclusive
//!
//! ## NOT Responsible For
//! - Computing convergence metrics (see: `archive`)

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentStatus};
use crate::archive::ConvergenceMetrics;

/// Counts and fitness summary for one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Generation number.
    pub generation: u32,
    /// Agents belonging to the generation.
    pub total_agents: usize,
    /// Agents with status `evaluated`.
    pub evaluated: usize,
    /// Agents with status `failed`.
    pub failed: usize,
    /// Agents still `pending` or `running`.
    pub in_flight: usize,
    /// Evaluated agents whose code compiled.
    pub compiled: usize,
    /// Mean accuracy of evaluated agents (0 when none).
    pub mean_fitness: f64,
    /// Best accuracy of evaluated agents.
    pub best_fitness: Option<f64>,
    /// Worst accuracy of evaluated agents.
    pub worst_fitness: Option<f64>,
}

impl GenerationStats {
    /// Summarise `agents` as generation `generation`.
    pub fn from_agents<'a>(generation: u32, agents: impl IntoIterator<Item = &'a Agent>) -> Self {
        let mut stats = Self {
            generation,
            ..Self::default()
        };
        let mut sum = 0.0;
        let mut scored = 0usize;
        for agent in agents {
            stats.total_agents += 1;
            match agent.status {
                AgentStatus::Evaluated => stats.evaluated += 1,
                AgentStatus::Failed => stats.failed += 1,
                AgentStatus::Pending | AgentStatus::Running => stats.in_flight += 1,
            }
            let Some(fitness) = agent.fitness.as_ref().filter(|_| agent.is_eligible_parent())
            else {
                continue;
            };
            if fitness.compilation_success {
                stats.compiled += 1;
            }
            let acc = fitness.accuracy;
            sum += acc;
            scored += 1;
            stats.best_fitness = Some(stats.best_fitness.map_or(acc, |b| b.max(acc)));
            stats.worst_fitness = Some(stats.worst_fitness.map_or(acc, |w| w.min(acc)));
        }
        if scored > 0 {
            stats.mean_fitness = sum / scored as f64;
        }
        stats
    }
}

/// Category of a detected population problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssueKind {
    /// Best accuracy has not improved for several generations.
    Stagnation,
    /// The eligible pool descends from too few lineages.
    LowDiversity,
    /// Too many agents in the current generation failed.
    HighFailureRate,
    /// Mean fitness is flat over the recent window.
    MinimalImprovement,
}

impl fmt::Display for HealthIssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stagnation => "stagnation",
            Self::LowDiversity => "low_diversity",
            Self::HighFailureRate => "high_failure_rate",
            Self::MinimalImprovement => "minimal_improvement",
        };
        f.write_str(s)
    }
}

/// One detected problem and what to do about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    /// Problem category.
    pub kind: HealthIssueKind,
    /// What was observed.
    pub description: String,
    /// Suggested remedy.
    pub recommendation: String,
}

/// Result of [`diagnose`] plus the signals it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationHealth {
    /// `true` when no issue was detected.
    pub healthy: bool,
    /// Detected problems.
    pub issues: Vec<HealthIssue>,
    /// Recommendations, one per issue, in the same order.
    pub recommendations: Vec<String>,
    /// Archive stagnation counter at diagnosis time.
    pub stagnation_count: u32,
    /// Archive diversity score at diagnosis time.
    pub diversity_score: f64,
    /// Statistics of the generation that was inspected.
    pub generation: GenerationStats,
}

/// Thresholds for [`diagnose`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HealthThresholds {
    /// Stagnation is flagged at or above this many generations.
    #[serde(default = "default_stagnation_generations")]
    pub stagnation_generations: u32,
    /// Diversity below this is flagged.
    #[serde(default = "default_min_diversity")]
    pub min_diversity: f64,
    /// Failure is flagged when `failed > evaluated * max_failure_ratio`.
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,
    /// Mean-fitness slope below this is flagged.
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,
    /// Number of generations the slope is measured over.
    #[serde(default = "default_improvement_window")]
    pub improvement_window: usize,
}

fn default_stagnation_generations() -> u32 {
    3
}
fn default_min_diversity() -> f64 {
    0.3
}
fn default_max_failure_ratio() -> f64 {
    0.5
}
fn default_min_improvement() -> f64 {
    0.01
}
fn default_improvement_window() -> usize {
    3
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stagnation_generations: default_stagnation_generations(),
            min_diversity: default_min_diversity(),
            max_failure_ratio: default_max_failure_ratio(),
            min_improvement: default_min_improvement(),
            improvement_window: default_improvement_window(),
        }
    }
}

/// Per-generation slope of the last `window` entries of `history`.
///
/// `None` until the history holds at least `window` (and at least two) values.
pub fn fitness_slope(history: &[f64], window: usize) -> Option<f64> {
    if window < 2 || history.len() < window {
        return None;
    }
    let recent = &history[history.len() - window..];
    let first = recent.first()?;
    let last = recent.last()?;
    Some((last - first) / (window - 1) as f64)
}

/// Run every health check.
///
/// `mean_history` is the mean fitness of each closed generation, oldest first.
pub fn diagnose(
    convergence: &ConvergenceMetrics,
    current: &GenerationStats,
    mean_history: &[f64],
    thresholds: &HealthThresholds,
) -> Vec<HealthIssue> {
    let mut issues = Vec::new();

    if convergence.stagnation_count >= thresholds.stagnation_generations {
        issues.push(HealthIssue {
            kind: HealthIssueKind::Stagnation,
            description: format!(
                "best accuracy unchanged for {} generations",
                convergence.stagnation_count
            ),
            recommendation: "switch selection to score_child_prop to explore under-used parents"
                .to_string(),
        });
    }

    if convergence.diversity_score < thresholds.min_diversity {
        issues.push(HealthIssue {
            kind: HealthIssueKind::LowDiversity,
            description: format!(
                "diversity score {:.2} below {:.2}",
                convergence.diversity_score, thresholds.min_diversity
            ),
            recommendation: "raise mutation strength or reseed with fresh lineages".to_string(),
        });
    }

    if current.failed as f64 > current.evaluated as f64 * thresholds.max_failure_ratio {
        issues.push(HealthIssue {
            kind: HealthIssueKind::HighFailureRate,
            description: format!(
                "generation {}: {} failed vs {} evaluated",
                current.generation, current.failed, current.evaluated
            ),
            recommendation: "review execution backend error logs before the next generation"
                .to_string(),
        });
    }

    if let Some(slope) = fitness_slope(mean_history, thresholds.improvement_window) {
        if slope < thresholds.min_improvement {
            issues.push(HealthIssue {
                kind: HealthIssueKind::MinimalImprovement,
                description: format!(
                    "mean fitness slope {slope:.4} over {} generations",
                    thresholds.improvement_window
                ),
                recommendation: "try tournament selection or a larger population".to_string(),
            });
        }
    }

    issues
}
