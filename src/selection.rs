//! # Selection Engine — parent choice under uncertainty
//!
//! ## Responsibility
//! Choose `n` parents for the next generation from an eligible pool of
//! evaluated agents. Four strategies are provided:
//!
//! | Method             | Weight per candidate                    | Replacement |
//! |--------------------|-----------------------------------------|-------------|
//! | `score_prop`       | `accuracy`                              | with        |
//! | `score_child_prop` | `accuracy / (children_count + 1)`       | with        |
//! | `tournament`       | best of `k = min(3, pool size)` draws   | within a round |
//! | `random`           | uniform                                 | only if `n` exceeds the pool |
//!
//! ## Guarantees
//! - Pure: the pool is never mutated; `children_count` is read, not written
//! - Reproducible: every random draw goes through the injected generator, so a
//!   seeded [`StdRng`] yields identical selections across runs
//! - Total: the roulette walk falls back to the last candidate when cumulative
//!   rounding leaves a draw unresolved
//!
//! ## NOT Responsible For
//! - Deciding what improvement to attempt (see: `population::entry`)
//! - Bookkeeping of children counts (see: `population::manager`)

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, RngCore, SeedableRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{Agent, Fitness};

/// Default tournament size.
pub const DEFAULT_TOURNAMENT_SIZE: usize = 3;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced by parent selection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SelectionError {
    /// The pool contains no evaluated agent with a fitness record.
    #[error("no eligible parents in pool")]
    NoEligibleParents,

    /// The requested method tag is not one of the supported strategies.
    #[error("unknown selection method: {0}")]
    UnknownSelectionMethod(String),
}

// ─── Method ───────────────────────────────────────────────────────────────────

/// Parent selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Roulette wheel weighted by accuracy.
    ScoreProp,
    /// Roulette wheel weighted by accuracy discounted by children count.
    ScoreChildProp,
    /// Best-of-k tournament.
    Tournament,
    /// Uniform sampling.
    Random,
}

impl SelectionMethod {
    /// Wire tag for this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScoreProp => "score_prop",
            Self::ScoreChildProp => "score_child_prop",
            Self::Tournament => "tournament",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMethod {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "score_prop" => Ok(Self::ScoreProp),
            "score_child_prop" => Ok(Self::ScoreChildProp),
            "tournament" => Ok(Self::Tournament),
            "random" => Ok(Self::Random),
            other => Err(SelectionError::UnknownSelectionMethod(other.to_string())),
        }
    }
}

/// One parent chosen by a selection round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentSelectionResult {
    /// Id of the chosen parent.
    pub parent_id: String,
    /// Score the parent was selected on (accuracy, or discounted accuracy for
    /// `score_child_prop`).
    pub selection_score: f64,
    /// Strategy that produced this selection.
    pub method: SelectionMethod,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Parent selection with an injected random source.
///
/// # Example
///
/// ```rust
/// use tokio_evolution_orchestrator::agent::{Agent, Fitness};
/// use tokio_evolution_orchestrator::selection::{SelectionEngine, SelectionMethod};
///
/// let pool = vec![
///     Agent::seed("a").with_fitness(Fitness::with_accuracy(0.2)),
///     Agent::seed("b").with_fitness(Fitness::with_accuracy(0.8)),
/// ];
/// let engine = SelectionEngine::seeded(7);
/// let picks = engine.select_with(SelectionMethod::ScoreProp, &pool, 4).unwrap();
/// assert_eq!(picks.len(), 4);
/// ```
pub struct SelectionEngine {
    rng: Mutex<Box<dyn RngCore + Send>>,
    tournament_size: usize,
}

impl fmt::Debug for SelectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionEngine")
            .field("tournament_size", &self.tournament_size)
            .finish_non_exhaustive()
    }
}

impl SelectionEngine {
    /// Engine backed by any random source.
    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
            tournament_size: DEFAULT_TOURNAMENT_SIZE,
        }
    }

    /// Engine backed by a [`StdRng`] seeded with `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Engine seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Seeded when `seed` is given, entropy otherwise.
    pub fn from_seed_option(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self::seeded(s),
            None => Self::from_entropy(),
        }
    }

    /// Override the tournament size (minimum 1).
    pub fn with_tournament_size(mut self, k: usize) -> Self {
        self.tournament_size = k.max(1);
        self
    }

    /// Dispatch on a method tag.
    ///
    /// # Errors
    /// - [`SelectionError::UnknownSelectionMethod`] for an unsupported tag.
    /// - [`SelectionError::NoEligibleParents`] when the pool is empty.
    pub fn select(
        &self,
        method: &str,
        pool: &[Agent],
        n: usize,
    ) -> Result<Vec<ParentSelectionResult>, SelectionError> {
        let method = method.parse::<SelectionMethod>()?;
        self.select_with(method, pool, n)
    }

    /// Dispatch on a parsed [`SelectionMethod`].
    ///
    /// # Errors
    /// Returns [`SelectionError::NoEligibleParents`] when the pool is empty.
    pub fn select_with(
        &self,
        method: SelectionMethod,
        pool: &[Agent],
        n: usize,
    ) -> Result<Vec<ParentSelectionResult>, SelectionError> {
        let picks = match method {
            SelectionMethod::ScoreProp => self.select_score_proportional(pool, n),
            SelectionMethod::ScoreChildProp => self.select_score_child_proportional(pool, n),
            SelectionMethod::Tournament => self.select_tournament(pool, n),
            SelectionMethod::Random => self.select_random(pool, n),
        }?;
        crate::metrics::record_selection(method.as_str(), picks.len());
        Ok(picks)
    }

    /// Roulette-wheel selection weighted by accuracy, with replacement.
    ///
    /// # Errors
    /// Returns [`SelectionError::NoEligibleParents`] when the pool is empty.
    pub fn select_score_proportional(
        &self,
        pool: &[Agent],
        n: usize,
    ) -> Result<Vec<ParentSelectionResult>, SelectionError> {
        let eligible = eligible(pool)?;
        let scores: Vec<f64> = eligible.iter().map(|(_, f)| f.accuracy).collect();
        Ok(self.roulette_rounds(&eligible, &scores, n, SelectionMethod::ScoreProp))
    }

    /// Roulette-wheel selection weighted by `accuracy / (children_count + 1)`.
    ///
    /// Strong agents that have already produced many children are discounted,
    /// pushing selection toward under-explored branches of the archive.
    ///
    /// # Errors
    /// Returns [`SelectionError::NoEligibleParents`] when the pool is empty.
    pub fn select_score_child_proportional(
        &self,
        pool: &[Agent],
        n: usize,
    ) -> Result<Vec<ParentSelectionResult>, SelectionError> {
        let eligible = eligible(pool)?;
        let scores: Vec<f64> = eligible
            .iter()
            .map(|(a, f)| f.accuracy / f64::from(a.metadata.children_count.saturating_add(1)))
            .collect();
        Ok(self.roulette_rounds(&eligible, &scores, n, SelectionMethod::ScoreChildProp))
    }

    /// Best-of-k tournament; each round samples `k` distinct candidates.
    ///
    /// # Errors
    /// Returns [`SelectionError::NoEligibleParents`] when the pool is empty.
    pub fn select_tournament(
        &self,
        pool: &[Agent],
        n: usize,
    ) -> Result<Vec<ParentSelectionResult>, SelectionError> {
        let eligible = eligible(pool)?;
        let k = self.tournament_size.min(eligible.len());
        let mut rng = self.rng.lock();
        let mut picks = Vec::with_capacity(n);

        for _ in 0..n {
            let mut winner: Option<(usize, f64)> = None;
            for idx in index::sample(&mut *rng, eligible.len(), k).into_iter() {
                let acc = eligible[idx].1.accuracy;
                match winner {
                    Some((_, best)) if best >= acc => {}
                    _ => winner = Some((idx, acc)),
                }
            }
            if let Some((idx, acc)) = winner {
                picks.push(ParentSelectionResult {
                    parent_id: eligible[idx].0.id.clone(),
                    selection_score: acc,
                    method: SelectionMethod::Tournament,
                });
            }
        }
        Ok(picks)
    }

    /// Uniform selection; without replacement unless `n` exceeds the pool.
    ///
    /// # Errors
    /// Returns [`SelectionError::NoEligibleParents`] when the pool is empty.
    pub fn select_random(
        &self,
        pool: &[Agent],
        n: usize,
    ) -> Result<Vec<ParentSelectionResult>, SelectionError> {
        let eligible = eligible(pool)?;
        let mut rng = self.rng.lock();

        let indices: Vec<usize> = if n <= eligible.len() {
            index::sample(&mut *rng, eligible.len(), n).into_vec()
        } else {
            (0..n).map(|_| rng.gen_range(0..eligible.len())).collect()
        };

        Ok(indices
            .into_iter()
            .map(|idx| ParentSelectionResult {
                parent_id: eligible[idx].0.id.clone(),
                selection_score: eligible[idx].1.accuracy,
                method: SelectionMethod::Random,
            })
            .collect())
    }

    fn roulette_rounds(
        &self,
        eligible: &[(&Agent, &Fitness)],
        scores: &[f64],
        n: usize,
        method: SelectionMethod,
    ) -> Vec<ParentSelectionResult> {
        let probabilities = normalize(scores);
        let mut rng = self.rng.lock();
        (0..n)
            .map(|_| {
                let draw: f64 = rng.gen();
                let idx = roulette_index(&probabilities, draw);
                ParentSelectionResult {
                    parent_id: eligible[idx].0.id.clone(),
                    selection_score: scores[idx],
                    method,
                }
            })
            .collect()
    }
}

/// Filter the pool down to agents with a fitness record.
fn eligible(pool: &[Agent]) -> Result<Vec<(&Agent, &Fitness)>, SelectionError> {
    let eligible: Vec<_> = pool
        .iter()
        .filter(|a| a.is_eligible_parent())
        .filter_map(|a| a.fitness.as_ref().map(|f| (a, f)))
        .collect();
    if eligible.is_empty() {
        return Err(SelectionError::NoEligibleParents);
    }
    Ok(eligible)
}

/// Normalize non-negative scores into a probability vector.
///
/// When every score is zero (or the sum is not finite) the distribution is uniform.
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    let clean: Vec<f64> = scores
        .iter()
        .map(|s| if s.is_finite() && *s > 0.0 { *s } else { 0.0 })
        .collect();
    let total: f64 = clean.iter().sum();
    if total > 0.0 && total.is_finite() {
        clean.iter().map(|s| s / total).collect()
    } else if clean.is_empty() {
        Vec::new()
    } else {
        vec![1.0 / clean.len() as f64; clean.len()]
    }
}

/// Walk the cumulative distribution for a draw in `[0, 1)`.
///
/// Returns the last index if rounding leaves the draw past the final bucket.
pub fn roulette_index(probabilities: &[f64], draw: f64) -> usize {
    let mut cumulative = 0.0;
    for (i, p) in probabilities.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return i;
        }
    }
    probabilities.len().saturating_sub(1)
}
