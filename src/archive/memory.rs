//! # In-memory archive
//!
//! ## Responsibility
//! A complete [`ArchiveManager`] that keeps every agent in process memory,
//! tracks genealogy for diversity scoring, maintains convergence metrics at
//! each generation boundary, and optionally writes a JSON snapshot to disk.
//!
//! ## Guarantees
//! - Thread-safe: all state behind a single `parking_lot::RwLock`
//! - Atomic persistence: snapshots are written to a temp file and renamed
//! - Genealogy preserved: agents are never removed, only excluded from the
//!   eligible pool by [`ArchiveUpdateMethod::KeepBest`]
//!
//! ## NOT Responsible For
//! - Cross-process sharing (see: `store` for the resumability tier)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ArchiveError, ArchiveManager, ArchiveMetadata, ArchiveState, ConvergenceMetrics};
use crate::agent::Agent;

/// Improvement smaller than this does not reset the stagnation counter.
const IMPROVEMENT_EPSILON: f64 = 1e-9;

/// Which evaluated agents remain eligible as parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum ArchiveUpdateMethod {
    /// Every evaluated agent stays eligible.
    #[default]
    KeepAll,
    /// Only generation-0 seeds and the `size` highest-accuracy descendants stay eligible.
    KeepBest {
        /// Number of agents kept in the eligible pool.
        size: usize,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArchiveSnapshot {
    agents: Vec<Agent>,
    current_generation: u32,
    metrics: ConvergenceMetrics,
    best_seen: Option<f64>,
}

#[derive(Debug, Default)]
struct ArchiveInner {
    agents: HashMap<String, Agent>,
    order: Vec<String>,
    current_generation: u32,
    metrics: ConvergenceMetrics,
    best_seen: Option<f64>,
}

impl ArchiveInner {
    fn eligible(&self, method: ArchiveUpdateMethod) -> Vec<&Agent> {
        let mut eligible: Vec<&Agent> = self
            .order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .filter(|a| a.is_eligible_parent())
            .collect();
        let ArchiveUpdateMethod::KeepBest { size } = method else {
            return eligible;
        };
        let mut ranked: Vec<&Agent> = eligible
            .iter()
            .copied()
            .filter(|a| a.generation > 0)
            .collect();
        ranked.sort_by(|a, b| {
            b.accuracy()
                .unwrap_or(0.0)
                .total_cmp(&a.accuracy().unwrap_or(0.0))
        });
        let kept: HashSet<&str> = ranked.iter().take(size).map(|a| a.id.as_str()).collect();
        eligible.retain(|a| a.generation == 0 || kept.contains(a.id.as_str()));
        eligible
    }

    /// Walk parent links up to the root seed.
    fn lineage_root<'a>(&'a self, agent: &'a Agent) -> &'a str {
        let mut current = agent;
        for _ in 0..self.agents.len() {
            match current.parent_id.as_deref().and_then(|p| self.agents.get(p)) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current.id.as_str()
    }

    fn refresh_diversity(&mut self, method: ArchiveUpdateMethod) {
        let eligible = self.eligible(method);
        let score = if eligible.is_empty() {
            0.0
        } else {
            let roots: HashSet<&str> = eligible.iter().map(|a| self.lineage_root(a)).collect();
            roots.len() as f64 / eligible.len() as f64
        };
        self.metrics.diversity_score = score;
    }

    fn best_accuracy(&self, method: ArchiveUpdateMethod) -> Option<f64> {
        self.eligible(method)
            .iter()
            .filter_map(|a| a.accuracy())
            .max_by(|a, b| a.total_cmp(b))
    }
}

/// Process-local [`ArchiveManager`].
///
/// `current_generation` is the most recently completed generation: seeds
/// live in generation 0, and the children created while the counter reads
/// `g` belong to generation `g + 1`.
pub struct InMemoryArchive {
    inner: RwLock<ArchiveInner>,
    update_method: ArchiveUpdateMethod,
    persist_path: Option<PathBuf>,
}

impl Default for InMemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryArchive {
    /// Empty archive keeping every agent eligible, without persistence.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ArchiveInner::default()),
            update_method: ArchiveUpdateMethod::KeepAll,
            persist_path: None,
        }
    }

    /// Archive pre-populated with `seeds` (typically evaluated generation-0 agents).
    pub fn with_seeds(seeds: impl IntoIterator<Item = Agent>) -> Self {
        let archive = Self::new();
        {
            let mut inner = archive.inner.write();
            for seed in seeds {
                inner.order.push(seed.id.clone());
                inner.agents.insert(seed.id.clone(), seed);
            }
            inner.refresh_diversity(archive.update_method);
            inner.best_seen = inner.best_accuracy(archive.update_method);
        }
        archive
    }

    /// Set the eligibility policy.
    pub fn with_update_method(mut self, method: ArchiveUpdateMethod) -> Self {
        self.update_method = method;
        self.inner.write().refresh_diversity(method);
        self
    }

    /// Write snapshots to `path` on [`ArchiveManager::persist_to_disk`].
    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    /// Restore an archive from a snapshot written by `persist_to_disk`.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Io`] if the file cannot be read, or
    /// [`ArchiveError::Serialization`] if it is not a valid snapshot.
    pub async fn load_from_disk(path: &Path) -> Result<Self, ArchiveError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let snapshot: ArchiveSnapshot = serde_json::from_str(&raw)?;
        let mut inner = ArchiveInner {
            current_generation: snapshot.current_generation,
            metrics: snapshot.metrics,
            best_seen: snapshot.best_seen,
            ..ArchiveInner::default()
        };
        for agent in snapshot.agents {
            inner.order.push(agent.id.clone());
            inner.agents.insert(agent.id.clone(), agent);
        }
        info!(path = %path.display(), agents = inner.order.len(), "archive restored");
        Ok(Self {
            inner: RwLock::new(inner),
            update_method: ArchiveUpdateMethod::KeepAll,
            persist_path: Some(path.to_path_buf()),
        })
    }

    /// Number of stored agents.
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    /// `true` if no agent is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArchiveManager for InMemoryArchive {
    async fn get_agent(&self, id: &str) -> Option<Agent> {
        self.inner.read().agents.get(id).cloned()
    }

    async fn get_eligible_parents(&self) -> Vec<Agent> {
        self.inner
            .read()
            .eligible(self.update_method)
            .into_iter()
            .cloned()
            .collect()
    }

    async fn get_agents_by_generation(&self, generation: u32) -> Vec<Agent> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.agents.get(id))
            .filter(|a| a.generation == generation)
            .cloned()
            .collect()
    }

    async fn get_all_agents(&self) -> Vec<Agent> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.agents.get(id))
            .cloned()
            .collect()
    }

    async fn get_best_agent(&self) -> Option<Agent> {
        self.inner
            .read()
            .eligible(self.update_method)
            .into_iter()
            .max_by(|a, b| {
                a.accuracy()
                    .unwrap_or(0.0)
                    .total_cmp(&b.accuracy().unwrap_or(0.0))
            })
            .cloned()
    }

    async fn get_current_generation(&self) -> u32 {
        self.inner.read().current_generation
    }

    async fn increment_generation(&self) -> u32 {
        let mut inner = self.inner.write();
        let closing = inner.current_generation.saturating_add(1);

        let cohort: Vec<f64> = inner
            .agents
            .values()
            .filter(|a| a.generation == closing && a.is_eligible_parent())
            .filter_map(|a| a.accuracy())
            .collect();
        let mean = if cohort.is_empty() {
            inner.metrics.mean_fitness_history.last().copied().unwrap_or(0.0)
        } else {
            cohort.iter().sum::<f64>() / cohort.len() as f64
        };

        let best = inner.best_accuracy(self.update_method);
        match (best, inner.best_seen) {
            (Some(b), Some(prev)) if b > prev + IMPROVEMENT_EPSILON => {
                inner.best_seen = Some(b);
                inner.metrics.stagnation_count = 0;
            }
            (Some(b), None) => {
                inner.best_seen = Some(b);
                inner.metrics.stagnation_count = 0;
            }
            _ => inner.metrics.stagnation_count += 1,
        }

        let best_value = inner.best_seen.unwrap_or(0.0);
        inner.metrics.best_fitness_history.push(best_value);
        inner.metrics.mean_fitness_history.push(mean);
        inner.current_generation = closing;

        debug!(
            generation = closing,
            mean_fitness = mean,
            best_fitness = best_value,
            stagnation = inner.metrics.stagnation_count,
            "archive generation closed"
        );
        closing
    }

    async fn add_agent(&self, mut agent: Agent) -> Result<(), ArchiveError> {
        let mut inner = self.inner.write();
        match inner.agents.get(&agent.id) {
            Some(existing) => {
                agent.metadata.children_count = agent
                    .metadata
                    .children_count
                    .max(existing.metadata.children_count);
            }
            None => inner.order.push(agent.id.clone()),
        }
        inner.agents.insert(agent.id.clone(), agent);
        inner.refresh_diversity(self.update_method);
        Ok(())
    }

    async fn record_child(&self, parent_id: &str) -> Result<u32, ArchiveError> {
        let mut inner = self.inner.write();
        let parent = inner
            .agents
            .get_mut(parent_id)
            .ok_or_else(|| ArchiveError::AgentNotFound(parent_id.to_string()))?;
        parent.metadata.children_count = parent.metadata.children_count.saturating_add(1);
        Ok(parent.metadata.children_count)
    }

    async fn persist_to_disk(&self) -> Result<(), ArchiveError> {
        let Some(path) = self.persist_path.as_ref() else {
            return Ok(());
        };

        let body = {
            let inner = self.inner.read();
            let snapshot = ArchiveSnapshot {
                agents: inner
                    .order
                    .iter()
                    .filter_map(|id| inner.agents.get(id))
                    .cloned()
                    .collect(),
                current_generation: inner.current_generation,
                metrics: inner.metrics.clone(),
                best_seen: inner.best_seen,
            };
            serde_json::to_string_pretty(&snapshot)?
        };

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ArchiveError::Persistence(format!("rename {}: {e}", tmp.display())))?;
        debug!(path = %path.display(), "archive persisted");
        Ok(())
    }

    async fn get_archive_state(&self) -> ArchiveState {
        let inner = self.inner.read();
        ArchiveState {
            agent_ids: inner.order.clone(),
            metadata: ArchiveMetadata {
                current_generation: inner.current_generation,
                total_agents: inner.order.len(),
                best_accuracy: inner.best_accuracy(self.update_method),
                convergence_metrics: inner.metrics.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStatus, Fitness};

    fn evaluated(id: &str, parent: Option<&str>, generation: u32, accuracy: f64) -> Agent {
        let mut a = Agent::seed(id).with_fitness(Fitness::with_accuracy(accuracy));
        a.parent_id = parent.map(str::to_string);
        a.generation = generation;
        a
    }

    #[tokio::test]
    async fn test_eligible_parents_exclude_failed() {
        let archive = InMemoryArchive::with_seeds([evaluated("seed", None, 0, 0.4)]);
        let mut failed = Agent::seed("bad");
        failed.mark_failed("crash");
        archive.add_agent(failed).await.unwrap();

        let eligible = archive.get_eligible_parents().await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "seed");
        assert_eq!(archive.len(), 2);
    }

    #[tokio::test]
    async fn test_keep_best_limits_pool_but_keeps_records() {
        let archive = InMemoryArchive::with_seeds([evaluated("seed", None, 0, 0.05)])
            .with_update_method(ArchiveUpdateMethod::KeepBest { size: 2 });
        archive.add_agent(evaluated("a", Some("seed"), 1, 0.1)).await.unwrap();
        archive.add_agent(evaluated("b", Some("seed"), 1, 0.7)).await.unwrap();
        archive.add_agent(evaluated("c", Some("seed"), 1, 0.5)).await.unwrap();

        let ids: Vec<String> = archive
            .get_eligible_parents()
            .await
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["seed".to_string(), "b".to_string(), "c".to_string()]);
        assert!(archive.get_agent("a").await.is_some());
    }

    #[tokio::test]
    async fn test_record_child_increments_count() {
        let archive = InMemoryArchive::with_seeds([evaluated("p", None, 0, 0.5)]);
        assert_eq!(archive.record_child("p").await.unwrap(), 1);
        assert_eq!(archive.record_child("p").await.unwrap(), 2);
        assert!(matches!(
            archive.record_child("ghost").await,
            Err(ArchiveError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_best_agent_is_highest_accuracy() {
        let archive = InMemoryArchive::with_seeds([
            evaluated("a", None, 0, 0.3),
            evaluated("b", None, 0, 0.9),
        ]);
        assert_eq!(archive.get_best_agent().await.map(|a| a.id), Some("b".into()));
    }

    #[tokio::test]
    async fn test_stagnation_counts_generations_without_new_best() {
        let archive = InMemoryArchive::with_seeds([evaluated("seed", None, 0, 0.5)]);

        archive.add_agent(evaluated("g1", Some("seed"), 1, 0.4)).await.unwrap();
        assert_eq!(archive.increment_generation().await, 1);
        let m = archive.get_archive_state().await.metadata.convergence_metrics;
        assert_eq!(m.stagnation_count, 1);

        archive.add_agent(evaluated("g2", Some("g1"), 2, 0.8)).await.unwrap();
        archive.increment_generation().await;
        let m = archive.get_archive_state().await.metadata.convergence_metrics;
        assert_eq!(m.stagnation_count, 0);
        assert_eq!(m.best_fitness_history, vec![0.5, 0.8]);
        assert_eq!(m.mean_fitness_history, vec![0.4, 0.8]);
    }

    #[tokio::test]
    async fn test_diversity_counts_distinct_lineages() {
        let archive = InMemoryArchive::with_seeds([
            evaluated("root-a", None, 0, 0.5),
            evaluated("root-b", None, 0, 0.5),
        ]);
        archive.add_agent(evaluated("a1", Some("root-a"), 1, 0.6)).await.unwrap();
        archive.add_agent(evaluated("a2", Some("a1"), 2, 0.6)).await.unwrap();

        let m = archive.get_archive_state().await.metadata.convergence_metrics;
        assert!((m.diversity_score - 0.5).abs() < 1e-9, "{}", m.diversity_score);
    }

    #[tokio::test]
    async fn test_add_agent_preserves_children_count_on_replace() {
        let archive = InMemoryArchive::with_seeds([evaluated("p", None, 0, 0.5)]);
        archive.record_child("p").await.unwrap();
        archive.add_agent(evaluated("p", None, 0, 0.6)).await.unwrap();
        let p = archive.get_agent("p").await.unwrap();
        assert_eq!(p.metadata.children_count, 1);
        assert_eq!(archive.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_and_reload_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.json");
        let archive = InMemoryArchive::with_seeds([evaluated("seed", None, 0, 0.5)])
            .with_persist_path(&path);
        let mut pending = Agent::seed("child");
        pending.generation = 1;
        pending.mark_failed("forced");
        archive.add_agent(pending).await.unwrap();
        archive.increment_generation().await;
        archive.persist_to_disk().await.unwrap();

        let restored = InMemoryArchive::load_from_disk(&path).await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get_current_generation().await, 1);
        let child = restored.get_agent("child").await.unwrap();
        assert_eq!(child.status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn test_persist_without_path_is_noop() {
        let archive = InMemoryArchive::new();
        assert!(archive.persist_to_disk().await.is_ok());
    }
}
