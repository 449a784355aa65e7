//! # PopulationManager — generation scheduler
//!
//! ## Responsibility
//! Own the in-flight generation: select parents, build one child agent and
//! one task per selection, submit tasks to the execution backend, track
//! status reports, move evaluated agents into the archive, and close each
//! generation with statistics and health diagnostics.
//!
//! ## Guarantees
//! - Exclusive ownership: `active_agents` and generation task lists are only
//!   reachable through accessor methods
//! - No agent loss: every agent active before `transition_generation` is in
//!   the archive afterwards, force-failed if it never finished
//! - Non-fatal generation building: missing parents and submission failures
//!   are logged and skipped
//! - Lock discipline: the internal `parking_lot::Mutex` is never held across
//!   an `.await`
//!
//! ## NOT Responsible For
//! - Executing tasks or retrying them (see: `backend`)
//! - Durable storage of evaluated agents (see: `archive`)

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use super::entry::generate_self_improve_entry;
use super::health::{diagnose, GenerationStats, HealthThresholds, PopulationHealth};
use super::task::{task_priority, EvolutionTask, GenerationResult, SelectedEntry, TaskStatus};
use crate::agent::{Agent, AgentStatus, Fitness};
use crate::archive::{ArchiveError, ArchiveManager};
use crate::backend::{ExecutionBackend, SubmittedTask};
use crate::config::EngineConfig;
use crate::events::{EventBus, EvolutionEvent};
use crate::selection::{
    ParentSelectionResult, SelectionEngine, SelectionError, SelectionMethod,
    DEFAULT_TOURNAMENT_SIZE,
};
use crate::store::{
    generation_agents_key, generation_tasks_key, selection_key, NoopStore, Store, StoreEntry,
    StoreError, DEFAULT_TTL,
};

/// Task type tag sent to the execution backend.
pub const SELF_IMPROVE_TASK_TYPE: &str = "self_improve";

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Errors surfaced by [`PopulationManager`].
#[derive(Debug, Error)]
pub enum PopulationError {
    /// Parent selection failed.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// The resumability store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The archive rejected an operation.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The agent is not in the active set.
    #[error("agent not active: {0}")]
    AgentNotFound(String),
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Settings the manager needs from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct PopulationConfig {
    /// Children created per generation.
    pub population_size: usize,
    /// Parent selection strategy.
    pub selection_method: SelectionMethod,
    /// Candidates drawn per tournament.
    pub tournament_size: usize,
    /// Timeout handed to the execution backend with each task.
    pub task_timeout: Duration,
    /// Prefix for every store key.
    pub key_prefix: String,
    /// Expiry of persisted generation data.
    pub persistence_ttl: Duration,
    /// Health check thresholds.
    pub health: HealthThresholds,
    /// Seed for entry generation; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            population_size: 4,
            selection_method: SelectionMethod::ScoreChildProp,
            tournament_size: DEFAULT_TOURNAMENT_SIZE,
            task_timeout: Duration::from_secs(3600),
            key_prefix: "evolution".to_string(),
            persistence_ttl: DEFAULT_TTL,
            health: HealthThresholds::default(),
            seed: None,
        }
    }
}

impl From<&EngineConfig> for PopulationConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            population_size: config.evolution.population_size,
            selection_method: config.evolution.selection_method,
            tournament_size: config.evolution.tournament_size,
            task_timeout: Duration::from_secs(config.evolution.task_timeout_secs),
            key_prefix: config.persistence.key_prefix.clone(),
            persistence_ttl: Duration::from_secs(config.persistence.ttl_secs),
            health: config.health.clone(),
            seed: config.evolution.seed,
        }
    }
}

// ─── Public state types ───────────────────────────────────────────────────────

/// Lifecycle of one generation.
///
/// Phases only move forward; variants are declared in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    /// Agents and tasks are being allocated.
    Building,
    /// Tasks were handed to the execution backend.
    TasksSubmitted,
    /// At least one status report has arrived.
    AwaitingCompletion,
    /// The generation was transitioned.
    Complete,
    /// The generation's summary was produced and its bookkeeping dropped.
    Archived,
}

/// Fitness summary of one closed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationFitness {
    /// Generation number.
    pub generation: u32,
    /// Mean accuracy of evaluated agents.
    pub avg_fitness: f64,
    /// Best accuracy, 0 when nothing was evaluated.
    pub max_fitness: f64,
    /// Worst accuracy, 0 when nothing was evaluated.
    pub min_fitness: f64,
}

/// Run-level evolution summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionMetrics {
    /// One entry per closed generation, oldest first.
    pub fitness_history: Vec<GenerationFitness>,
    /// Number of closed generations.
    pub total_generations: usize,
    /// Children whose accuracy beat their parent's.
    pub total_improvements: u64,
    /// Best accuracy in the archive.
    pub best_fitness: Option<f64>,
}

// ─── Internal state ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GenerationBook {
    tasks: Vec<EvolutionTask>,
    entries: Vec<SelectedEntry>,
    children: Vec<String>,
    compiled: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    active_agents: HashMap<String, Agent>,
    active_order: Vec<String>,
    books: BTreeMap<u32, GenerationBook>,
    phases: BTreeMap<u32, GenerationPhase>,
    selection_history: BTreeMap<u32, Vec<ParentSelectionResult>>,
    fitness_history: Vec<GenerationFitness>,
    total_improvements: u64,
    latest_generation: Option<u32>,
}

impl Inner {
    fn insert_active(&mut self, agent: Agent) {
        if !self.active_agents.contains_key(&agent.id) {
            self.active_order.push(agent.id.clone());
        }
        self.active_agents.insert(agent.id.clone(), agent);
    }

    fn take_active(&mut self, id: &str) -> Option<Agent> {
        let agent = self.active_agents.remove(id)?;
        self.active_order.retain(|a| a != id);
        Some(agent)
    }

    fn set_task_status(&mut self, generation: u32, agent_id: &str, status: TaskStatus) {
        if let Some(task) = self
            .books
            .get_mut(&generation)
            .and_then(|b| b.tasks.iter_mut().find(|t| t.assigned_to == agent_id))
        {
            task.status = status;
        }
    }

    fn is_closed(&self, generation: u32) -> bool {
        matches!(
            self.phases.get(&generation),
            Some(GenerationPhase::Complete | GenerationPhase::Archived)
        )
    }

    /// Closed, or every one of at least one task is terminal. A sealed
    /// generation accepts no new agents.
    fn is_sealed(&self, generation: u32) -> bool {
        self.is_closed(generation)
            || self.books.get(&generation).is_some_and(|b| {
                !b.tasks.is_empty() && b.tasks.iter().all(|t| t.status.is_terminal())
            })
    }

    fn advance_phase(&mut self, generation: u32, phase: GenerationPhase) {
        let current = self.phases.get(&generation).copied();
        if current.map_or(true, |c| c < phase) {
            self.phases.insert(generation, phase);
        }
    }

    fn note_generation(&mut self, generation: u32) {
        let latest = self.latest_generation.map_or(generation, |g| g.max(generation));
        self.latest_generation = Some(latest);
    }
}

fn task_status_for(status: AgentStatus) -> TaskStatus {
    match status {
        AgentStatus::Pending => TaskStatus::Pending,
        AgentStatus::Running => TaskStatus::Running,
        AgentStatus::Evaluated => TaskStatus::Completed,
        AgentStatus::Failed => TaskStatus::Failed,
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

/// Generation scheduler over an archive, an execution backend and an optional store.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tokio_evolution_orchestrator::agent::{Agent, Fitness};
/// use tokio_evolution_orchestrator::archive::InMemoryArchive;
/// use tokio_evolution_orchestrator::backend::ChannelBackend;
/// use tokio_evolution_orchestrator::population::{PopulationConfig, PopulationManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let seed = Agent::seed("initial").with_fitness(Fitness::from_counts(13, 7));
/// let archive = Arc::new(InMemoryArchive::with_seeds([seed]));
/// let (backend, mut tasks) = ChannelBackend::new(64);
/// let manager = PopulationManager::new(archive, Arc::new(backend), PopulationConfig::default());
///
/// let children = manager.create_next_generation().await?;
/// while let Some(task) = tasks.recv().await {
///     // hand `task` to a worker, then report back via `update_agent_status`
/// #   let _ = task; break;
/// }
/// # let _ = children;
/// # Ok(())
/// # }
/// ```
pub struct PopulationManager {
    archive: Arc<dyn ArchiveManager>,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn Store>,
    selection: SelectionEngine,
    events: EventBus,
    config: PopulationConfig,
    inner: Mutex<Inner>,
    rng: Mutex<StdRng>,
    status_changed: Notify,
}

impl std::fmt::Debug for PopulationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopulationManager")
            .field("config", &self.config)
            .field("active_agents", &self.inner.lock().active_agents.len())
            .finish()
    }
}

impl PopulationManager {
    /// Manager with a [`NoopStore`], a fresh [`EventBus`] and a selection
    /// engine seeded from `config.seed`.
    pub fn new(
        archive: Arc<dyn ArchiveManager>,
        backend: Arc<dyn ExecutionBackend>,
        config: PopulationConfig,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self {
            archive,
            backend,
            store: Arc::new(NoopStore),
            selection: SelectionEngine::from_seed_option(config.seed)
                .with_tournament_size(config.tournament_size),
            events: EventBus::default(),
            config,
            inner: Mutex::new(Inner::default()),
            rng: Mutex::new(rng),
            status_changed: Notify::new(),
        }
    }

    /// Persist generation state to `store`.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    /// Publish events on `events` instead of a private bus.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Replace the selection engine (e.g. a seeded one in tests).
    pub fn with_selection_engine(mut self, selection: SelectionEngine) -> Self {
        self.selection = selection;
        self
    }

    // ── Generation building ─────────────────────────────────────────────────

    /// Allocate one pending child and one task per entry, then submit the tasks.
    ///
    /// Entries whose parent is not in the archive are skipped with a warning,
    /// so the returned list may be shorter than `entries` (or empty). Each
    /// created child increments its parent's `children_count`. A generation
    /// that is closed, or whose tasks have all finished, is sealed: the call
    /// logs a warning and creates nothing. Submission
    /// failures are logged; the affected agents stay pending until a status
    /// report or the generation transition resolves them.
    ///
    /// # Errors
    /// This function currently always returns `Ok`; the `Result` leaves room
    /// for archive implementations whose lookups fail hard.
    pub async fn create_new_generation(
        &self,
        entries: &[SelectedEntry],
        generation: u32,
    ) -> Result<Vec<String>, PopulationError> {
        if self.inner.lock().is_sealed(generation) {
            warn!(generation, "generation sealed; no agents created");
            return Ok(Vec::new());
        }

        let mut created = Vec::with_capacity(entries.len());
        for selected in entries {
            let Some(parent) = self.archive.get_agent(&selected.parent_id).await else {
                warn!(
                    parent_id = %selected.parent_id,
                    generation,
                    "parent not in archive; skipping entry"
                );
                continue;
            };
            let child = Agent::child_of(&parent, generation);
            let priority = task_priority(parent.accuracy().unwrap_or(0.0));
            let task = EvolutionTask::new(
                parent.id.clone(),
                selected.entry.clone(),
                priority,
                generation,
                child.id.clone(),
            );
            created.push((child, task, selected.clone()));
        }

        let tasks: Vec<EvolutionTask> = created.iter().map(|(_, t, _)| t.clone()).collect();
        let ids: Vec<String> = created.iter().map(|(a, _, _)| a.id.clone()).collect();
        {
            let mut inner = self.inner.lock();
            // Tasks may have finished while parents were looked up.
            if inner.is_sealed(generation) {
                warn!(generation, "generation sealed; no agents created");
                return Ok(Vec::new());
            }
            inner.note_generation(generation);
            inner.advance_phase(generation, GenerationPhase::Building);
            for (agent, task, selected) in created {
                let book = inner.books.entry(generation).or_default();
                book.tasks.push(task);
                book.entries.push(selected);
                book.children.push(agent.id.clone());
                inner.insert_active(agent);
            }
        }

        for task in &tasks {
            if let Err(e) = self.archive.record_child(&task.parent_commit_id).await {
                warn!(parent_id = %task.parent_commit_id, error = %e, "failed to record child on parent");
            }
        }

        for (id, task) in ids.iter().zip(&tasks) {
            self.events.emit(EvolutionEvent::AgentCreated {
                agent_id: id.clone(),
                parent_id: task.parent_commit_id.clone(),
                generation,
            });
        }

        self.persist_generation(generation).await;

        let mut rejected = 0usize;
        for task in &tasks {
            if let Err(e) = self.backend.enqueue_task(self.submission(task)).await {
                rejected += 1;
                warn!(
                    task_id = %task.id,
                    agent_id = %task.assigned_to,
                    error = %e,
                    "task submission failed"
                );
            }
        }
        self.inner
            .lock()
            .advance_phase(generation, GenerationPhase::TasksSubmitted);
        self.events.emit(EvolutionEvent::TasksSubmitted {
            generation,
            accepted: tasks.len() - rejected,
            rejected,
        });

        info!(
            generation,
            requested = entries.len(),
            created = ids.len(),
            rejected,
            "generation built"
        );
        Ok(ids)
    }

    /// Select parents with the configured method and build the next generation.
    ///
    /// The new generation number is the archive's current generation plus one.
    ///
    /// # Errors
    /// Returns [`PopulationError::Selection`] when the archive has no eligible parents.
    pub async fn create_next_generation(&self) -> Result<Vec<String>, PopulationError> {
        let pool = self.archive.get_eligible_parents().await;
        let generation = self.next_generation_number().await;
        let picks = self.selection.select_with(
            self.config.selection_method,
            &pool,
            self.config.population_size,
        )?;

        let entries: Vec<SelectedEntry> = {
            let mut rng = self.rng.lock();
            picks
                .iter()
                .filter_map(|pick| pool.iter().find(|a| a.id == pick.parent_id))
                .map(|parent| {
                    let entry = generate_self_improve_entry(parent, &mut *rng);
                    SelectedEntry::new(parent.id.clone(), entry)
                })
                .collect()
        };
        debug!(
            generation,
            selected = picks.len(),
            method = %self.config.selection_method,
            "parents selected"
        );
        self.inner.lock().selection_history.insert(generation, picks);

        self.create_new_generation(&entries, generation).await
    }

    /// Generation number the next `create_next_generation` call will build.
    pub async fn next_generation_number(&self) -> u32 {
        self.archive.get_current_generation().await.saturating_add(1)
    }

    // ── Status tracking ─────────────────────────────────────────────────────

    /// Apply a status report from the execution backend.
    ///
    /// `Evaluated` moves the agent (with `fitness`) into the archive and out of
    /// the active set. Any other status mutates the active record in place.
    ///
    /// # Errors
    /// - [`PopulationError::AgentNotFound`] if the agent is not active.
    /// - [`PopulationError::Archive`] if archiving fails; the agent stays active
    ///   with its previous status and its task is left unfinished.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        fitness: Option<Fitness>,
    ) -> Result<(), PopulationError> {
        let (archived, generation, parent_id) = {
            let mut inner = self.inner.lock();
            let agent = inner
                .active_agents
                .get_mut(agent_id)
                .ok_or_else(|| PopulationError::AgentNotFound(agent_id.to_string()))?;
            let generation = agent.generation;
            let parent_id = agent.parent_id.clone();

            let archived = if status == AgentStatus::Evaluated {
                inner.take_active(agent_id).map(|original| {
                    let mut evaluated = original.clone();
                    if fitness.is_some() {
                        evaluated.fitness = fitness.clone();
                    }
                    evaluated.status = status;
                    evaluated.metadata.finished_at = Some(Utc::now());
                    (original, evaluated)
                })
            } else {
                if fitness.is_some() {
                    agent.fitness = fitness;
                }
                match status {
                    AgentStatus::Failed => agent.mark_failed("reported failed by execution backend"),
                    _ => agent.status = status,
                }
                inner.set_task_status(generation, agent_id, task_status_for(status));
                None
            };
            if inner.phases.get(&generation) == Some(&GenerationPhase::TasksSubmitted) {
                inner.advance_phase(generation, GenerationPhase::AwaitingCompletion);
            }
            (archived, generation, parent_id)
        };

        if let Some((original, agent)) = archived {
            if agent.fitness.is_none() {
                warn!(agent_id, "agent evaluated without a fitness record");
            }
            let child_accuracy = agent.accuracy();
            let compiled = agent.fitness.as_ref().is_some_and(|f| f.compilation_success);
            // The task completes only once the archive holds the agent.
            if let Err(e) = self.archive.add_agent(agent).await {
                self.inner.lock().insert_active(original);
                return Err(e.into());
            }
            {
                let mut inner = self.inner.lock();
                inner.set_task_status(generation, agent_id, TaskStatus::Completed);
                if compiled {
                    if let Some(book) = inner.books.get_mut(&generation) {
                        book.compiled.push(agent_id.to_string());
                    }
                }
            }
            if let (Some(acc), Some(pid)) = (child_accuracy, parent_id) {
                let parent_acc = self.archive.get_agent(&pid).await.and_then(|p| p.accuracy());
                if parent_acc.is_some_and(|p| acc > p) {
                    self.inner.lock().total_improvements += 1;
                }
            }
        }

        debug!(agent_id, %status, "agent status updated");
        self.events.emit(EvolutionEvent::AgentStatusChanged {
            agent_id: agent_id.to_string(),
            status,
        });
        self.status_changed.notify_waiters();
        Ok(())
    }

    /// `true` when every task of `generation` is `completed` or `failed`.
    ///
    /// Vacuously `true` for a generation with no tasks, and stays `true` once
    /// the generation has been transitioned.
    pub fn is_generation_complete(&self, generation: u32) -> bool {
        let inner = self.inner.lock();
        if inner.is_closed(generation) {
            return true;
        }
        inner
            .books
            .get(&generation)
            .map_or(true, |b| b.tasks.iter().all(|t| t.status.is_terminal()))
    }

    /// Wait until `generation` is complete or `timeout` elapses.
    ///
    /// Wakes on every status report and re-checks every `poll_interval`.
    /// Returns `true` if the generation completed in time.
    pub async fn wait_for_generation(
        &self,
        generation: u32,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.status_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_generation_complete(generation) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll_interval.min(remaining)) => {}
            }
        }
    }

    // ── Generation boundary ─────────────────────────────────────────────────

    /// Close the current generation.
    ///
    /// Every active agent that is not evaluated is marked `failed`, all are
    /// moved into the archive, the archive's generation counter is incremented
    /// and the archive persisted (failures logged). Emits `GenerationComplete` and
    /// `GenerationStarted` and returns the closed generation's statistics.
    ///
    /// # Errors
    /// Returns [`PopulationError::Archive`] if an agent cannot be archived;
    /// the agents not yet archived are returned to the active set.
    pub async fn transition_generation(&self) -> Result<GenerationStats, PopulationError> {
        let leftovers: Vec<Agent> = {
            let mut inner = self.inner.lock();
            let order = std::mem::take(&mut inner.active_order);
            let mut out = Vec::with_capacity(order.len());
            for id in order {
                let Some(mut agent) = inner.active_agents.remove(&id) else {
                    continue;
                };
                if agent.status != AgentStatus::Evaluated && agent.status != AgentStatus::Failed {
                    agent.mark_failed("generation closed before evaluation");
                }
                out.push(agent);
            }
            out
        };

        let forced = leftovers
            .iter()
            .filter(|a| a.status == AgentStatus::Failed)
            .count();
        let mut remaining = leftovers.into_iter();
        while let Some(agent) = remaining.next() {
            if let Err(e) = self.archive.add_agent(agent.clone()).await {
                let mut inner = self.inner.lock();
                inner.insert_active(agent);
                for rest in remaining {
                    inner.insert_active(rest);
                }
                return Err(e.into());
            }
            if agent.status == AgentStatus::Failed {
                self.inner
                    .lock()
                    .set_task_status(agent.generation, &agent.id, TaskStatus::Failed);
            }
        }

        let closed = self.archive.increment_generation().await;
        if let Err(e) = self.archive.persist_to_disk().await {
            warn!(error = %e, "archive persistence failed; continuing");
        }
        let agents = self.archive.get_agents_by_generation(closed).await;
        let stats = GenerationStats::from_agents(closed, &agents);

        {
            let mut inner = self.inner.lock();
            inner.note_generation(closed);
            inner.advance_phase(closed, GenerationPhase::Complete);
            inner.fitness_history.push(GenerationFitness {
                generation: closed,
                avg_fitness: stats.mean_fitness,
                max_fitness: stats.best_fitness.unwrap_or(0.0),
                min_fitness: stats.worst_fitness.unwrap_or(0.0),
            });
        }

        crate::metrics::record_generation_complete(
            closed,
            stats.evaluated,
            stats.failed,
            stats.mean_fitness,
        );
        info!(
            generation = closed,
            evaluated = stats.evaluated,
            failed = stats.failed,
            forced_failures = forced,
            mean_fitness = stats.mean_fitness,
            "generation transitioned"
        );
        self.events.emit(EvolutionEvent::GenerationComplete {
            stats: stats.clone(),
        });
        self.events.emit(EvolutionEvent::GenerationStarted {
            generation: closed.saturating_add(1),
        });
        self.status_changed.notify_waiters();
        Ok(stats)
    }

    /// Build the immutable summary of `generation` and drop its bookkeeping.
    ///
    /// The generation's selection history is written to the store with the
    /// configured TTL before it is dropped; store failures are logged.
    pub async fn process_generation_results(&self, generation: u32) -> GenerationResult {
        let (book, picks) = {
            let mut inner = self.inner.lock();
            (
                inner.books.remove(&generation).unwrap_or_default(),
                inner.selection_history.remove(&generation),
            )
        };

        if let Some(picks) = picks {
            let key = selection_key(&self.config.key_prefix, generation);
            let written = match serde_json::to_string(&picks) {
                Ok(body) => self
                    .store
                    .set(&key, &body, Some(self.config.persistence_ttl))
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = written {
                warn!(generation, error = %e, "failed to persist selection history");
            }
        }

        let archive = self.archive.get_archive_state().await.agent_ids;
        self.inner
            .lock()
            .advance_phase(generation, GenerationPhase::Archived);

        GenerationResult {
            generation,
            self_improve_entries: book.entries,
            children: book.children,
            children_compiled: book.compiled,
            archive,
            timestamp: Utc::now(),
        }
    }

    // ── Diagnostics ─────────────────────────────────────────────────────────

    /// Advisory health report for the most recent generation.
    pub async fn get_population_health(&self) -> PopulationHealth {
        let state = self.archive.get_archive_state().await;
        let (generation, mut agents) = {
            let inner = self.inner.lock();
            let generation = inner
                .latest_generation
                .unwrap_or(state.metadata.current_generation);
            let active: Vec<Agent> = inner
                .active_order
                .iter()
                .filter_map(|id| inner.active_agents.get(id))
                .filter(|a| a.generation == generation)
                .cloned()
                .collect();
            (generation, active)
        };
        for archived in self.archive.get_agents_by_generation(generation).await {
            if !agents.iter().any(|a| a.id == archived.id) {
                agents.push(archived);
            }
        }

        let stats = GenerationStats::from_agents(generation, &agents);
        let convergence = state.metadata.convergence_metrics;
        let issues = diagnose(
            &convergence,
            &stats,
            &convergence.mean_fitness_history,
            &self.config.health,
        );
        if !issues.is_empty() {
            debug!(generation, issues = issues.len(), "population health issues detected");
        }
        PopulationHealth {
            healthy: issues.is_empty(),
            recommendations: issues.iter().map(|i| i.recommendation.clone()).collect(),
            issues,
            stagnation_count: convergence.stagnation_count,
            diversity_score: convergence.diversity_score,
            generation: stats,
        }
    }

    /// Per-generation fitness history and run totals.
    pub async fn evolution_metrics(&self) -> EvolutionMetrics {
        let best_fitness = self.archive.get_best_agent().await.and_then(|a| a.accuracy());
        let inner = self.inner.lock();
        EvolutionMetrics {
            fitness_history: inner.fitness_history.clone(),
            total_generations: inner.fitness_history.len(),
            total_improvements: inner.total_improvements,
            best_fitness,
        }
    }

    // ── Checkpoint / resume ─────────────────────────────────────────────────

    /// Write the latest generation's tasks, active agents and selection
    /// history to the store in one atomic batch.
    ///
    /// # Errors
    /// Returns [`PopulationError::Store`] if encoding or the batch write fails.
    pub async fn save_checkpoint(&self) -> Result<(), PopulationError> {
        let Some(generation) = self.inner.lock().latest_generation else {
            return Ok(());
        };
        let entries = self.checkpoint_entries(generation)?;
        self.store.pipeline_write(entries).await?;
        debug!(generation, "checkpoint saved");
        Ok(())
    }

    /// Reload `generation`'s tasks and in-flight agents from the store.
    ///
    /// Agents already present in the archive are not reactivated; their
    /// tasks take the archived agent's terminal status. Returns the number
    /// of agents put back into the active set. A closed generation is left
    /// untouched and restores nothing.
    ///
    /// # Errors
    /// Returns [`PopulationError::Store`] on read or decode failure.
    pub async fn restore_generation(&self, generation: u32) -> Result<usize, PopulationError> {
        if self.inner.lock().is_closed(generation) {
            warn!(generation, "generation already closed; nothing restored");
            return Ok(0);
        }
        let prefix = &self.config.key_prefix;
        let mut tasks: Vec<EvolutionTask> =
            match self.store.get(&generation_tasks_key(prefix, generation)).await? {
                Some(raw) => serde_json::from_str(&raw).map_err(StoreError::from)?,
                None => Vec::new(),
            };
        let agents: Vec<Agent> =
            match self.store.get(&generation_agents_key(prefix, generation)).await? {
                Some(raw) => serde_json::from_str(&raw).map_err(StoreError::from)?,
                None => Vec::new(),
            };
        let picks: Option<Vec<ParentSelectionResult>> =
            match self.store.get(&selection_key(prefix, generation)).await? {
                Some(raw) => Some(serde_json::from_str(&raw).map_err(StoreError::from)?),
                None => None,
            };

        let mut revived = Vec::with_capacity(agents.len());
        for agent in agents {
            match self.archive.get_agent(&agent.id).await {
                Some(archived) => {
                    if let Some(task) = tasks.iter_mut().find(|t| t.assigned_to == archived.id) {
                        task.status = task_status_for(archived.status);
                    }
                }
                None => revived.push(agent),
            }
        }

        let count = revived.len();
        {
            let mut inner = self.inner.lock();
            inner.note_generation(generation);
            let book = inner.books.entry(generation).or_default();
            book.entries = tasks
                .iter()
                .map(|t| SelectedEntry::new(t.parent_commit_id.clone(), t.entry.clone()))
                .collect();
            book.children = tasks.iter().map(|t| t.assigned_to.clone()).collect();
            book.tasks = tasks;
            for agent in revived {
                inner.insert_active(agent);
            }
            if let Some(picks) = picks {
                inner.selection_history.insert(generation, picks);
            }
            inner.advance_phase(generation, GenerationPhase::AwaitingCompletion);
        }
        info!(generation, restored = count, "generation restored from store");
        Ok(count)
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    /// Copies of the in-flight agents, in creation order.
    pub fn active_agents(&self) -> Vec<Agent> {
        let inner = self.inner.lock();
        inner
            .active_order
            .iter()
            .filter_map(|id| inner.active_agents.get(id))
            .cloned()
            .collect()
    }

    /// Copy of one in-flight agent.
    pub fn active_agent(&self, id: &str) -> Option<Agent> {
        self.inner.lock().active_agents.get(id).cloned()
    }

    /// Number of in-flight agents.
    pub fn active_count(&self) -> usize {
        self.inner.lock().active_agents.len()
    }

    /// Copies of `generation`'s tasks (empty once its results were processed).
    pub fn generation_tasks(&self, generation: u32) -> Vec<EvolutionTask> {
        self.inner
            .lock()
            .books
            .get(&generation)
            .map(|b| b.tasks.clone())
            .unwrap_or_default()
    }

    /// Parents selected for `generation`, until its results are processed.
    pub fn selection_history(&self, generation: u32) -> Option<Vec<ParentSelectionResult>> {
        self.inner.lock().selection_history.get(&generation).cloned()
    }

    /// Current phase of `generation`.
    pub fn generation_phase(&self, generation: u32) -> Option<GenerationPhase> {
        self.inner.lock().phases.get(&generation).copied()
    }

    /// The archive this manager feeds.
    pub fn archive(&self) -> Arc<dyn ArchiveManager> {
        Arc::clone(&self.archive)
    }

    /// Subscribe to agent and generation events.
    pub fn subscribe(&self) -> broadcast::Receiver<EvolutionEvent> {
        self.events.subscribe()
    }

    /// Active configuration.
    pub fn config(&self) -> &PopulationConfig {
        &self.config
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn submission(&self, task: &EvolutionTask) -> SubmittedTask {
        SubmittedTask {
            id: task.id.clone(),
            task_type: SELF_IMPROVE_TASK_TYPE.to_string(),
            priority: task.priority,
            prompt: task.entry.instruction(),
            context: serde_json::json!({
                "agent_id": task.assigned_to,
                "parent_id": task.parent_commit_id,
                "generation": task.generation,
                "entry": task.entry,
            }),
            timeout_secs: self.config.task_timeout.as_secs(),
            created_at: task.created_at,
            status: task.status,
        }
    }

    fn checkpoint_entries(&self, generation: u32) -> Result<Vec<StoreEntry>, StoreError> {
        let (tasks, agents, picks) = {
            let inner = self.inner.lock();
            let tasks = inner
                .books
                .get(&generation)
                .map(|b| b.tasks.clone())
                .unwrap_or_default();
            let agents: Vec<Agent> = inner
                .active_order
                .iter()
                .filter_map(|id| inner.active_agents.get(id))
                .filter(|a| a.generation == generation)
                .cloned()
                .collect();
            (tasks, agents, inner.selection_history.get(&generation).cloned())
        };

        let prefix = &self.config.key_prefix;
        let ttl = Some(self.config.persistence_ttl);
        let mut entries = vec![
            StoreEntry::new(
                generation_tasks_key(prefix, generation),
                serde_json::to_string(&tasks)?,
                ttl,
            ),
            StoreEntry::new(
                generation_agents_key(prefix, generation),
                serde_json::to_string(&agents)?,
                ttl,
            ),
        ];
        if let Some(picks) = picks {
            entries.push(StoreEntry::new(
                selection_key(prefix, generation),
                serde_json::to_string(&picks)?,
                ttl,
            ));
        }
        Ok(entries)
    }

    async fn persist_generation(&self, generation: u32) {
        let result = match self.checkpoint_entries(generation) {
            Ok(entries) => self.store.pipeline_write(entries).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(generation, error = %e, "failed to persist generation state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::InMemoryArchive;
    use crate::backend::ChannelBackend;
    use crate::population::task::SelfImproveEntry;
    use crate::store::MemoryStore;

    fn seeded_archive() -> Arc<InMemoryArchive> {
        let seed = Agent::seed("initial").with_fitness(Fitness::from_counts(13, 7));
        Arc::new(InMemoryArchive::with_seeds([seed]))
    }

    fn config(n: usize) -> PopulationConfig {
        PopulationConfig {
            population_size: n,
            seed: Some(7),
            ..PopulationConfig::default()
        }
    }

    fn manager(n: usize) -> (PopulationManager, tokio::sync::mpsc::Receiver<SubmittedTask>) {
        let (backend, rx) = ChannelBackend::new(64);
        let m = PopulationManager::new(seeded_archive(), Arc::new(backend), config(n));
        (m, rx)
    }

    #[tokio::test]
    async fn test_missing_parent_yields_partial_generation() {
        let (m, _rx) = manager(1);
        let ids = m
            .create_new_generation(
                &[SelectedEntry::new("missing-parent", SelfImproveEntry::GeneralImprovement)],
                1,
            )
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert!(m.is_generation_complete(1));
    }

    #[tokio::test]
    async fn test_one_task_per_created_agent() {
        let (m, mut rx) = manager(3);
        let ids = m.create_next_generation().await.unwrap();
        assert_eq!(ids.len(), 3);

        let tasks = m.generation_tasks(1);
        assert_eq!(tasks.len(), 3);
        for id in &ids {
            assert_eq!(tasks.iter().filter(|t| &t.assigned_to == id).count(), 1);
        }
        for _ in 0..3 {
            let submitted = rx.recv().await.unwrap();
            assert_eq!(submitted.task_type, SELF_IMPROVE_TASK_TYPE);
            assert!((submitted.priority - 8.25).abs() < 1e-9);
        }
        assert_eq!(m.generation_phase(1), Some(GenerationPhase::TasksSubmitted));
    }

    #[tokio::test]
    async fn test_children_count_incremented_per_created_child() {
        let (m, _rx) = manager(2);
        m.create_next_generation().await.unwrap();
        let seed = m.archive().get_agent("initial").await.unwrap();
        assert_eq!(seed.metadata.children_count, 2);
    }

    #[tokio::test]
    async fn test_evaluated_agent_moves_to_archive() {
        let (m, _rx) = manager(1);
        let ids = m.create_next_generation().await.unwrap();
        let id = &ids[0];

        m.update_agent_status(id, AgentStatus::Running, None).await.unwrap();
        assert_eq!(m.active_agent(id).unwrap().status, AgentStatus::Running);
        assert!(!m.is_generation_complete(1));

        m.update_agent_status(id, AgentStatus::Evaluated, Some(Fitness::with_accuracy(0.9)))
            .await
            .unwrap();
        assert!(m.active_agent(id).is_none());
        assert!(m.archive().get_agent(id).await.is_some());
        assert!(m.is_generation_complete(1));
        assert_eq!(m.evolution_metrics().await.total_improvements, 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_status_update_errors() {
        let (m, _rx) = manager(1);
        let err = m
            .update_agent_status("nobody", AgentStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PopulationError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_transition_archives_every_active_agent() {
        let (m, _rx) = manager(3);
        let ids = m.create_next_generation().await.unwrap();
        m.update_agent_status(&ids[0], AgentStatus::Evaluated, Some(Fitness::with_accuracy(0.5)))
            .await
            .unwrap();
        m.update_agent_status(&ids[1], AgentStatus::Running, None)
            .await
            .unwrap();

        let stats = m.transition_generation().await.unwrap();
        assert_eq!(m.active_count(), 0);
        for id in &ids {
            assert!(m.archive().get_agent(id).await.is_some(), "{id} lost");
        }
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.evaluated, 1);
        assert_eq!(stats.failed, 2);
        assert!(m.is_generation_complete(1));
        assert_eq!(m.archive().get_current_generation().await, 1);
    }

    #[tokio::test]
    async fn test_process_results_clears_bookkeeping() {
        let store = Arc::new(MemoryStore::new());
        let (backend, _rx) = ChannelBackend::new(16);
        let m = PopulationManager::new(seeded_archive(), Arc::new(backend), config(2))
            .with_store(store.clone());
        let ids = m.create_next_generation().await.unwrap();
        for id in &ids {
            m.update_agent_status(id, AgentStatus::Evaluated, Some(Fitness::from_counts(3, 1)))
                .await
                .unwrap();
        }
        m.transition_generation().await.unwrap();
        let result = m.process_generation_results(1).await;

        assert_eq!(result.children, ids);
        assert_eq!(result.children_compiled.len(), 2);
        assert_eq!(result.self_improve_entries.len(), 2);
        assert_eq!(result.archive.len(), 3);
        assert!(m.generation_tasks(1).is_empty());
        assert!(m.selection_history(1).is_none());
        assert!(m.is_generation_complete(1));
        assert_eq!(m.generation_phase(1), Some(GenerationPhase::Archived));
        assert!(store.get("evolution:selection:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let store = Arc::new(MemoryStore::new());
        let archive = seeded_archive();
        let (backend, _rx) = ChannelBackend::new(16);
        let m = PopulationManager::new(archive.clone(), Arc::new(backend), config(2))
            .with_store(store.clone());
        let ids = m.create_next_generation().await.unwrap();
        m.save_checkpoint().await.unwrap();

        let (backend, _rx2) = ChannelBackend::new(16);
        let resumed = PopulationManager::new(archive, Arc::new(backend), config(2))
            .with_store(store);
        let restored = resumed.restore_generation(1).await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(resumed.generation_tasks(1).len(), 2);
        for id in &ids {
            assert!(resumed.active_agent(id).is_some());
        }
        assert!(resumed.selection_history(1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_generation_times_out() {
        let (m, _rx) = manager(1);
        m.create_next_generation().await.unwrap();
        let done = m
            .wait_for_generation(1, Duration::from_secs(5), Duration::from_secs(1))
            .await;
        assert!(!done);
    }

    #[tokio::test]
    async fn test_health_flags_high_failure_rate() {
        let (m, _rx) = manager(2);
        let ids = m.create_next_generation().await.unwrap();
        for id in &ids {
            m.update_agent_status(id, AgentStatus::Failed, None).await.unwrap();
        }
        let health = m.get_population_health().await;
        assert!(!health.healthy);
        assert!(health
            .issues
            .iter()
            .any(|i| i.kind == crate::population::HealthIssueKind::HighFailureRate));
        assert_eq!(health.issues.len(), health.recommendations.len());
    }

    /// Delegates to an [`InMemoryArchive`] but refuses every `add_agent`.
    struct RejectingArchive(InMemoryArchive);

    #[async_trait::async_trait]
    impl ArchiveManager for RejectingArchive {
        async fn get_agent(&self, id: &str) -> Option<Agent> {
            self.0.get_agent(id).await
        }
        async fn get_eligible_parents(&self) -> Vec<Agent> {
            self.0.get_eligible_parents().await
        }
        async fn get_agents_by_generation(&self, generation: u32) -> Vec<Agent> {
            self.0.get_agents_by_generation(generation).await
        }
        async fn get_all_agents(&self) -> Vec<Agent> {
            self.0.get_all_agents().await
        }
        async fn get_best_agent(&self) -> Option<Agent> {
            self.0.get_best_agent().await
        }
        async fn get_current_generation(&self) -> u32 {
            self.0.get_current_generation().await
        }
        async fn increment_generation(&self) -> u32 {
            self.0.increment_generation().await
        }
        async fn add_agent(&self, _agent: Agent) -> Result<(), ArchiveError> {
            Err(ArchiveError::Persistence("archive offline".to_string()))
        }
        async fn record_child(&self, parent_id: &str) -> Result<u32, ArchiveError> {
            self.0.record_child(parent_id).await
        }
        async fn persist_to_disk(&self) -> Result<(), ArchiveError> {
            self.0.persist_to_disk().await
        }
        async fn get_archive_state(&self) -> crate::archive::ArchiveState {
            self.0.get_archive_state().await
        }
    }

    #[tokio::test]
    async fn test_completed_generation_rejects_new_agents() {
        let (m, _rx) = manager(1);
        let ids = m.create_next_generation().await.unwrap();
        m.update_agent_status(&ids[0], AgentStatus::Evaluated, Some(Fitness::with_accuracy(0.7)))
            .await
            .unwrap();
        assert!(m.is_generation_complete(1));
        let phase = m.generation_phase(1);

        let late = m
            .create_new_generation(
                &[SelectedEntry::new("initial", SelfImproveEntry::GeneralImprovement)],
                1,
            )
            .await
            .unwrap();
        assert!(late.is_empty());
        assert!(m.is_generation_complete(1));
        assert_eq!(m.generation_tasks(1).len(), 1);
        assert_eq!(m.generation_phase(1), phase);
        let seed = m.archive().get_agent("initial").await.unwrap();
        assert_eq!(seed.metadata.children_count, 1);
    }

    #[tokio::test]
    async fn test_closed_generation_phase_never_regresses() {
        let (m, _rx) = manager(1);
        let ids = m.create_next_generation().await.unwrap();
        m.update_agent_status(&ids[0], AgentStatus::Evaluated, Some(Fitness::with_accuracy(0.7)))
            .await
            .unwrap();
        m.transition_generation().await.unwrap();
        assert_eq!(m.generation_phase(1), Some(GenerationPhase::Complete));

        let late = m
            .create_new_generation(
                &[SelectedEntry::new("initial", SelfImproveEntry::GeneralImprovement)],
                1,
            )
            .await
            .unwrap();
        assert!(late.is_empty());
        assert_eq!(m.restore_generation(1).await.unwrap(), 0);
        assert_eq!(m.generation_phase(1), Some(GenerationPhase::Complete));
        assert!(m.is_generation_complete(1));
        assert_eq!(m.active_count(), 0);
    }

    #[test]
    fn test_generation_phases_are_ordered() {
        assert!(GenerationPhase::Building < GenerationPhase::TasksSubmitted);
        assert!(GenerationPhase::TasksSubmitted < GenerationPhase::AwaitingCompletion);
        assert!(GenerationPhase::AwaitingCompletion < GenerationPhase::Complete);
        assert!(GenerationPhase::Complete < GenerationPhase::Archived);
    }

    #[tokio::test]
    async fn test_failed_archive_write_leaves_task_unfinished() {
        let seed = Agent::seed("initial").with_fitness(Fitness::from_counts(13, 7));
        let archive = Arc::new(RejectingArchive(InMemoryArchive::with_seeds([seed])));
        let (backend, _rx) = ChannelBackend::new(16);
        let m = PopulationManager::new(archive, Arc::new(backend), config(1));
        let ids = m.create_next_generation().await.unwrap();
        let id = &ids[0];

        let err = m
            .update_agent_status(id, AgentStatus::Evaluated, Some(Fitness::from_counts(3, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, PopulationError::Archive(_)));

        let agent = m.active_agent(id).unwrap();
        assert_eq!(agent.status, AgentStatus::Pending);
        assert!(agent.fitness.is_none());
        let tasks = m.generation_tasks(1);
        assert_eq!(tasks.len(), 1);
        assert_ne!(tasks[0].status, TaskStatus::Completed);
        assert!(!m.is_generation_complete(1));

        let result = m.process_generation_results(1).await;
        assert_eq!(result.children, ids);
        assert!(result.children_compiled.is_empty());
    }

    #[tokio::test]
    async fn test_health_reads_archive_fitness_history() {
        let archive = seeded_archive();
        for _ in 0..3 {
            archive.increment_generation().await;
        }
        let flat = archive.get_archive_state().await;
        assert_eq!(flat.metadata.convergence_metrics.mean_fitness_history.len(), 3);

        let (backend, _rx) = ChannelBackend::new(16);
        let fresh = PopulationManager::new(archive, Arc::new(backend), config(1));
        assert!(fresh.evolution_metrics().await.fitness_history.is_empty());
        let health = fresh.get_population_health().await;
        assert!(health
            .issues
            .iter()
            .any(|i| i.kind == crate::population::HealthIssueKind::MinimalImprovement));
    }
}
