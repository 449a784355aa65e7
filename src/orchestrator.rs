//! # EvolutionOrchestrator — bounded process supervisor
//!
//! ## Responsibility
//! Accept hypotheses, run one [`EvolutionProcess`] per hypothesis on its own
//! tokio task, and cap how many run at once.
//!
//! ## Guarantees
//! - Bounded: at most `max_concurrent` processes execute; later submissions
//!   queue on a `tokio::sync::Semaphore` instead of spawning unbounded work
//! - Cancellable: queued and running processes can be cancelled by id
//! - Observable: [`EvolutionOrchestrator::status`] counts processes per state
//!
//! ## NOT Responsible For
//! - Phase logic (see: `process`)
//! - Generation scheduling (see: `population`)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::events::{EventBus, EvolutionEvent};
use crate::OrchestratorError;
use crate::process::{
    Collaborators, EvolutionProcess, ImprovementHypothesis, ProcessError, ProcessOutcome,
    ProcessSettings, ProcessState,
};

/// Snapshot of the orchestrator's workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Processes holding a permit.
    pub running: usize,
    /// Processes waiting for a permit.
    pub queued: usize,
    /// Processes that applied their change.
    pub completed: usize,
    /// Processes that failed.
    pub failed: usize,
    /// Processes whose approval was declined.
    pub rejected: usize,
    /// Processes cancelled before finishing.
    pub cancelled: usize,
    /// Permit count.
    pub max_concurrent: usize,
}

#[derive(Debug, Default)]
struct Counters {
    running: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    rejected: AtomicUsize,
    cancelled: AtomicUsize,
}

impl Counters {
    fn finish(&self, state: ProcessState) {
        let counter = match state {
            ProcessState::Completed => &self.completed,
            ProcessState::Rejected => &self.rejected,
            ProcessState::Cancelled => &self.cancelled,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs evolution processes with a concurrency ceiling.
///
/// # Example
///
/// ```rust,no_run
/// use tokio_evolution_orchestrator::orchestrator::EvolutionOrchestrator;
/// use tokio_evolution_orchestrator::process::{Collaborators, ImprovementHypothesis, ProcessSettings};
///
/// # async fn example(collaborators: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = EvolutionOrchestrator::new(collaborators, ProcessSettings::default(), 4);
/// let (id, handle) = orchestrator.submit(ImprovementHypothesis::new("h-1", "performance", "d"));
/// let outcome = handle.await??;
/// assert_eq!(outcome.process_id, id);
/// # Ok(())
/// # }
/// ```
pub struct EvolutionOrchestrator {
    collaborators: Collaborators,
    settings: ProcessSettings,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    processes: Arc<DashMap<String, Arc<EvolutionProcess>>>,
    counters: Arc<Counters>,
    events: EventBus,
}

impl std::fmt::Debug for EvolutionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionOrchestrator")
            .field("max_concurrent", &self.max_concurrent)
            .field("live", &self.processes.len())
            .finish()
    }
}

impl EvolutionOrchestrator {
    /// Orchestrator allowing `max_concurrent` processes at once (minimum 1).
    pub fn new(collaborators: Collaborators, settings: ProcessSettings, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            collaborators,
            settings,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            processes: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            events: EventBus::default(),
        }
    }

    /// Orchestrator sized and tuned from `config`.
    pub fn from_config(collaborators: Collaborators, config: &EngineConfig) -> Self {
        Self::new(
            collaborators,
            ProcessSettings::from(config),
            config.evolution.max_concurrent_evolutions,
        )
    }

    /// Publish process events on `events`.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Subscribe to `StateChanged` events of every process.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EvolutionEvent> {
        self.events.subscribe()
    }

    /// Queue `hypothesis` for execution.
    ///
    /// Returns the process id and a handle resolving to the process result.
    /// The process waits for a permit before its first phase; a process
    /// cancelled while queued stops waiting and resolves to its `Cancelled`
    /// outcome at once, without running or taking a permit.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        hypothesis: ImprovementHypothesis,
    ) -> (String, JoinHandle<Result<ProcessOutcome, ProcessError>>) {
        let process = Arc::new(
            EvolutionProcess::new(hypothesis, self.collaborators.clone(), self.settings.clone())
                .with_event_bus(self.events.clone()),
        );
        let id = process.id().to_string();
        self.processes.insert(id.clone(), Arc::clone(&process));
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        debug!(process_id = %id, "evolution queued");

        let permits = Arc::clone(&self.permits);
        let processes = Arc::clone(&self.processes);
        let counters = Arc::clone(&self.counters);
        let handle = tokio::spawn(async move {
            let mut halted = process.halted();
            let permit = tokio::select! {
                biased;
                Ok(_) = halted.wait_for(|h| *h) => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            counters.queued.fetch_sub(1, Ordering::SeqCst);

            let result = match permit {
                Some(_permit) if !process.state().is_terminal() => {
                    counters.running.fetch_add(1, Ordering::SeqCst);
                    let result = process.execute().await;
                    counters.running.fetch_sub(1, Ordering::SeqCst);
                    result
                }
                // Cancelled while queued, or the semaphore closed.
                _ => {
                    process.cancel().await;
                    Ok(process.outcome())
                }
            };

            counters.finish(process.state());
            processes.remove(process.id());
            info!(process_id = %process.id(), state = %process.state(), "evolution finished");
            result
        });
        (id, handle)
    }

    /// Submit every hypothesis and wait for all of them.
    ///
    /// Results come back in submission order. A process task that panicked
    /// surfaces as [`OrchestratorError::Join`].
    pub async fn run_batch(
        &self,
        hypotheses: impl IntoIterator<Item = ImprovementHypothesis>,
    ) -> Vec<Result<ProcessOutcome, OrchestratorError>> {
        let handles: Vec<_> = hypotheses
            .into_iter()
            .map(|h| self.submit(h).1)
            .collect();
        info!(count = handles.len(), "evolution batch submitted");
        join_all(handles)
            .await
            .into_iter()
            .map(|joined| -> Result<ProcessOutcome, OrchestratorError> { Ok(joined??) })
            .collect()
    }

    /// Cancel a queued or running process.
    ///
    /// Returns `false` if the id is unknown or already finished.
    pub async fn cancel(&self, process_id: &str) -> bool {
        let process = match self.processes.get(process_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return false,
        };
        process.cancel().await
    }

    /// State of a live process; `None` once it has finished.
    pub fn process_state(&self, process_id: &str) -> Option<ProcessState> {
        self.processes.get(process_id).map(|p| p.state())
    }

    /// Current workload counters.
    pub fn status(&self) -> OrchestratorStatus {
        let c = &self.counters;
        OrchestratorStatus {
            running: c.running.load(Ordering::SeqCst),
            queued: c.queued.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            rejected: c.rejected.load(Ordering::SeqCst),
            cancelled: c.cancelled.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent,
        }
    }
}
