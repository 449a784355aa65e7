//! # Execution backend — task submission boundary
//!
//! ## Responsibility
//! Define the [`ExecutionBackend`] contract through which the population
//! manager hands self-improvement work to whatever actually generates and
//! evaluates code, plus [`ChannelBackend`], an mpsc-based implementation for
//! in-process workers.
//!
//! ## Guarantees
//! - Fire-and-forget: `enqueue_task` returns once the task is accepted;
//!   results come back through `PopulationManager::update_agent_status`
//! - Bounded: [`ChannelBackend`] applies backpressure via its channel capacity
//!
//! ## NOT Responsible For
//! - Retry policy (belongs to the concrete backend)
//! - Reporting agent status back (see: `population`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::population::TaskStatus;

/// Errors returned by an [`ExecutionBackend`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    /// The receiving side has shut down.
    #[error("execution backend is closed")]
    Closed,

    /// The backend refused the task.
    #[error("task rejected: {0}")]
    Rejected(String),
}

/// A unit of work as handed to the execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedTask {
    /// Task id (same as the `EvolutionTask` id).
    pub id: String,
    /// Task kind, e.g. `"self_improve"`.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Scheduling priority in `[0, 10]`.
    pub priority: f64,
    /// Human-readable instruction for the code generator.
    pub prompt: String,
    /// Structured context: agent id, parent id, entry, generation.
    pub context: serde_json::Value,
    /// Upper bound on execution time in seconds.
    pub timeout_secs: u64,
    /// When the task was built.
    pub created_at: DateTime<Utc>,
    /// Status at submission time.
    pub status: TaskStatus,
}

/// Something that accepts self-improvement tasks for execution.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Queue `task` for execution.
    ///
    /// # Errors
    /// Returns [`BackendError`] if the task could not be accepted.
    async fn enqueue_task(&self, task: SubmittedTask) -> Result<(), BackendError>;
}

/// [`ExecutionBackend`] that forwards tasks into a bounded mpsc channel.
///
/// # Example
///
/// ```rust
/// use tokio_evolution_orchestrator::backend::ChannelBackend;
///
/// let (backend, mut rx) = ChannelBackend::new(64);
/// # drop(backend);
/// # let _ = rx.try_recv();
/// ```
#[derive(Debug, Clone)]
pub struct ChannelBackend {
    tx: mpsc::Sender<SubmittedTask>,
}

impl ChannelBackend {
    /// Create a backend and the receiver workers should drain.
    ///
    /// # Panics
    /// Panics if `capacity` is zero (tokio channel requirement).
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SubmittedTask>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ExecutionBackend for ChannelBackend {
    async fn enqueue_task(&self, task: SubmittedTask) -> Result<(), BackendError> {
        self.tx.send(task).await.map_err(|_| BackendError::Closed)
    }
}
