//! # Events — typed progress notifications
//!
//! ## Responsibility
//! Carry agent, generation and process lifecycle notifications to any number
//! of observers (progress views, loggers, tests) over a bounded
//! `tokio::sync::broadcast` channel.
//!
//! ## Guarantees
//! - Non-blocking: emitting never waits on slow subscribers
//! - Lossy under lag: a subscriber that falls behind by more than the channel
//!   capacity sees `RecvError::Lagged`, the engine is unaffected
//! - Zero subscribers is fine: events are dropped silently
//!
//! ## NOT Responsible For
//! - Persisting events
//! - Rendering progress

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::AgentStatus;
use crate::population::GenerationStats;
use crate::process::ProcessState;

/// Default broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvolutionEvent {
    /// A new pending agent was allocated.
    AgentCreated {
        /// New agent id.
        agent_id: String,
        /// Parent it was derived from.
        parent_id: String,
        /// Generation it belongs to.
        generation: u32,
    },
    /// An agent's status changed.
    AgentStatusChanged {
        /// Agent id.
        agent_id: String,
        /// New status.
        status: AgentStatus,
    },
    /// A batch of tasks was handed to the execution backend.
    TasksSubmitted {
        /// Generation number.
        generation: u32,
        /// Tasks accepted by the backend.
        accepted: usize,
        /// Tasks the backend refused.
        rejected: usize,
    },
    /// A generation closed.
    GenerationComplete {
        /// Closing statistics.
        stats: GenerationStats,
    },
    /// The next generation opened.
    GenerationStarted {
        /// Generation number now open for building.
        generation: u32,
    },
    /// An evolution process moved between states.
    StateChanged {
        /// Process id.
        process_id: String,
        /// Previous state.
        old_state: ProcessState,
        /// New state.
        new_state: ProcessState,
    },
}

/// Cloneable handle for publishing [`EvolutionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EvolutionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Bus holding up to `capacity` undelivered events per subscriber.
    ///
    /// # Panics
    /// Panics if `capacity` is zero (tokio channel requirement).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New receiver that sees every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EvolutionEvent> {
        self.tx.subscribe()
    }

    /// Publish `event`; returns the number of subscribers that received it.
    pub fn emit(&self, event: EvolutionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}
