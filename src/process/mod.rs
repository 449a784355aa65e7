//! # EvolutionProcess — per-hypothesis state machine
//!
//! ## Responsibility
//! Drive exactly one [`ImprovementHypothesis`] through
//! `generating → testing → validating → awaiting_approval → applying`,
//! calling out to the [`Collaborators`] at each phase, and report a terminal
//! [`ProcessOutcome`].
//!
//! ## Guarantees
//! - Fixed order: phases never overlap, skip or repeat; a terminal state is
//!   never left
//! - Snapshot first: the rollback snapshot is taken before any code is
//!   requested, so every later phase can be undone
//! - Compensated apply: a failed apply always attempts rollback exactly once
//!   before `APPLICATION_FAILED` is returned
//! - Bounded sandbox: execution runs under `tokio::time::timeout`; expiry is
//!   a failed test run, not an error
//! - Safe cancellation: [`EvolutionProcess::cancel`] works from any state and
//!   releases an existing snapshot with a best-effort rollback
//!
//! ## NOT Responsible For
//! - Generating, sandboxing or applying code (see: `collaborators`)
//! - Limiting how many processes run at once (see: `orchestrator`)

pub mod collaborators;
pub mod error;
pub mod hypothesis;
pub mod state;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use collaborators::{
    ApprovalRequest, ApprovalUi, AutoApprovePolicy, Bridge, CheckOutcome, CollaboratorError,
    Collaborators, ConfigManager, EvolutionConstraints, EvolutionRequest, EvolutionResult,
    EvolutionStatus, FileChange, ProcessPolicy, RollbackManager, SandboxLimits, SandboxManager,
    SandboxOutcome, SandboxSpec, ValidationRecord,
};
pub use error::{ErrorCode, ProcessError};
pub use hypothesis::{ExpectedImpact, ImprovementHypothesis};
pub use state::{PhaseRecord, PhaseStatus, ProcessState};

use crate::config::EngineConfig;
use crate::events::{EventBus, EvolutionEvent};
use crate::metrics;

// ─── Scoring ──────────────────────────────────────────────────────────────────

/// Score deducted when sandbox tests fail.
pub const FAILED_TESTS_PENALTY: f64 = 30.0;
/// Score deducted per listed risk.
pub const RISK_PENALTY: f64 = 10.0;
/// Confidence below which the low-confidence penalty applies.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.7;
/// Multiplier of `(1 - confidence)` for low-confidence hypotheses.
pub const LOW_CONFIDENCE_WEIGHT: f64 = 20.0;

/// Safety score in `[0, 100]` for `hypothesis` given the sandbox verdict.
///
/// Starts at 100 and deducts [`FAILED_TESTS_PENALTY`] if tests failed,
/// [`RISK_PENALTY`] per risk and `(1 - confidence) * 20` when confidence is
/// below [`LOW_CONFIDENCE_THRESHOLD`].
pub fn safety_score(hypothesis: &ImprovementHypothesis, tests_passed: bool) -> f64 {
    let mut score = 100.0;
    if !tests_passed {
        score -= FAILED_TESTS_PENALTY;
    }
    score -= RISK_PENALTY * hypothesis.risks.len() as f64;
    if hypothesis.confidence < LOW_CONFIDENCE_THRESHOLD {
        score -= (1.0 - hypothesis.confidence) * LOW_CONFIDENCE_WEIGHT;
    }
    score.clamp(0.0, 100.0)
}

/// `true` if `policy` grants approval without asking the UI.
///
/// The threshold is inclusive: a score of exactly
/// `100 - max_risk_level * 100` is approved.
pub fn auto_approves(policy: &AutoApprovePolicy, score: f64, hypothesis_type: &str) -> bool {
    policy.enabled
        && score >= 100.0 - policy.max_risk_level * 100.0
        && policy.types.iter().any(|t| t == hypothesis_type)
}

// ─── Settings ─────────────────────────────────────────────────────────────────

/// Per-process limits and timings.
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    /// Sandbox resource ceiling.
    pub sandbox: SandboxLimits,
    /// Constraints attached to every evolution request.
    pub constraints: EvolutionConstraints,
    /// Delay between bridge status polls.
    pub status_poll_interval: Duration,
    /// Upper bound on waiting for the bridge to finish generating.
    pub evolution_timeout: Duration,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            sandbox: SandboxLimits::default(),
            constraints: EvolutionConstraints::default(),
            status_poll_interval: Duration::from_millis(500),
            evolution_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&EngineConfig> for ProcessSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            sandbox: config.process.sandbox.clone(),
            constraints: config.process.constraints.clone(),
            status_poll_interval: Duration::from_millis(config.process.status_poll_interval_ms),
            evolution_timeout: Duration::from_secs(config.process.evolution_timeout_secs),
        }
    }
}

// ─── Outcome ──────────────────────────────────────────────────────────────────

/// Who approved the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSource {
    /// The auto-approve policy matched.
    Automatic,
    /// The approval UI said yes.
    Manual,
}

/// Everything known about a process, terminal or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// Process id.
    pub process_id: String,
    /// Hypothesis driven by the process.
    pub hypothesis_id: String,
    /// Current state.
    pub state: ProcessState,
    /// Evolution id allocated in the generating phase.
    pub evolution_id: Option<String>,
    /// Rollback snapshot taken in the testing phase.
    pub snapshot_id: Option<String>,
    /// Bridge result.
    pub evolution_result: Option<EvolutionResult>,
    /// Sandbox verdict.
    pub sandbox: Option<SandboxOutcome>,
    /// Validation record.
    pub validation: Option<ValidationRecord>,
    /// Safety score.
    pub safety_score: Option<f64>,
    /// How approval was granted.
    pub approval: Option<ApprovalSource>,
    /// Per-phase timing, in execution order.
    pub phases: Vec<PhaseRecord>,
    /// Failure, if the process failed.
    pub error: Option<ProcessError>,
    /// Wall time from `execute` to the terminal state (or now).
    pub duration_ms: u64,
}

// ─── Internal state ───────────────────────────────────────────────────────────

/// Why the phase chain stopped early.
enum Halt {
    /// Cancelled or rejected from outside; the state is already terminal.
    Interrupted,
    /// A phase raised an error.
    Failed(ProcessError),
}

#[derive(Debug)]
struct Inner {
    state: ProcessState,
    phases: Vec<PhaseRecord>,
    evolution_id: Option<String>,
    snapshot_id: Option<String>,
    evolution_result: Option<EvolutionResult>,
    sandbox: Option<SandboxOutcome>,
    validation: Option<ValidationRecord>,
    safety_score: Option<f64>,
    approval: Option<ApprovalSource>,
    error: Option<ProcessError>,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ProcessState::Pending,
            phases: Vec::new(),
            evolution_id: None,
            snapshot_id: None,
            evolution_result: None,
            sandbox: None,
            validation: None,
            safety_score: None,
            approval: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    fn close_open_phase(&mut self, status: PhaseStatus) {
        if let Some(record) = self
            .phases
            .iter_mut()
            .rev()
            .find(|r| r.status == PhaseStatus::Running)
        {
            record.finish(status);
        }
    }
}

// ─── Process ──────────────────────────────────────────────────────────────────

/// State machine for one hypothesis.
///
/// # Example
///
/// ```rust,no_run
/// use tokio_evolution_orchestrator::process::{
///     Collaborators, EvolutionProcess, ImprovementHypothesis, ProcessSettings,
/// };
///
/// # async fn example(collaborators: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
/// let hypothesis = ImprovementHypothesis::new("h-1", "performance", "cache lookups")
///     .with_confidence(0.9);
/// let process = EvolutionProcess::new(hypothesis, collaborators, ProcessSettings::default());
/// let outcome = process.execute().await?;
/// println!("{} finished as {}", outcome.process_id, outcome.state);
/// # Ok(())
/// # }
/// ```
pub struct EvolutionProcess {
    id: String,
    hypothesis: ImprovementHypothesis,
    collaborators: Collaborators,
    settings: ProcessSettings,
    events: EventBus,
    inner: Mutex<Inner>,
    halt_tx: watch::Sender<bool>,
    rollback_claimed: AtomicBool,
}

impl std::fmt::Debug for EvolutionProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionProcess")
            .field("id", &self.id)
            .field("hypothesis", &self.hypothesis.id)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl EvolutionProcess {
    /// Pending process with a fresh id and a private event bus.
    pub fn new(
        hypothesis: ImprovementHypothesis,
        collaborators: Collaborators,
        settings: ProcessSettings,
    ) -> Self {
        let (halt_tx, _) = watch::channel(false);
        Self {
            id: format!("proc-{}", uuid::Uuid::new_v4()),
            hypothesis,
            collaborators,
            settings,
            events: EventBus::default(),
            inner: Mutex::new(Inner::new()),
            halt_tx,
            rollback_claimed: AtomicBool::new(false),
        }
    }

    /// Use `id` instead of a generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Publish `StateChanged` events on `events`.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Process id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The hypothesis being driven.
    pub fn hypothesis(&self) -> &ImprovementHypothesis {
        &self.hypothesis
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    /// Watch that flips to `true` once the process is cancelled or rejected.
    pub fn halted(&self) -> watch::Receiver<bool> {
        self.halt_tx.subscribe()
    }

    /// Phase records so far.
    pub fn phases(&self) -> Vec<PhaseRecord> {
        self.inner.lock().phases.clone()
    }

    /// Snapshot of everything known about the process.
    pub fn outcome(&self) -> ProcessOutcome {
        let inner = self.inner.lock();
        let duration = match (inner.started_at, inner.ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        ProcessOutcome {
            process_id: self.id.clone(),
            hypothesis_id: self.hypothesis.id.clone(),
            state: inner.state,
            evolution_id: inner.evolution_id.clone(),
            snapshot_id: inner.snapshot_id.clone(),
            evolution_result: inner.evolution_result.clone(),
            sandbox: inner.sandbox.clone(),
            validation: inner.validation.clone(),
            safety_score: inner.safety_score,
            approval: inner.approval,
            phases: inner.phases.clone(),
            error: inner.error.clone(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Run every phase to a terminal state.
    ///
    /// Returns the outcome for `Completed`, `Rejected` and `Cancelled`.
    ///
    /// # Errors
    /// - [`ErrorCode::InvalidState`] if the process is not `Pending`
    /// - the failing phase's [`ProcessError`] after moving to `Failed`;
    ///   an apply failure carries the rollback result in `details`
    pub async fn execute(&self) -> Result<ProcessOutcome, ProcessError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ProcessState::Pending {
                return Err(ProcessError::new(
                    ErrorCode::InvalidState,
                    format!("process {} already {}", self.id, inner.state),
                    inner.state,
                ));
            }
            inner.started_at = Some(Instant::now());
        }
        info!(process_id = %self.id, hypothesis_id = %self.hypothesis.id, "evolution process started");

        match self.run_phases().await {
            Ok(()) => {
                self.transition(ProcessState::Completed);
                Ok(self.outcome())
            }
            Err(Halt::Interrupted) => Ok(self.outcome()),
            Err(Halt::Failed(err)) => {
                warn!(
                    process_id = %self.id,
                    code = %err.code,
                    phase = %err.phase,
                    error = %err.message,
                    "evolution process failed"
                );
                self.inner.lock().error = Some(err.clone());
                if self.transition(ProcessState::Failed) {
                    Err(err)
                } else {
                    Ok(self.outcome())
                }
            }
        }
    }

    /// Cancel from any state.
    ///
    /// Stops the running phase, moves to `Cancelled` and, if a snapshot was
    /// taken, attempts a rollback whose failure is only logged. Returns
    /// `false` if the process was already terminal.
    pub async fn cancel(&self) -> bool {
        self.halt_tx.send_replace(true);
        if !self.transition(ProcessState::Cancelled) {
            return false;
        }
        let target = {
            let inner = self.inner.lock();
            inner.snapshot_id.as_ref().and(inner.evolution_id.clone())
        };
        if let Some(evolution_id) = target {
            if self.claim_rollback() {
                match self.collaborators.rollback.rollback(&evolution_id).await {
                    Ok(()) => metrics::record_rollback(&evolution_id, true),
                    Err(e) => {
                        metrics::record_rollback(&evolution_id, false);
                        warn!(process_id = %self.id, evolution_id = %evolution_id, error = %e, "rollback after cancel failed");
                    }
                }
            }
        }
        true
    }

    /// Move straight to `Rejected` without touching any snapshot.
    ///
    /// Returns `false` if the process was already terminal.
    pub fn reject(&self) -> bool {
        self.halt_tx.send_replace(true);
        self.transition(ProcessState::Rejected)
    }

    // ── Phases ──────────────────────────────────────────────────────────────

    async fn run_phases(&self) -> Result<(), Halt> {
        let h = &self.hypothesis;

        let request = self
            .phase(ProcessState::Generating, ErrorCode::GenerationFailed, async {
                let evolution_id = format!("evo-{}", uuid::Uuid::new_v4());
                let request = EvolutionRequest::from_hypothesis(
                    evolution_id.clone(),
                    h,
                    self.settings.constraints.clone(),
                )?;
                self.inner.lock().evolution_id = Some(evolution_id);
                Ok::<_, String>(request)
            })
            .await?;

        let (result, outcome) = self
            .phase(ProcessState::Testing, ErrorCode::TestingFailed, self.test(&request))
            .await?;

        let validation = self
            .phase(ProcessState::Validating, ErrorCode::ValidationFailed, async {
                let tests_passed = outcome.success;
                let score = safety_score(h, tests_passed);
                if !score.is_finite() {
                    return Err(format!("safety score for {} is not finite", h.id));
                }
                let record = ValidationRecord {
                    tests_passed,
                    performance_improved: result.performance_improved(),
                    api_compatibility: CheckOutcome::Skipped("no compatibility checker".into()),
                    security: CheckOutcome::Skipped("no security scanner".into()),
                    safety_score: score,
                };
                let mut inner = self.inner.lock();
                inner.safety_score = Some(score);
                inner.validation = Some(record.clone());
                Ok(record)
            })
            .await?;

        let approved = self
            .phase(
                ProcessState::AwaitingApproval,
                ErrorCode::ApprovalFailed,
                self.approve(&request.id, &result, validation),
            )
            .await?;
        if !approved {
            info!(process_id = %self.id, "evolution rejected");
            self.reject();
            return Err(Halt::Interrupted);
        }

        let applied = self
            .phase(ProcessState::Applying, ErrorCode::ApplicationFailed, async {
                self.collaborators
                    .bridge
                    .apply_evolution(&request.id)
                    .await
                    .map_err(|e| format!("apply failed: {e}"))
            })
            .await;
        match applied {
            Err(Halt::Failed(err)) => Err(Halt::Failed(self.compensate(&request.id, err).await)),
            other => other,
        }
    }

    async fn test(&self, request: &EvolutionRequest) -> Result<(EvolutionResult, SandboxOutcome), String> {
        let c = &self.collaborators;

        let snapshot_id = c
            .rollback
            .create_snapshot(&EvolutionResult::pending(&request.id))
            .await
            .map_err(|e| format!("snapshot failed: {e}"))?;
        debug!(process_id = %self.id, snapshot_id = %snapshot_id, "snapshot taken");
        self.inner.lock().snapshot_id = Some(snapshot_id);

        let initial = c
            .bridge
            .request_evolution(request)
            .await
            .map_err(|e| format!("evolution request failed: {e}"))?;
        let result = self.await_evolution(initial).await?;
        self.inner.lock().evolution_result = Some(result.clone());
        if result.status == EvolutionStatus::Failed {
            return Err(format!(
                "evolution {} failed: {}",
                result.id,
                result.error.as_deref().unwrap_or("no reason given")
            ));
        }

        let limits = self.settings.sandbox.clone();
        let limit = limits.timeout();
        let sandbox_id = c
            .sandbox
            .create_sandbox(SandboxSpec {
                id: format!("sandbox-{}", request.id),
                code: result.code.clone().unwrap_or_default(),
                tests: result.tests.clone().unwrap_or_default(),
                config: limits,
            })
            .await
            .map_err(|e| format!("sandbox creation failed: {e}"))?;

        let outcome = match tokio::time::timeout(limit, c.sandbox.execute(&sandbox_id)).await {
            Ok(run) => run.map_err(|e| format!("sandbox execution failed: {e}"))?,
            Err(_) => {
                warn!(process_id = %self.id, sandbox_id = %sandbox_id, "sandbox timed out");
                SandboxOutcome::timed_out(limit)
            }
        };
        self.inner.lock().sandbox = Some(outcome.clone());
        Ok((result, outcome))
    }

    async fn await_evolution(&self, initial: EvolutionResult) -> Result<EvolutionResult, String> {
        let deadline = Instant::now() + self.settings.evolution_timeout;
        let mut current = initial;
        while !current.status.is_terminal() {
            if Instant::now() >= deadline {
                return Err(format!(
                    "evolution {} not finished within {}s",
                    current.id,
                    self.settings.evolution_timeout.as_secs()
                ));
            }
            tokio::time::sleep(self.settings.status_poll_interval).await;
            current = self
                .collaborators
                .bridge
                .get_evolution_status(&current.id)
                .await
                .map_err(|e| format!("status poll failed: {e}"))?;
        }
        Ok(current)
    }

    async fn approve(
        &self,
        evolution_id: &str,
        result: &EvolutionResult,
        validation: ValidationRecord,
    ) -> Result<bool, String> {
        let policy = self
            .collaborators
            .config
            .get_config()
            .await
            .map_err(|e| format!("policy lookup failed: {e}"))?;

        let automatic = policy.auto_approve.as_ref().is_some_and(|p| {
            auto_approves(p, validation.safety_score, &self.hypothesis.hypothesis_type)
        });
        if automatic {
            info!(process_id = %self.id, safety_score = validation.safety_score, "auto-approved");
            self.inner.lock().approval = Some(ApprovalSource::Automatic);
            return Ok(true);
        }

        let approved = self
            .collaborators
            .ui
            .request_approval(ApprovalRequest {
                evolution_id: evolution_id.to_string(),
                hypothesis: self.hypothesis.clone(),
                validation,
                changes: result.changes.clone(),
            })
            .await
            .map_err(|e| format!("approval request failed: {e}"))?;
        if approved {
            self.inner.lock().approval = Some(ApprovalSource::Manual);
        }
        Ok(approved)
    }

    /// Roll back after a failed apply and attach the result to `err`.
    async fn compensate(&self, evolution_id: &str, err: ProcessError) -> ProcessError {
        if !self.transition(ProcessState::Rollback) {
            return err;
        }
        self.inner.lock().phases.push(PhaseRecord::start(ProcessState::Rollback));
        let started = Instant::now();

        let has_snapshot = self.inner.lock().snapshot_id.is_some();
        let (status, details) = if !has_snapshot {
            (PhaseStatus::Failed, serde_json::json!({ "rollback": "no_snapshot" }))
        } else if !self.claim_rollback() {
            (PhaseStatus::Completed, serde_json::json!({ "rollback": "already_attempted" }))
        } else {
            match self.collaborators.rollback.rollback(evolution_id).await {
                Ok(()) => {
                    metrics::record_rollback(evolution_id, true);
                    (PhaseStatus::Completed, serde_json::json!({ "rollback": "succeeded" }))
                }
                Err(e) => {
                    metrics::record_rollback(evolution_id, false);
                    (
                        PhaseStatus::Failed,
                        serde_json::json!({ "rollback": "failed", "rollback_error": e.to_string() }),
                    )
                }
            }
        };

        self.inner.lock().close_open_phase(status);
        metrics::record_phase_latency(ProcessState::Rollback.as_str(), started.elapsed());
        err.with_details(details)
    }

    // ── Plumbing ────────────────────────────────────────────────────────────

    /// Enter `state`, run `work` unless halted, and record the phase.
    async fn phase<T, F>(&self, state: ProcessState, code: ErrorCode, work: F) -> Result<T, Halt>
    where
        F: Future<Output = Result<T, String>>,
    {
        if !self.transition(state) {
            return Err(Halt::Interrupted);
        }
        self.inner.lock().phases.push(PhaseRecord::start(state));
        let started = Instant::now();

        let mut halt_rx = self.halt_tx.subscribe();
        let result = tokio::select! {
            biased;
            Ok(_) = halt_rx.wait_for(|halted| *halted) => {
                self.inner.lock().close_open_phase(PhaseStatus::Cancelled);
                return Err(Halt::Interrupted);
            }
            r = work => r,
        };
        metrics::record_phase_latency(state.as_str(), started.elapsed());

        match result {
            Ok(value) => {
                self.inner.lock().close_open_phase(PhaseStatus::Completed);
                Ok(value)
            }
            Err(message) => {
                self.inner.lock().close_open_phase(PhaseStatus::Failed);
                Err(Halt::Failed(ProcessError::new(code, message, state)))
            }
        }
    }

    /// Move to `to` unless already terminal; emits `StateChanged`.
    fn transition(&self, to: ProcessState) -> bool {
        let from = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            let from = inner.state;
            inner.state = to;
            if to.is_terminal() {
                inner.ended_at = Some(Instant::now());
                inner.close_open_phase(PhaseStatus::Cancelled);
            }
            from
        };
        debug!(process_id = %self.id, from = %from, to = %to, "state changed");
        if to.is_terminal() {
            info!(process_id = %self.id, state = %to, "evolution process finished");
            metrics::record_process_outcome(to.as_str());
        }
        self.events.emit(EvolutionEvent::StateChanged {
            process_id: self.id.clone(),
            old_state: from,
            new_state: to,
        });
        true
    }

    fn claim_rollback(&self) -> bool {
        !self.rollback_claimed.swap(true, Ordering::SeqCst)
    }
}
