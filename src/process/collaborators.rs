//! # Process collaborators
//!
//! ## Responsibility
//! Contracts for the external systems an evolution process calls out to:
//! the code-generation [`Bridge`], the [`SandboxManager`], the human
//! [`ApprovalUi`], the [`RollbackManager`] and the policy [`ConfigManager`],
//! plus the data each of them exchanges with the process.
//!
//! ## Guarantees
//! - Object-safe: every trait is consumed as `Arc<dyn Trait>`
//! - Uniform failure type: every call returns [`CollaboratorError`], which the
//!   process maps onto the failing phase's error code
//!
//! ## NOT Responsible For
//! - Implementations (supplied by the embedding application or tests)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hypothesis::ImprovementHypothesis;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    /// Error carrying `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

// ─── Requests and results ─────────────────────────────────────────────────────

/// Execution policy attached to every evolution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvolutionConstraints {
    /// Upper bound on generated code's execution time.
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    /// Minimum test coverage the generated change must keep.
    #[serde(default = "default_min_test_coverage")]
    pub min_test_coverage: f64,
    /// Reject changes that break public APIs.
    #[serde(default = "default_true")]
    pub preserve_api_compatibility: bool,
}

fn default_max_execution_time_ms() -> u64 {
    300_000
}
fn default_min_test_coverage() -> f64 {
    0.8
}
fn default_true() -> bool {
    true
}

impl Default for EvolutionConstraints {
    fn default() -> Self {
        Self {
            max_execution_time_ms: default_max_execution_time_ms(),
            min_test_coverage: default_min_test_coverage(),
            preserve_api_compatibility: default_true(),
        }
    }
}

/// What the bridge is asked to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionRequest {
    /// Evolution id; the bridge echoes it in [`EvolutionResult::id`].
    pub id: String,
    /// Hypothesis this request implements.
    pub hypothesis_id: String,
    /// Improvement category.
    pub improvement_type: String,
    /// What to change.
    pub description: String,
    /// Files the change may touch.
    pub target_files: Vec<String>,
    /// Current value of each metric the hypothesis expects to move.
    pub baseline_metrics: BTreeMap<String, f64>,
    /// Execution policy.
    pub constraints: EvolutionConstraints,
}

impl EvolutionRequest {
    /// Build the request for `hypothesis` under `evolution_id`.
    ///
    /// # Errors
    /// Returns a message if the confidence is outside `[0, 1]` or any
    /// baseline value is not finite.
    pub fn from_hypothesis(
        evolution_id: impl Into<String>,
        hypothesis: &ImprovementHypothesis,
        constraints: EvolutionConstraints,
    ) -> Result<Self, String> {
        if !(0.0..=1.0).contains(&hypothesis.confidence) {
            return Err(format!(
                "confidence {} outside [0, 1] for hypothesis {}",
                hypothesis.confidence, hypothesis.id
            ));
        }
        let mut baseline_metrics = BTreeMap::new();
        for impact in &hypothesis.expected_impact {
            if !impact.current_value.is_finite() {
                return Err(format!("baseline for metric '{}' is not finite", impact.metric));
            }
            baseline_metrics.insert(impact.metric.clone(), impact.current_value);
        }
        Ok(Self {
            id: evolution_id.into(),
            hypothesis_id: hypothesis.id.clone(),
            improvement_type: hypothesis.hypothesis_type.clone(),
            description: hypothesis.description.clone(),
            target_files: hypothesis.dependencies.clone(),
            baseline_metrics,
            constraints,
        })
    }
}

/// Progress of a bridge evolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvolutionStatus {
    /// Accepted, not started.
    Pending,
    /// Generating code.
    Running,
    /// Code and tests are available.
    Completed,
    /// Generation failed.
    Failed,
}

impl EvolutionStatus {
    /// `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One file touched by an evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the repository root.
    pub path: String,
    /// Unified diff.
    pub diff: String,
}

/// What the bridge produced for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionResult {
    /// Evolution id (same as the request id).
    pub id: String,
    /// Progress.
    pub status: EvolutionStatus,
    /// Generated code.
    #[serde(default)]
    pub code: Option<String>,
    /// Generated tests.
    #[serde(default)]
    pub tests: Option<String>,
    /// Files changed.
    #[serde(default)]
    pub changes: Vec<FileChange>,
    /// Metrics measured before the change.
    #[serde(default)]
    pub metrics_before: BTreeMap<String, f64>,
    /// Metrics measured after the change.
    #[serde(default)]
    pub metrics_after: BTreeMap<String, f64>,
    /// Failure cause when `status` is `Failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl EvolutionResult {
    /// Empty pending result for `id`, used to take the pre-change snapshot.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: EvolutionStatus::Pending,
            code: None,
            tests: None,
            changes: Vec::new(),
            metrics_before: BTreeMap::new(),
            metrics_after: BTreeMap::new(),
            error: None,
        }
    }

    /// `true` if any metric measured both before and after went up.
    pub fn performance_improved(&self) -> bool {
        self.metrics_after.iter().any(|(metric, after)| {
            self.metrics_before
                .get(metric)
                .is_some_and(|before| after > before)
        })
    }
}

// ─── Sandbox ──────────────────────────────────────────────────────────────────

/// Resource ceiling for one sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SandboxLimits {
    /// Hard wall-clock limit in seconds.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    /// Memory ceiling in megabytes.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// CPU ceiling in cores.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
}

fn default_sandbox_timeout_secs() -> u64 {
    300
}
fn default_memory_limit_mb() -> u64 {
    512
}
fn default_cpu_limit() -> f64 {
    1.0
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout_secs(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
        }
    }
}

impl SandboxLimits {
    /// Wall-clock limit.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Sandbox creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Sandbox id.
    pub id: String,
    /// Code under test.
    pub code: String,
    /// Tests to run against it.
    pub tests: String,
    /// Resource ceiling.
    pub config: SandboxLimits,
}

/// Result of a sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxOutcome {
    /// Tests passed within limits.
    pub success: bool,
    /// Process exit code, if it exited.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Captured output.
    #[serde(default)]
    pub output: String,
    /// The run hit the time limit.
    #[serde(default)]
    pub timed_out: bool,
}

impl SandboxOutcome {
    /// Outcome recorded when the run exceeded `limit`.
    pub fn timed_out(limit: Duration) -> Self {
        Self {
            success: false,
            exit_code: None,
            output: format!("sandbox exceeded {}s limit", limit.as_secs()),
            timed_out: true,
        }
    }
}

// ─── Validation and approval ──────────────────────────────────────────────────

/// Result of a secondary validation check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The check passed.
    Pass,
    /// The check failed.
    Fail(String),
    /// The check did not run.
    Skipped(String),
}

/// Validation produced before approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// Sandbox tests passed.
    pub tests_passed: bool,
    /// At least one measured metric improved.
    pub performance_improved: bool,
    /// Public API compatibility check.
    pub api_compatibility: CheckOutcome,
    /// Security scan.
    pub security: CheckOutcome,
    /// Safety score in `[0, 100]`.
    pub safety_score: f64,
}

/// What the approval UI is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Evolution awaiting approval.
    pub evolution_id: String,
    /// The hypothesis behind it.
    pub hypothesis: ImprovementHypothesis,
    /// Validation outcome.
    pub validation: ValidationRecord,
    /// Proposed file changes.
    pub changes: Vec<FileChange>,
}

/// Automatic approval rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct AutoApprovePolicy {
    /// Rule is active.
    #[serde(default)]
    pub enabled: bool,
    /// Tolerated risk as a fraction in `[0, 1]`; approves when
    /// `safety_score >= 100 - max_risk_level * 100`.
    #[serde(default)]
    pub max_risk_level: f64,
    /// Hypothesis types eligible for automatic approval.
    #[serde(default)]
    pub types: Vec<String>,
}

/// Policy returned by the [`ConfigManager`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessPolicy {
    /// Automatic approval, if configured.
    #[serde(default)]
    pub auto_approve: Option<AutoApprovePolicy>,
}

// ─── Traits ───────────────────────────────────────────────────────────────────

/// Code generation and application backend.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Start generating code for `request`.
    async fn request_evolution(
        &self,
        request: &EvolutionRequest,
    ) -> Result<EvolutionResult, CollaboratorError>;

    /// Apply a completed evolution.
    async fn apply_evolution(&self, evolution_id: &str) -> Result<(), CollaboratorError>;

    /// Current state of an evolution.
    async fn get_evolution_status(
        &self,
        evolution_id: &str,
    ) -> Result<EvolutionResult, CollaboratorError>;
}

/// Isolated execution environment.
#[async_trait]
pub trait SandboxManager: Send + Sync {
    /// Prepare a sandbox; returns its id.
    async fn create_sandbox(&self, spec: SandboxSpec) -> Result<String, CollaboratorError>;

    /// Run the sandbox's tests.
    async fn execute(&self, sandbox_id: &str) -> Result<SandboxOutcome, CollaboratorError>;
}

/// Human approval surface.
#[async_trait]
pub trait ApprovalUi: Send + Sync {
    /// Ask for approval; `true` approves.
    async fn request_approval(&self, request: ApprovalRequest) -> Result<bool, CollaboratorError>;
}

/// Snapshot storage for undoing applied evolutions.
#[async_trait]
pub trait RollbackManager: Send + Sync {
    /// Capture the state an evolution would change; returns the snapshot id.
    async fn create_snapshot(&self, result: &EvolutionResult) -> Result<String, CollaboratorError>;

    /// Restore the snapshot taken for `evolution_id`.
    async fn rollback(&self, evolution_id: &str) -> Result<(), CollaboratorError>;
}

/// Source of the approval policy.
#[async_trait]
pub trait ConfigManager: Send + Sync {
    /// Current policy.
    async fn get_config(&self) -> Result<ProcessPolicy, CollaboratorError>;
}

/// Every collaborator a process needs, shared between processes.
#[derive(Clone)]
pub struct Collaborators {
    /// Code generation backend.
    pub bridge: Arc<dyn Bridge>,
    /// Sandbox runner.
    pub sandbox: Arc<dyn SandboxManager>,
    /// Approval surface.
    pub ui: Arc<dyn ApprovalUi>,
    /// Snapshot store.
    pub rollback: Arc<dyn RollbackManager>,
    /// Policy source.
    pub config: Arc<dyn ConfigManager>,
}
