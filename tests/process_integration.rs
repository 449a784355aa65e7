//! Integration tests for the evolution process and orchestrator.
//!
//! Scenarios:
//! 1. Auto-approval completes without asking the UI
//! 2. Manual rejection ends in `rejected` and never applies
//! 3. Apply failure rolls back exactly once
//! 4. Phase order is observable through `StateChanged` events
//! 5. Sandbox timeout is a failed test run, not a crash
//! 6. Cancellation mid-approval releases the snapshot

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_evolution_orchestrator::config::{EngineConfig, StaticConfigManager};
use tokio_evolution_orchestrator::events::{EventBus, EvolutionEvent};
use tokio_evolution_orchestrator::orchestrator::EvolutionOrchestrator;
use tokio_evolution_orchestrator::process::{
    ApprovalRequest, ApprovalUi, AutoApprovePolicy, Bridge, CollaboratorError, Collaborators,
    ConfigManager, ErrorCode, EvolutionProcess, EvolutionRequest, EvolutionResult, EvolutionStatus,
    FileChange, ImprovementHypothesis, PhaseStatus, ProcessPolicy, ProcessSettings, ProcessState,
    RollbackManager, SandboxManager, SandboxOutcome, SandboxSpec,
};

// ─── Mock collaborators ──────────────────────────────────────────────────

struct Mock {
    fail_request: bool,
    fail_apply: bool,
    fail_config: bool,
    fail_rollback: bool,
    running_polls: usize,
    sandbox_success: bool,
    sandbox_delay: Option<Duration>,
    ui_answer: bool,
    ui_blocks: bool,
    auto: Option<AutoApprovePolicy>,
    calls: Mutex<Vec<&'static str>>,
    polls: AtomicUsize,
}

impl Default for Mock {
    fn default() -> Self {
        Self {
            fail_request: false,
            fail_apply: false,
            fail_config: false,
            fail_rollback: false,
            running_polls: 0,
            sandbox_success: true,
            sandbox_delay: None,
            ui_answer: true,
            ui_blocks: false,
            auto: None,
            calls: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        }
    }
}

impl Mock {
    fn log(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    fn position(&self, call: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| *c == call)
    }

    fn result(&self, id: &str, status: EvolutionStatus) -> EvolutionResult {
        let mut r = EvolutionResult::pending(id);
        r.status = status;
        if status == EvolutionStatus::Completed {
            r.code = Some("pub fn fast() {}".into());
            r.tests = Some("#[test] fn t() {}".into());
            r.changes = vec![FileChange {
                path: "src/lib.rs".into(),
                diff: "+pub fn fast() {}".into(),
            }];
            r.metrics_before.insert("latency_ms".into(), 120.0);
            r.metrics_after.insert("latency_ms".into(), 90.0);
        }
        r
    }
}

#[async_trait]
impl Bridge for Mock {
    async fn request_evolution(
        &self,
        request: &EvolutionRequest,
    ) -> Result<EvolutionResult, CollaboratorError> {
        self.log("request");
        if self.fail_request {
            return Err(CollaboratorError::new("bridge offline"));
        }
        let status = if self.running_polls > 0 {
            EvolutionStatus::Running
        } else {
            EvolutionStatus::Completed
        };
        Ok(self.result(&request.id, status))
    }

    async fn apply_evolution(&self, _id: &str) -> Result<(), CollaboratorError> {
        self.log("apply");
        if self.fail_apply {
            Err(CollaboratorError::new("merge conflict"))
        } else {
            Ok(())
        }
    }

    async fn get_evolution_status(&self, id: &str) -> Result<EvolutionResult, CollaboratorError> {
        self.log("status");
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = if n >= self.running_polls {
            EvolutionStatus::Completed
        } else {
            EvolutionStatus::Running
        };
        Ok(self.result(id, status))
    }
}

#[async_trait]
impl SandboxManager for Mock {
    async fn create_sandbox(&self, spec: SandboxSpec) -> Result<String, CollaboratorError> {
        self.log("sandbox_create");
        Ok(spec.id)
    }

    async fn execute(&self, _id: &str) -> Result<SandboxOutcome, CollaboratorError> {
        self.log("sandbox_execute");
        if let Some(delay) = self.sandbox_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(SandboxOutcome {
            success: self.sandbox_success,
            exit_code: Some(if self.sandbox_success { 0 } else { 1 }),
            output: String::new(),
            timed_out: false,
        })
    }
}

#[async_trait]
impl ApprovalUi for Mock {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<bool, CollaboratorError> {
        self.log("approval");
        assert_eq!(request.changes.len(), 1);
        if self.ui_blocks {
            std::future::pending::<()>().await;
        }
        Ok(self.ui_answer)
    }
}

#[async_trait]
impl RollbackManager for Mock {
    async fn create_snapshot(&self, result: &EvolutionResult) -> Result<String, CollaboratorError> {
        self.log("snapshot");
        Ok(format!("snap-{}", result.id))
    }

    async fn rollback(&self, _id: &str) -> Result<(), CollaboratorError> {
        self.log("rollback");
        if self.fail_rollback {
            Err(CollaboratorError::new("snapshot corrupted"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConfigManager for Mock {
    async fn get_config(&self) -> Result<ProcessPolicy, CollaboratorError> {
        self.log("config");
        if self.fail_config {
            return Err(CollaboratorError::new("config store unreachable"));
        }
        Ok(ProcessPolicy {
            auto_approve: self.auto.clone(),
        })
    }
}

fn collaborators(mock: &Arc<Mock>) -> Collaborators {
    Collaborators {
        bridge: mock.clone(),
        sandbox: mock.clone(),
        ui: mock.clone(),
        rollback: mock.clone(),
        config: mock.clone(),
    }
}

fn performance_hypothesis() -> ImprovementHypothesis {
    ImprovementHypothesis::new("h-perf", "performance", "memoise tokenizer")
        .with_confidence(0.9)
        .with_impact("latency_ms", 120.0, 25.0)
        .with_dependencies(["src/tokenizer.rs"])
}

fn auto_policy() -> AutoApprovePolicy {
    AutoApprovePolicy {
        enabled: true,
        max_risk_level: 0.5,
        types: vec!["performance".into()],
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_auto_approval_completes_without_ui() {
    let mock = Arc::new(Mock {
        auto: Some(auto_policy()),
        ..Mock::default()
    });
    let process =
        EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), ProcessSettings::default());

    let outcome = process.execute().await.unwrap();

    assert_eq!(outcome.state, ProcessState::Completed);
    assert_eq!(outcome.safety_score, Some(100.0));
    assert_eq!(mock.count("approval"), 0);
    assert_eq!(mock.count("apply"), 1);
    assert_eq!(mock.count("rollback"), 0);
    let validation = outcome.validation.unwrap();
    assert!(validation.tests_passed);
    assert!(!validation.performance_improved);
}

#[tokio::test]
async fn test_manual_rejection_never_applies() {
    let mock = Arc::new(Mock {
        auto: Some(AutoApprovePolicy {
            enabled: false,
            ..auto_policy()
        }),
        ui_answer: false,
        ..Mock::default()
    });
    let process =
        EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), ProcessSettings::default());

    let outcome = process.execute().await.unwrap();

    assert_eq!(outcome.state, ProcessState::Rejected);
    assert_eq!(mock.count("approval"), 1);
    assert_eq!(mock.count("apply"), 0);
    assert_eq!(mock.count("rollback"), 0);
    assert!(outcome.phases.iter().all(|p| p.phase != ProcessState::Applying));
}

#[tokio::test]
async fn test_apply_failure_rolls_back_exactly_once_before_error() {
    let mock = Arc::new(Mock {
        fail_apply: true,
        ..Mock::default()
    });
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let process = EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), ProcessSettings::default())
        .with_event_bus(events);

    let err = process.execute().await.unwrap_err();

    assert_eq!(err.code, ErrorCode::ApplicationFailed);
    assert_eq!(err.phase, ProcessState::Applying);
    assert!(err.message.contains("merge conflict"));
    assert_eq!(mock.count("rollback"), 1);
    assert!(mock.position("apply") < mock.position("rollback"));

    let mut states = Vec::new();
    while let Ok(EvolutionEvent::StateChanged { new_state, .. }) = rx.try_recv() {
        states.push(new_state);
    }
    assert_eq!(
        &states[states.len() - 3..],
        &[ProcessState::Applying, ProcessState::Rollback, ProcessState::Failed]
    );
}

#[tokio::test]
async fn test_failed_rollback_is_reported_in_details() {
    let mock = Arc::new(Mock {
        fail_apply: true,
        fail_rollback: true,
        ..Mock::default()
    });
    let process =
        EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), ProcessSettings::default());

    let err = process.execute().await.unwrap_err();
    let details = err.details.unwrap();
    assert_eq!(details["rollback"], "failed");
    assert!(details["rollback_error"].as_str().unwrap().contains("corrupted"));
    assert_eq!(process.state(), ProcessState::Failed);
}

#[tokio::test]
async fn test_state_changes_follow_fixed_order() {
    let mock = Arc::new(Mock::default());
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let process = EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), ProcessSettings::default())
        .with_event_bus(events);

    process.execute().await.unwrap();

    let mut transitions = Vec::new();
    while let Ok(EvolutionEvent::StateChanged {
        old_state,
        new_state,
        ..
    }) = rx.try_recv()
    {
        transitions.push((old_state, new_state));
    }
    assert_eq!(
        transitions,
        vec![
            (ProcessState::Pending, ProcessState::Generating),
            (ProcessState::Generating, ProcessState::Testing),
            (ProcessState::Testing, ProcessState::Validating),
            (ProcessState::Validating, ProcessState::AwaitingApproval),
            (ProcessState::AwaitingApproval, ProcessState::Applying),
            (ProcessState::Applying, ProcessState::Completed),
        ]
    );
}

#[tokio::test]
async fn test_snapshot_precedes_code_request() {
    let mock = Arc::new(Mock::default());
    let process =
        EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), ProcessSettings::default());
    let outcome = process.execute().await.unwrap();

    assert!(mock.position("snapshot") < mock.position("request"));
    assert!(outcome.snapshot_id.unwrap().starts_with("snap-evo-"));
}

#[tokio::test]
async fn test_invalid_hypothesis_fails_generation_without_snapshot() {
    let mock = Arc::new(Mock::default());
    let hypothesis = performance_hypothesis().with_confidence(1.7);
    let process = EvolutionProcess::new(hypothesis, collaborators(&mock), ProcessSettings::default());

    let err = process.execute().await.unwrap_err();

    assert_eq!(err.code, ErrorCode::GenerationFailed);
    assert_eq!(err.phase, ProcessState::Generating);
    assert_eq!(mock.count("snapshot"), 0);
    assert_eq!(process.state(), ProcessState::Failed);
}

#[tokio::test]
async fn test_bridge_error_is_testing_failed() {
    let mock = Arc::new(Mock {
        fail_request: true,
        ..Mock::default()
    });
    let process =
        EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), ProcessSettings::default());

    let err = process.execute().await.unwrap_err();

    assert_eq!(err.code, ErrorCode::TestingFailed);
    assert!(err.to_string().contains("bridge offline"));
    let phases = process.phases();
    let testing = phases.iter().find(|p| p.phase == ProcessState::Testing).unwrap();
    assert_eq!(testing.status, PhaseStatus::Failed);
}

#[tokio::test]
async fn test_policy_error_is_approval_failed() {
    let mock = Arc::new(Mock {
        fail_config: true,
        ..Mock::default()
    });
    let process =
        EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), ProcessSettings::default());

    let err = process.execute().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ApprovalFailed);
    assert_eq!(mock.count("apply"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bridge_status_is_polled_until_terminal() {
    let mock = Arc::new(Mock {
        running_polls: 3,
        ..Mock::default()
    });
    let settings = ProcessSettings {
        status_poll_interval: Duration::from_millis(100),
        ..ProcessSettings::default()
    };
    let process = EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), settings);

    let outcome = process.execute().await.unwrap();

    assert_eq!(outcome.state, ProcessState::Completed);
    assert_eq!(mock.count("status"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_sandbox_timeout_counts_as_failed_tests() {
    let mock = Arc::new(Mock {
        sandbox_delay: Some(Duration::from_secs(30)),
        ..Mock::default()
    });
    let mut settings = ProcessSettings::default();
    settings.sandbox.timeout_secs = 2;
    let process = EvolutionProcess::new(performance_hypothesis(), collaborators(&mock), settings);

    let outcome = process.execute().await.unwrap();

    let sandbox = outcome.sandbox.unwrap();
    assert!(sandbox.timed_out);
    assert!(!sandbox.success);
    assert!(!outcome.validation.unwrap().tests_passed);
    assert_eq!(outcome.safety_score, Some(70.0));
    assert_eq!(outcome.state, ProcessState::Completed);
}

#[tokio::test]
async fn test_cancel_while_awaiting_approval_rolls_back() {
    let mock = Arc::new(Mock {
        ui_blocks: true,
        ..Mock::default()
    });
    let process = Arc::new(EvolutionProcess::new(
        performance_hypothesis(),
        collaborators(&mock),
        ProcessSettings::default(),
    ));

    let runner = Arc::clone(&process);
    let handle = tokio::spawn(async move { runner.execute().await });
    while mock.count("approval") == 0 {
        tokio::task::yield_now().await;
    }

    assert!(process.cancel().await);
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.state, ProcessState::Cancelled);
    assert_eq!(mock.count("rollback"), 1);
    assert_eq!(mock.count("apply"), 0);
    let approval = outcome
        .phases
        .iter()
        .find(|p| p.phase == ProcessState::AwaitingApproval)
        .unwrap();
    assert_eq!(approval.status, PhaseStatus::Cancelled);
}

#[tokio::test]
async fn test_orchestrator_uses_static_policy_from_config() {
    let mut config = EngineConfig::default();
    config.evolution.max_concurrent_evolutions = 2;
    config.process.auto_approve = auto_policy();

    let mock = Arc::new(Mock::default());
    let mut collab = collaborators(&mock);
    collab.config = Arc::new(StaticConfigManager::new(&config));
    let orchestrator = EvolutionOrchestrator::from_config(collab, &config);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            orchestrator
                .submit(
                    ImprovementHypothesis::new(format!("h{i}"), "performance", "d")
                        .with_confidence(0.95),
                )
                .1
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().state, ProcessState::Completed);
    }

    let status = orchestrator.status();
    assert_eq!(status.completed, 4);
    assert_eq!(status.running, 0);
    assert_eq!(status.max_concurrent, 2);
    assert_eq!(mock.count("approval"), 0);
}
