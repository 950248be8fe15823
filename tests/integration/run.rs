//! End-to-end runs through every phase with a scripted agent.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use maestro::agent::{AgentCapability, Artifact, ProposalKind, ProposalRequest};
use maestro::checkpoint::CheckpointStore;
use maestro::core::TaskStatus;
use maestro::error::{Error, Result};
use maestro::orchestrate::{Orchestrator, Phase};
use maestro::workspace::WorkspaceManager;

use crate::fixtures::{breakdown, ScriptedAgent, TestRun};

#[tokio::test]
async fn test_happy_path_plans_executes_integrates_verifies() {
    let fixture = TestRun::new();
    let mut config = fixture.config();
    config.verify_command = Some("true".to_string());

    let agent = Arc::new(ScriptedAgent::new(breakdown(&[
        ("model", &[]),
        ("api", &["model"]),
        ("docs", &[]),
    ])));

    let report = Orchestrator::new(config.clone(), agent).run().await.unwrap();

    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.tasks_total, 3);
    assert_eq!(report.tasks_succeeded, 3);
    assert_eq!(report.merged.len(), 3);
    assert_eq!(report.heal_iterations, 0);
    for file in ["model.txt", "api.txt", "docs.txt"] {
        assert!(fixture.repo_dir().join(file).exists(), "{} missing", file);
    }

    let snapshot = CheckpointStore::new(config.checkpoint_path()).load().unwrap();
    assert_eq!(snapshot.phase, Phase::Done);
    assert_eq!(snapshot.integrated.len(), 3);

    // Merged task branches are deleted after integration.
    let manager = WorkspaceManager::new(&fixture.repo_dir()).unwrap();
    for task in &snapshot.dag.tasks {
        let branch = WorkspaceManager::task_branch(&task.id);
        assert!(
            !manager.branch_exists(&branch).unwrap(),
            "{} left behind",
            branch
        );
    }
}

#[tokio::test]
async fn test_dependency_order_respected_in_merge() {
    let fixture = TestRun::new();
    let agent = Arc::new(ScriptedAgent::new(breakdown(&[
        ("first", &[]),
        ("second", &["first"]),
    ])));

    let report = Orchestrator::new(fixture.config(), agent).run().await.unwrap();

    // With a chain, completion order equals dependency order.
    assert_eq!(report.merged.len(), 2);
    let snapshot = CheckpointStore::new(fixture.config().checkpoint_path())
        .load()
        .unwrap();
    let first = snapshot
        .dag
        .tasks
        .iter()
        .find(|t| t.title == "first")
        .unwrap();
    assert_eq!(snapshot.completion_order[0], first.id);
}

#[tokio::test]
async fn test_overlapping_tasks_conflict_resolved_by_agent() {
    let fixture = TestRun::new();
    let agent = Arc::new(
        ScriptedAgent::new(breakdown(&[("left", &[]), ("right", &[])]))
            .with_impl("left", "shared.txt", "line1 from left\nline2\nline3\n")
            .with_impl("right", "shared.txt", "line1 from right\nline2\nline3\n")
            .with_resolution("line1 merged\nline2\nline3\n"),
    );

    let report = Orchestrator::new(fixture.config(), agent).run().await.unwrap();

    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.resolved_conflicts.len(), 1);
    let merged = fs::read_to_string(fixture.repo_dir().join("shared.txt")).unwrap();
    assert!(merged.contains("line1 merged"));
    assert!(!merged.contains("<<<<<<<"));
}

#[tokio::test]
async fn test_failed_task_fails_run_by_default() {
    let fixture = TestRun::new();
    let agent = Arc::new(
        ScriptedAgent::new(breakdown(&[("good", &[]), ("bad", &[])])).failing("bad"),
    );

    let err = Orchestrator::new(fixture.config(), agent).run().await.unwrap_err();

    assert!(matches!(err, Error::Task { .. }));
    let snapshot = CheckpointStore::new(fixture.config().checkpoint_path())
        .load()
        .unwrap();
    assert_eq!(snapshot.phase, Phase::Failed);
}

#[tokio::test]
async fn test_continue_on_failure_integrates_succeeded_subset() {
    let fixture = TestRun::new();
    let mut config = fixture.config();
    config.continue_on_task_failure = true;

    let agent = Arc::new(
        ScriptedAgent::new(breakdown(&[("good", &[]), ("bad", &[])])).failing("bad"),
    );

    let report = Orchestrator::new(config, agent).run().await.unwrap();

    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.tasks_succeeded, 1);
    assert_eq!(report.tasks_failed, 1);
    assert_eq!(report.merged.len(), 1);
    assert!(fixture.repo_dir().join("good.txt").exists());
    assert!(!fixture.repo_dir().join("bad.txt").exists());
}

#[tokio::test]
async fn test_dependent_of_failed_task_never_executes() {
    let fixture = TestRun::new();
    let mut config = fixture.config();
    config.continue_on_task_failure = true;

    let agent = Arc::new(
        ScriptedAgent::new(breakdown(&[
            ("bad", &[]),
            ("child", &["bad"]),
            ("solo", &[]),
        ]))
        .failing("bad"),
    );

    let report = Orchestrator::new(config.clone(), agent).run().await.unwrap();

    assert_eq!(report.merged.len(), 1);
    assert!(fixture.repo_dir().join("solo.txt").exists());
    assert!(!fixture.repo_dir().join("child.txt").exists());

    let snapshot = CheckpointStore::new(config.checkpoint_path()).load().unwrap();
    let child = snapshot
        .dag
        .tasks
        .iter()
        .find(|t| t.title == "child")
        .unwrap();
    assert_eq!(child.status, TaskStatus::Pending);
    assert!(child.started_at.is_none());
}

#[tokio::test]
async fn test_verification_failure_healed_within_budget() {
    let fixture = TestRun::new();
    // check.sh fails until fixed.txt exists; the scripted fix writes it.
    fs::write(fixture.source_dir.join("check.sh"), "test -f fixed.txt\n").unwrap();
    let mut config = fixture.config();
    config.verify_command = Some("sh check.sh".to_string());

    let agent = Arc::new(
        ScriptedAgent::new(breakdown(&[("work", &[])])).with_fix("fixed.txt", "ok\n"),
    );

    let report = Orchestrator::new(config, agent).run().await.unwrap();

    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.heal_iterations, 1);
    assert!(fixture.repo_dir().join("fixed.txt").exists());
}

#[tokio::test]
async fn test_heal_budget_exhausted_fails_run() {
    let fixture = TestRun::new();
    let mut config = fixture.config();
    config.verify_command = Some("false".to_string());
    config.max_heal_iterations = 1;

    let agent = Arc::new(
        ScriptedAgent::new(breakdown(&[("work", &[])])).with_fix("useless.txt", "x\n"),
    );

    let err = Orchestrator::new(config.clone(), agent).run().await.unwrap_err();

    assert!(matches!(err, Error::VerificationFailed { iterations: 1 }));
    let snapshot = CheckpointStore::new(config.checkpoint_path()).load().unwrap();
    assert_eq!(snapshot.phase, Phase::Failed);
}

/// Implements "quick" immediately; "slow" blocks until released, so a
/// run can be aborted while one task is still in flight.
struct HoldingAgent {
    breakdown: String,
    release: Arc<AtomicBool>,
}

impl AgentCapability for HoldingAgent {
    fn propose(&self, request: &ProposalRequest) -> Result<Artifact> {
        match request.kind {
            ProposalKind::MasterPlan => Ok(Artifact::new("Quick then slow.")),
            ProposalKind::TaskBreakdown => Ok(Artifact::new(self.breakdown.clone())),
            ProposalKind::Implement => {
                let title = request
                    .prompt
                    .lines()
                    .find(|l| l.starts_with("Task: "))
                    .map(|l| l.trim_start_matches("Task: ").trim())
                    .unwrap_or("");
                if title == "slow" {
                    let deadline = Instant::now() + Duration::from_secs(30);
                    while !self.release.load(Ordering::SeqCst) && Instant::now() < deadline {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
                Ok(Artifact::new(format!(
                    "<<<FILE: {0}.txt>>>\n{0}\n<<<END_FILE>>>",
                    title
                )))
            }
            _ => panic!("unexpected proposal kind {:?}", request.kind),
        }
    }

    fn name(&self) -> &str {
        "holding"
    }
}

#[tokio::test]
async fn test_abort_fails_run_and_keeps_completed_work_checkpointed() {
    let fixture = TestRun::new();
    let config = fixture.config();
    let release = Arc::new(AtomicBool::new(false));
    let agent: Arc<dyn AgentCapability> = Arc::new(HoldingAgent {
        breakdown: breakdown(&[("quick", &[]), ("slow", &[])]),
        release: Arc::clone(&release),
    });

    let orchestrator = Orchestrator::new(config.clone(), agent);
    let cancel = orchestrator.cancellation_token();
    let handle = tokio::spawn(async move { orchestrator.run().await });

    // Wait until the quick task's completion has been checkpointed.
    let store = CheckpointStore::new(config.checkpoint_path());
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(snapshot) = store.load() {
            if snapshot.completion_order.len() == 1 {
                break;
            }
        }
        assert!(Instant::now() < deadline, "first task never completed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    cancel.cancel();
    release.store(true, Ordering::SeqCst);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Aborted));

    // The checkpoint records the failure without losing finished work.
    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.phase, Phase::Failed);
    assert_eq!(snapshot.completion_order.len(), 1);
    let quick = snapshot
        .dag
        .tasks
        .iter()
        .find(|t| t.title == "quick")
        .unwrap();
    assert_eq!(quick.status, TaskStatus::Succeeded);
    assert_eq!(snapshot.completion_order[0], quick.id);
}

#[tokio::test]
async fn test_cyclic_plan_rejected_before_execution() {
    let fixture = TestRun::new();
    let agent = Arc::new(ScriptedAgent::new(breakdown(&[
        ("t1", &["t2"]),
        ("t2", &["t1"]),
    ])));

    let err = Orchestrator::new(fixture.config(), agent).run().await.unwrap_err();

    assert!(matches!(err, Error::Planning(_)));
    // Nothing ran.
    assert!(!fixture.repo_dir().join("t1.txt").exists());
    assert!(!fixture.repo_dir().join("t2.txt").exists());
}
