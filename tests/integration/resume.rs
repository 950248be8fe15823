//! Checkpoint and resume behavior across process restarts.

use std::fs;
use std::sync::Arc;

use maestro::agent::AgentCapability;
use maestro::checkpoint::{hash_prompt, CheckpointStore, Snapshot};
use maestro::core::{ChangeSet, Task, TaskDag};
use maestro::error::Error;
use maestro::orchestrate::{clear_checkpoint, Orchestrator, Phase};
use maestro::workspace::{setup_repo, WorkspaceManager};

use crate::fixtures::{breakdown, ScriptedAgent, TestRun};

#[tokio::test]
async fn test_rerun_after_done_is_idempotent() {
    let fixture = TestRun::new();
    let agent: Arc<dyn AgentCapability> =
        Arc::new(ScriptedAgent::new(breakdown(&[("work", &[])])));

    let first = Orchestrator::new(fixture.config(), Arc::clone(&agent))
        .run()
        .await
        .unwrap();
    let second = Orchestrator::new(fixture.config(), agent).run().await.unwrap();

    assert_eq!(second.phase, Phase::Done);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.merged, first.merged);
    assert_eq!(second.final_commit, first.final_commit);
}

#[tokio::test]
async fn test_resume_mid_execution_runs_remaining_tasks() {
    let fixture = TestRun::new();
    let config = fixture.config();

    // Manufacture the state a run leaves behind when killed after one of
    // two tasks finished: its branch committed, its worktree cleaned up,
    // the checkpoint parked in the execution phase.
    setup_repo(&config.repo, &config.repo_dir()).unwrap();
    let manager = WorkspaceManager::new(&config.repo_dir()).unwrap();

    let mut done = Task::new("a", "implement a");
    done.start();
    let worktree = manager.create_task_workspace(&done.id).unwrap();
    fs::write(worktree.join("a.txt"), "a\n").unwrap();
    let commit = manager.commit_all(&worktree, "maestro: a").unwrap();
    manager.remove_task_workspace(&done.id).unwrap();
    let done_id = done.id;
    done.succeed(ChangeSet::new(
        done.id,
        WorkspaceManager::task_branch(&done.id),
        commit,
    ));

    let pending = Task::new("b", "implement b");
    let pending_id = pending.id;

    let mut dag = TaskDag::new();
    dag.add_task(done);
    dag.add_task(pending);

    let prompt = fs::read_to_string(&fixture.prompt_path).unwrap();
    let mut snapshot = Snapshot::new(
        hash_prompt(&prompt),
        config.repo.to_string(),
        dag.snapshot(),
    );
    snapshot.phase = Phase::Execution;
    snapshot.completion_order.push(done_id);
    CheckpointStore::new(config.checkpoint_path())
        .save(&mut snapshot)
        .unwrap();

    // The breakdown is never consulted; planning already happened.
    let agent = Arc::new(ScriptedAgent::new(breakdown(&[])));
    let report = Orchestrator::new(config, agent).run().await.unwrap();

    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.merged, vec![done_id, pending_id]);
    assert!(fixture.repo_dir().join("a.txt").exists());
    assert!(fixture.repo_dir().join("b.txt").exists());
}

#[tokio::test]
async fn test_failed_run_requires_checkpoint_clear() {
    let fixture = TestRun::new();
    let mut config = fixture.config();
    config.verify_command = Some("false".to_string());
    config.max_heal_iterations = 0;

    let agent: Arc<dyn AgentCapability> =
        Arc::new(ScriptedAgent::new(breakdown(&[("work", &[])])));
    Orchestrator::new(config.clone(), Arc::clone(&agent))
        .run()
        .await
        .unwrap_err();

    // Re-running against a failed checkpoint refuses to proceed.
    let err = Orchestrator::new(config.clone(), agent).run().await.unwrap_err();
    assert!(err.to_string().contains("clear the checkpoint"));

    // After clearing, a fresh run with a passing verify succeeds. The
    // retained repo already holds work.txt, so the new plan does new work.
    clear_checkpoint(&config).unwrap();
    let mut retry = config.clone();
    retry.verify_command = None;
    let agent = Arc::new(ScriptedAgent::new(breakdown(&[("retry", &[])])));
    let report = Orchestrator::new(retry, agent).run().await.unwrap();

    assert_eq!(report.phase, Phase::Done);
    assert!(fixture.repo_dir().join("retry.txt").exists());
}

#[tokio::test]
async fn test_fresh_start_clears_existing_checkpoint() {
    let fixture = TestRun::new();
    let agent = Arc::new(ScriptedAgent::new(breakdown(&[("work", &[])])));
    let first = Orchestrator::new(fixture.config(), agent).run().await.unwrap();

    let mut config = fixture.config();
    config.resume = false;
    let agent = Arc::new(ScriptedAgent::new(breakdown(&[("again", &[])])));
    let second = Orchestrator::new(config, agent).run().await.unwrap();

    // A whole new run was planned and executed against the retained repo.
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.phase, Phase::Done);
    assert!(fixture.repo_dir().join("work.txt").exists());
    assert!(fixture.repo_dir().join("again.txt").exists());
}

#[tokio::test]
async fn test_resume_refuses_changed_prompt() {
    let fixture = TestRun::new();
    let agent: Arc<dyn AgentCapability> =
        Arc::new(ScriptedAgent::new(breakdown(&[("work", &[])])));
    Orchestrator::new(fixture.config(), Arc::clone(&agent))
        .run()
        .await
        .unwrap();

    fs::write(&fixture.prompt_path, "Build something else entirely.\n").unwrap();
    let err = Orchestrator::new(fixture.config(), agent).run().await.unwrap_err();

    assert!(matches!(err, Error::CheckpointCorruption(_)));
    assert!(err.to_string().contains("different prompt"));
}
