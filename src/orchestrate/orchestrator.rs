//! The run driver: phases, checkpointing, resume.
//!
//! One [`Orchestrator`] owns a run from prompt to report. It advances
//! the phase machine, persists a checkpoint after every phase
//! transition and every task completion, and picks up from the
//! checkpointed phase when restarted. Identity validation makes sure a
//! checkpoint is never resumed against a different prompt or repo.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentCapability;
use crate::checkpoint::{hash_prompt, CheckpointStore, Snapshot};
use crate::config::RunConfig;
use crate::core::{ChangeSet, TaskDag, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestrate::healer::Healer;
use crate::orchestrate::integrator::Integrator;
use crate::orchestrate::phase::{Phase, PhaseMachine};
use crate::orchestrate::planner::Planner;
use crate::orchestrate::scheduler::{Scheduler, SchedulerEvent};
use crate::workspace::{setup_repo, WorkspaceManager};
use crate::{mlog, mlog_error, mlog_warn};

/// Final outcome of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub phase: Phase,
    pub tasks_total: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    /// Tasks merged into the base, in merge order.
    pub merged: Vec<TaskId>,
    pub resolved_conflicts: Vec<(PathBuf, u32)>,
    pub heal_iterations: u32,
    /// HEAD of the base repository when the run finished.
    pub final_commit: String,
}

pub struct Orchestrator {
    config: RunConfig,
    agent: Arc<dyn AgentCapability>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: RunConfig, agent: Arc<dyn AgentCapability>) -> Self {
        Self {
            config,
            agent,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the run to a terminal phase.
    pub async fn run(&self) -> Result<RunReport> {
        let prompt = std::fs::read_to_string(&self.config.prompt_path)?;
        let prompt_hash = hash_prompt(&prompt);
        let repo_identity = self.config.repo.to_string();
        let store = CheckpointStore::new(self.config.checkpoint_path());

        setup_repo(&self.config.repo, &self.config.repo_dir())?;
        let workspace = Arc::new(WorkspaceManager::new(&self.config.repo_dir())?);

        if store.exists() && !self.config.resume {
            mlog!("Orchestrator: resume disabled, clearing existing checkpoint");
            store.clear()?;
        }

        let (mut machine, mut snapshot, mut dag) = if store.exists() {
            let snap = store.load()?;
            CheckpointStore::validate_identity(&snap, &prompt_hash, &repo_identity)?;
            mlog!("Orchestrator: resuming run {} at {}", snap.run_id, snap.phase);
            let mut dag = TaskDag::from_snapshot(snap.dag.clone())?;
            reset_interrupted(&mut dag);
            (PhaseMachine::resumed_at(snap.phase), snap, dag)
        } else {
            let snapshot = Snapshot::new(prompt_hash, repo_identity, TaskDag::new().snapshot());
            mlog!("Orchestrator: starting run {}", snapshot.run_id);
            (PhaseMachine::new(), snapshot, TaskDag::new())
        };

        let mut resolved_conflicts: Vec<(PathBuf, u32)> = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                self.transition(&mut machine, &store, &mut snapshot, Phase::Failed, Some("aborted"))?;
                return Err(Error::Aborted);
            }

            match machine.current() {
                Phase::Init => {
                    self.transition(&mut machine, &store, &mut snapshot, Phase::Planning, None)?;
                }
                Phase::Planning => {
                    dag = self.plan(&prompt).await.map_err(|e| {
                        self.fail(&mut machine, &store, &mut snapshot, &e);
                        e
                    })?;
                    snapshot.dag = dag.snapshot();
                    self.transition(&mut machine, &store, &mut snapshot, Phase::Execution, None)?;
                }
                Phase::Execution => {
                    let shared = Arc::new(RwLock::new(std::mem::take(&mut dag)));
                    let outcome = self
                        .execute(Arc::clone(&shared), Arc::clone(&workspace), &store, &mut snapshot)
                        .await;
                    dag = Arc::try_unwrap(shared)
                        .map_err(|_| Error::Validation("Scheduler still holds the DAG".to_string()))?
                        .into_inner();
                    snapshot.dag = dag.snapshot();
                    if let Err(e) = outcome {
                        self.fail(&mut machine, &store, &mut snapshot, &e);
                        return Err(e);
                    }

                    let failed = dag.failed_tasks().len() + dag.blocked_tasks().len();
                    if failed > 0 && !self.config.continue_on_task_failure {
                        let e = Error::Task {
                            task: format!("{} task(s)", failed),
                            reason: "Execution left failed or blocked tasks".to_string(),
                        };
                        self.fail(&mut machine, &store, &mut snapshot, &e);
                        return Err(e);
                    }
                    if snapshot.completion_order.is_empty() {
                        let e = Error::Task {
                            task: "all".to_string(),
                            reason: "No task produced a change set".to_string(),
                        };
                        self.fail(&mut machine, &store, &mut snapshot, &e);
                        return Err(e);
                    }
                    self.transition(&mut machine, &store, &mut snapshot, Phase::Integration, None)?;
                }
                Phase::Integration => {
                    match self.integrate(&dag, &snapshot).await {
                        Ok(report) => {
                            snapshot.integrated.extend(report.merged.iter().copied());
                            // Merged branches have served their purpose;
                            // leaving them around clutters every later merge.
                            for id in &report.merged {
                                workspace.delete_branch(&WorkspaceManager::task_branch(id))?;
                            }
                            resolved_conflicts = report.resolved_conflicts;
                            self.transition(
                                &mut machine,
                                &store,
                                &mut snapshot,
                                Phase::Verification,
                                None,
                            )?;
                        }
                        Err(e) => {
                            self.fail(&mut machine, &store, &mut snapshot, &e);
                            return Err(e);
                        }
                    }
                }
                Phase::Verification => {
                    match self.verify(Arc::clone(&workspace)).await {
                        Ok(iterations) => {
                            snapshot.heal_iterations = iterations;
                            self.transition(&mut machine, &store, &mut snapshot, Phase::Done, None)?;
                        }
                        Err(e) => {
                            self.fail(&mut machine, &store, &mut snapshot, &e);
                            return Err(e);
                        }
                    }
                }
                Phase::Done => break,
                Phase::Failed => {
                    return Err(Error::Validation(
                        "Checkpointed run already failed; clear the checkpoint to retry".to_string(),
                    ));
                }
            }
        }

        let report = RunReport {
            run_id: snapshot.run_id,
            phase: machine.current(),
            tasks_total: dag.task_count(),
            tasks_succeeded: dag.succeeded_tasks().len(),
            tasks_failed: dag.failed_tasks().len(),
            merged: snapshot.integrated.clone(),
            resolved_conflicts,
            heal_iterations: snapshot.heal_iterations,
            final_commit: workspace.head_commit()?,
        };
        mlog!(
            "Orchestrator: run {} done, {} of {} tasks merged",
            report.run_id,
            report.merged.len(),
            report.tasks_total
        );
        Ok(report)
    }

    async fn plan(&self, prompt: &str) -> Result<TaskDag> {
        let planner = Planner::new(Arc::clone(&self.agent));
        let prompt = prompt.to_string();
        let repo_dir = self.config.repo_dir();
        let plan = tokio::task::spawn_blocking(move || planner.plan(&prompt, &repo_dir))
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))??;
        Ok(plan.dag)
    }

    /// Run the scheduler, checkpointing after every task completion.
    async fn execute(
        &self,
        dag: Arc<RwLock<TaskDag>>,
        workspace: Arc<WorkspaceManager>,
        store: &CheckpointStore,
        snapshot: &mut Snapshot,
    ) -> Result<()> {
        let (scheduler, mut events) = Scheduler::new(
            Arc::clone(&dag),
            workspace,
            Arc::clone(&self.agent),
            self.config.max_parallel,
            self.cancel.child_token(),
        );
        let handle = tokio::spawn(async move { scheduler.run().await });

        while let Some(event) = events.recv().await {
            match event {
                SchedulerEvent::TaskSucceeded(id) => {
                    snapshot.dag = dag.read().await.snapshot();
                    if !snapshot.completion_order.contains(&id) {
                        snapshot.completion_order.push(id);
                    }
                    store.save(snapshot)?;
                }
                SchedulerEvent::TaskFailed(id, reason) => {
                    mlog_warn!("Orchestrator: task {} failed: {}", id.short(), reason);
                    snapshot.dag = dag.read().await.snapshot();
                    store.save(snapshot)?;
                }
                SchedulerEvent::TaskStarted(_) | SchedulerEvent::Settled => {}
            }
        }

        let _ = handle.await.map_err(|e| Error::TaskJoin(e.to_string()))??;
        Ok(())
    }

    /// Merge everything completed but not yet integrated, in completion
    /// order.
    async fn integrate(
        &self,
        dag: &TaskDag,
        snapshot: &Snapshot,
    ) -> Result<crate::orchestrate::integrator::IntegrationReport> {
        let changes: Vec<ChangeSet> = snapshot
            .completion_order
            .iter()
            .filter(|id| !snapshot.integrated.contains(id))
            .filter_map(|id| dag.get_task(id).and_then(|t| t.change.clone()))
            .collect();

        let integrator = Integrator::new(Arc::clone(&self.agent), self.config.max_conflict_retries);
        let repo_dir = self.config.repo_dir();
        tokio::task::spawn_blocking(move || integrator.integrate(&repo_dir, &changes))
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }

    /// Run verification with self-healing; a run without a verify
    /// command passes trivially.
    async fn verify(&self, workspace: Arc<WorkspaceManager>) -> Result<u32> {
        let Some(command) = self.config.verify_command.as_deref() else {
            mlog!("Orchestrator: no verify command configured, skipping verification");
            return Ok(0);
        };
        let healer = Healer::new(
            Arc::clone(&self.agent),
            workspace,
            command,
            self.config.max_heal_iterations,
        );
        let report = healer.verify_and_heal(&self.config.repo_dir()).await?;
        Ok(report.iterations_used)
    }

    fn transition(
        &self,
        machine: &mut PhaseMachine,
        store: &CheckpointStore,
        snapshot: &mut Snapshot,
        to: Phase,
        note: Option<&str>,
    ) -> Result<()> {
        machine.transition(to, note.map(String::from))?;
        snapshot.phase = machine.current();
        store.save(snapshot)
    }

    /// Escalate to Failed and persist; best-effort, the original error
    /// is what the caller reports.
    fn fail(
        &self,
        machine: &mut PhaseMachine,
        store: &CheckpointStore,
        snapshot: &mut Snapshot,
        cause: &Error,
    ) {
        mlog_error!("Orchestrator: run failing in {}: {}", machine.current(), cause);
        if let Err(e) = self.transition(
            machine,
            store,
            snapshot,
            Phase::Failed,
            Some(&cause.to_string()),
        ) {
            mlog_warn!("Orchestrator: could not persist failure: {}", e);
        }
    }
}

/// Tasks checkpointed as Running were interrupted mid-flight; their
/// worktrees are stale and their work uncommitted, so they run again.
fn reset_interrupted(dag: &mut TaskDag) {
    let running: Vec<TaskId> = dag
        .all_tasks()
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .map(|t| t.id)
        .collect();
    for id in running {
        if let Some(task) = dag.get_task_mut(&id) {
            mlog_warn!("Resume: task {} was running, rescheduling", id.short());
            task.status = TaskStatus::Pending;
            task.started_at = None;
        }
    }
}

/// Human summary of the checkpoint for a run config, if one exists.
pub fn checkpoint_summary(config: &RunConfig) -> Result<Option<String>> {
    let store = CheckpointStore::new(config.checkpoint_path());
    if !store.exists() {
        return Ok(None);
    }
    Ok(Some(store.load()?.describe()))
}

/// Per-task detail of the checkpoint for a run config, if one exists.
pub fn checkpoint_detail(config: &RunConfig) -> Result<Option<String>> {
    let store = CheckpointStore::new(config.checkpoint_path());
    if !store.exists() {
        return Ok(None);
    }
    Ok(Some(store.load()?.describe_detailed()))
}

/// Delete the checkpoint for a run config.
pub fn clear_checkpoint(config: &RunConfig) -> Result<()> {
    CheckpointStore::new(config.checkpoint_path()).clear()
}
