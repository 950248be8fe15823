//! Execution phase: parallel task dispatch over the DAG.
//!
//! The scheduler repeatedly takes the ready frontier, seeds one worktree
//! per task from the base repository's current HEAD, and runs the agent
//! in each worktree on blocking threads, capped at `max_parallel`.
//! Task failure is data, not a scheduler error: the task is marked
//! Failed, its dependents stay blocked, and independent tasks keep
//! running. The scheduler finishes when the DAG is settled.
//!
//! Every state change is emitted as a [`SchedulerEvent`] so the
//! orchestrator can checkpoint after each completion.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentCapability, ProposalKind, ProposalRequest};
use crate::core::{ChangeSet, TaskDag, TaskId};
use crate::error::{Error, Result};
use crate::patch::apply_file_blocks;
use crate::workspace::WorkspaceManager;
use crate::{mlog, mlog_debug, mlog_warn};

/// Progress notifications emitted while the scheduler runs.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskStarted(TaskId),
    TaskSucceeded(TaskId),
    TaskFailed(TaskId, String),
    /// No task can make further progress; execution is over.
    Settled,
}

pub struct Scheduler {
    dag: Arc<RwLock<TaskDag>>,
    workspace: Arc<WorkspaceManager>,
    agent: Arc<dyn AgentCapability>,
    max_parallel: usize,
    cancel: CancellationToken,
    events: mpsc::Sender<SchedulerEvent>,
}

impl Scheduler {
    /// Build a scheduler and the receiving end of its event stream.
    pub fn new(
        dag: Arc<RwLock<TaskDag>>,
        workspace: Arc<WorkspaceManager>,
        agent: Arc<dyn AgentCapability>,
        max_parallel: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                dag,
                workspace,
                agent,
                max_parallel: max_parallel.max(1),
                cancel,
                events: tx,
            },
            rx,
        )
    }

    /// Run execution to settlement. Returns the ids of succeeded tasks
    /// in completion order; integration merges in exactly this order.
    pub async fn run(&self) -> Result<Vec<TaskId>> {
        let mut in_flight: JoinSet<(TaskId, Result<ChangeSet>)> = JoinSet::new();
        let mut completion_order: Vec<TaskId> = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                mlog_warn!("Scheduler: cancelled, abandoning {} in-flight tasks", in_flight.len());
                in_flight.shutdown().await;
                return Err(Error::Aborted);
            }

            self.dispatch_ready(&mut in_flight).await?;

            if in_flight.is_empty() {
                let settled = self.dag.read().await.is_settled();
                if settled {
                    break;
                }
                // Nothing running and nothing ready yet not settled
                // would mean the DAG invariants are broken.
                return Err(Error::Validation(
                    "Scheduler stalled with unfinished tasks".to_string(),
                ));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => continue,
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (id, outcome) = joined
                        .map_err(|e| Error::TaskJoin(e.to_string()))?;
                    self.settle_task(id, outcome, &mut completion_order).await?;
                }
            }
        }

        mlog!(
            "Scheduler: settled, {} succeeded of {}",
            completion_order.len(),
            self.dag.read().await.task_count()
        );
        let _ = self.events.send(SchedulerEvent::Settled).await;
        Ok(completion_order)
    }

    /// Start every ready task up to the parallelism cap.
    ///
    /// Worktrees are created here, sequentially, so each is seeded from
    /// the base HEAD without concurrent ref writes. Dispatch order is
    /// stable (creation time, then id) so equal runs dispatch equally.
    async fn dispatch_ready(
        &self,
        in_flight: &mut JoinSet<(TaskId, Result<ChangeSet>)>,
    ) -> Result<()> {
        let ready: Vec<(TaskId, String, String)> = {
            let dag = self.dag.read().await;
            let mut ready: Vec<_> = dag.ready_tasks();
            ready.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.0.cmp(&b.id.0))
            });
            ready
                .into_iter()
                .map(|t| (t.id, t.title.clone(), t.spec.clone()))
                .collect()
        };

        for (id, title, spec) in ready {
            if in_flight.len() >= self.max_parallel {
                break;
            }

            let worktree = match self.workspace.create_task_workspace(&id) {
                Ok(path) => path,
                Err(e) => {
                    let reason = format!("Workspace setup failed: {}", e);
                    if let Some(task) = self.dag.write().await.get_task_mut(&id) {
                        task.start();
                        task.fail(&reason);
                    }
                    let _ = self.events.send(SchedulerEvent::TaskFailed(id, reason)).await;
                    continue;
                }
            };
            let seed = self.workspace.head_commit()?;

            if let Some(task) = self.dag.write().await.get_task_mut(&id) {
                task.start();
            }
            let _ = self.events.send(SchedulerEvent::TaskStarted(id)).await;
            mlog!("Scheduler: started '{}' ({})", title, id.short());

            let agent = Arc::clone(&self.agent);
            let workspace = Arc::clone(&self.workspace);
            in_flight.spawn_blocking(move || {
                let outcome = execute_task(&*agent, &workspace, id, &title, &spec, &worktree, &seed);
                (id, outcome)
            });
        }
        Ok(())
    }

    /// Record a finished task and clean up its workspace on success.
    /// Failed tasks keep their worktree for inspection.
    async fn settle_task(
        &self,
        id: TaskId,
        outcome: Result<ChangeSet>,
        completion_order: &mut Vec<TaskId>,
    ) -> Result<()> {
        match outcome {
            Ok(change) => {
                mlog!("Scheduler: '{}' succeeded at {}", id.short(), &change.commit[..7.min(change.commit.len())]);
                if let Some(task) = self.dag.write().await.get_task_mut(&id) {
                    task.succeed(change);
                }
                if let Err(e) = self.workspace.remove_task_workspace(&id) {
                    mlog_warn!("Scheduler: worktree cleanup failed for {}: {}", id.short(), e);
                }
                completion_order.push(id);
                let _ = self.events.send(SchedulerEvent::TaskSucceeded(id)).await;
            }
            Err(e) => {
                let reason = e.to_string();
                mlog_warn!("Scheduler: '{}' failed: {}", id.short(), reason);
                if let Some(task) = self.dag.write().await.get_task_mut(&id) {
                    task.fail(&reason);
                }
                let _ = self.events.send(SchedulerEvent::TaskFailed(id, reason)).await;
            }
        }
        Ok(())
    }
}

/// Run one task to completion inside its worktree. Blocking.
fn execute_task(
    agent: &dyn AgentCapability,
    workspace: &WorkspaceManager,
    id: TaskId,
    title: &str,
    spec: &str,
    worktree: &std::path::Path,
    seed_commit: &str,
) -> Result<ChangeSet> {
    let request = ProposalRequest::new(
        ProposalKind::Implement,
        implement_prompt(title, spec),
        worktree,
    );
    let artifact = agent.propose(&request)?;

    // File-block artifacts are applied by us; agents that edit the
    // worktree directly leave it dirty instead. Either way the commit
    // below captures the change set.
    let written = apply_file_blocks(worktree, &artifact.body)?;
    mlog_debug!(
        "execute_task {}: {} file blocks applied",
        id.short(),
        written.len()
    );

    let branch = WorkspaceManager::task_branch(&id);
    let commit = workspace.commit_all(worktree, &format!("maestro: {}", title))?;
    if commit == seed_commit {
        return Err(Error::Task {
            task: title.to_string(),
            reason: "Agent produced no usable change set".to_string(),
        });
    }
    Ok(ChangeSet::new(id, branch, commit))
}

fn implement_prompt(title: &str, spec: &str) -> String {
    format!(
        "You are implementing one task in the repository in the current directory.\n\
         Task: {}\n\
         Specification:\n{}\n\n\
         Make the required changes. If you cannot edit files directly, emit each \
         changed file as a block:\n\
         <<<FILE: relative/path>>>\n<entire file contents>\n<<<END_FILE>>>",
        title, spec
    )
}
