//! Planning phase: turn a natural-language prompt into a task DAG.
//!
//! Two agent round-trips: first a free-text master plan for the whole
//! prompt, then a structured breakdown of that plan into task specs
//! with declared dependencies. The breakdown is validated hard; a plan
//! with unknown dependency ids or a cycle never reaches execution.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::agent::{AgentCapability, ProposalKind, ProposalRequest};
use crate::core::{DependencyKind, Task, TaskDag, TaskId};
use crate::error::{Error, Result};
use crate::patch::extract_json_as;
use crate::{mlog, mlog_debug};

/// One task as the agent describes it. Ids are plan-local labels
/// ("t1", "t2"); real `TaskId`s are minted when the DAG is built.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    pub spec: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Output of a successful planning phase.
#[derive(Debug)]
pub struct Plan {
    /// Free-text strategy the breakdown was derived from.
    pub master_plan: String,
    pub dag: TaskDag,
}

pub struct Planner {
    agent: Arc<dyn AgentCapability>,
}

impl Planner {
    pub fn new(agent: Arc<dyn AgentCapability>) -> Self {
        Self { agent }
    }

    /// Run the full planning phase against the repository at `repo_dir`.
    /// Blocking; callers on the runtime drive this via `spawn_blocking`.
    pub fn plan(&self, prompt: &str, repo_dir: &Path) -> Result<Plan> {
        mlog!("Planner: requesting master plan");
        let master = self.agent.propose(&ProposalRequest::new(
            ProposalKind::MasterPlan,
            master_plan_prompt(prompt),
            repo_dir,
        ))?;
        if master.body.trim().is_empty() {
            return Err(Error::Planning("Agent returned an empty plan".to_string()));
        }

        mlog!("Planner: requesting task breakdown");
        let breakdown = self.agent.propose(&ProposalRequest::new(
            ProposalKind::TaskBreakdown,
            breakdown_prompt(prompt, &master.body),
            repo_dir,
        ))?;

        let specs: Vec<TaskSpec> = extract_json_as(&breakdown.body)
            .map_err(|e| Error::Planning(format!("Unusable task breakdown: {}", e)))?;
        let dag = dag_from_specs(specs)?;
        mlog!(
            "Planner: plan accepted, {} tasks, {} dependencies",
            dag.task_count(),
            dag.dependency_count()
        );
        Ok(Plan {
            master_plan: master.body,
            dag,
        })
    }
}

/// Build and validate the DAG from agent-provided task specs.
///
/// # Errors
/// Rejects empty plans, duplicate ids, dependencies on unknown ids,
/// and any cycle.
pub fn dag_from_specs(specs: Vec<TaskSpec>) -> Result<TaskDag> {
    if specs.is_empty() {
        return Err(Error::Planning("Task breakdown contains no tasks".to_string()));
    }

    let mut dag = TaskDag::new();
    let mut label_to_id: std::collections::HashMap<String, TaskId> = std::collections::HashMap::new();

    for spec in &specs {
        if label_to_id.contains_key(&spec.id) {
            return Err(Error::Planning(format!("Duplicate task id '{}'", spec.id)));
        }
        let task = Task::new(&spec.title, &spec.spec);
        mlog_debug!("Planner: task '{}' -> {}", spec.id, task.id.short());
        label_to_id.insert(spec.id.clone(), task.id);
        dag.add_task(task);
    }

    for spec in &specs {
        let to = label_to_id[&spec.id];
        for dep in &spec.depends_on {
            let from = *label_to_id.get(dep).ok_or_else(|| {
                Error::Planning(format!(
                    "Task '{}' depends on unknown task '{}'",
                    spec.id, dep
                ))
            })?;
            dag.add_dependency(&from, &to, DependencyKind::Planned)
                .map_err(|e| Error::Planning(e.to_string()))?;
        }
    }
    Ok(dag)
}

fn master_plan_prompt(prompt: &str) -> String {
    format!(
        "You are planning work on the repository in the current directory.\n\
         Objective:\n{}\n\n\
         Write a concise implementation strategy: what needs to change, \
         in what order, and which parts are independent of each other. \
         Do not write code yet.",
        prompt
    )
}

fn breakdown_prompt(prompt: &str, master_plan: &str) -> String {
    format!(
        "Objective:\n{}\n\nStrategy:\n{}\n\n\
         Break the strategy into independent tasks. Respond with a JSON array \
         only. Each element: {{\"id\": \"t1\", \"title\": \"...\", \
         \"spec\": \"what the task must produce\", \"depends_on\": [\"t0\"]}}. \
         A task may only depend on tasks listed before it. Keep tasks small \
         and parallelizable.",
        prompt, master_plan
    )
}
