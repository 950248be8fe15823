//! Task dependency graph.
//!
//! The DAG is the run's plan: nodes are tasks, edges say "this task must
//! succeed before that one starts". Cycle rejection happens at edge
//! insertion so a cyclic plan is refused before any task runs.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Why one task must run before another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DependencyKind {
    /// Declared by the planner in the task plan.
    #[default]
    Planned,
    /// Inferred from overlap or ordering concerns, with a reason.
    Inferred { reason: String },
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Planned => write!(f, "planned"),
            DependencyKind::Inferred { reason } => write!(f, "inferred: {}", reason),
        }
    }
}

/// Serializable form of the DAG for checkpointing.
///
/// petgraph's NodeIndex values are not stable across rebuilds, so the
/// snapshot stores tasks plus (from, to) id pairs and the graph is
/// reconstructed on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSnapshot {
    pub tasks: Vec<Task>,
    pub edges: Vec<(TaskId, TaskId, DependencyKind)>,
}

/// The task dependency graph backing the scheduler.
pub struct TaskDag {
    graph: DiGraph<Task, DependencyKind>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDag {
    /// Create an empty DAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task to the DAG.
    ///
    /// Adding a task with an id already present returns the existing node.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }
        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency edge: `from` must succeed before `to` starts.
    ///
    /// # Errors
    /// Returns a validation error if either task is missing or if the
    /// edge would introduce a cycle. On cycle detection the edge is
    /// removed again and the DAG is left unchanged.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        kind: DependencyKind,
    ) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", from)))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", to)))?;

        let edge = self.graph.add_edge(from_index, to_index, kind);
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(from), self.task_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Tasks the given task depends on (must succeed before it).
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .filter_map(|n| self.graph.node_weight(n))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Tasks that depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .filter_map(|n| self.graph.node_weight(n))
                .collect()
        } else {
            Vec::new()
        }
    }

    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    // ========== Scheduling operations ==========

    /// Tasks eligible to start right now.
    ///
    /// A task is ready when it is still Pending and every dependency has
    /// Succeeded. A task downstream of a failure never becomes ready
    /// because a failed dependency never reaches Succeeded.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if task.status != TaskStatus::Pending {
                    return None;
                }
                let deps_succeeded = self
                    .graph
                    .neighbors_directed(index, petgraph::Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|t| t.status == TaskStatus::Succeeded)
                            .unwrap_or(false)
                    });
                if deps_succeeded {
                    Some(task)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Pending tasks that can never become ready because some transitive
    /// dependency failed.
    pub fn blocked_tasks(&self) -> Vec<&Task> {
        let failed: HashSet<TaskId> = self
            .graph
            .node_weights()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }))
            .map(|t| t.id)
            .collect();

        let mut blocked = HashSet::new();
        for id in &failed {
            self.collect_downstream(id, &mut blocked);
        }

        self.graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Pending && blocked.contains(&t.id))
            .collect()
    }

    fn collect_downstream(&self, id: &TaskId, out: &mut HashSet<TaskId>) {
        for dep in self.dependents_of(id) {
            if out.insert(dep.id) {
                let dep_id = dep.id;
                self.collect_downstream(&dep_id, out);
            }
        }
    }

    /// True when no task can make further progress: every task is either
    /// terminal or blocked behind a failure.
    pub fn is_settled(&self) -> bool {
        let blocked: HashSet<TaskId> = self.blocked_tasks().iter().map(|t| t.id).collect();
        self.graph.node_weights().all(|t| {
            t.status.is_terminal()
                || (t.status == TaskStatus::Pending && blocked.contains(&t.id))
        })
    }

    /// True when every task succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.graph
            .node_weights()
            .all(|t| t.status == TaskStatus::Succeeded)
    }

    /// Tasks that reached Succeeded, in no particular order.
    pub fn succeeded_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .collect()
    }

    /// Tasks that reached Failed.
    pub fn failed_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }))
            .collect()
    }

    /// Tasks in an order where every task follows all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let title = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.title.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", title))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    // ========== Checkpoint support ==========

    /// Capture the DAG as a serializable snapshot.
    pub fn snapshot(&self) -> DagSnapshot {
        let tasks = self.graph.node_weights().cloned().collect();
        let edges = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = self.graph.edge_endpoints(e)?;
                let from = self.graph.node_weight(a)?.id;
                let to = self.graph.node_weight(b)?.id;
                let kind = self.graph.edge_weight(e)?.clone();
                Some((from, to, kind))
            })
            .collect();
        DagSnapshot { tasks, edges }
    }

    /// Rebuild a DAG from a snapshot.
    ///
    /// # Errors
    /// Returns a validation error if an edge references an unknown task
    /// or the snapshot encodes a cycle.
    pub fn from_snapshot(snapshot: DagSnapshot) -> Result<Self> {
        let mut dag = Self::new();
        for task in snapshot.tasks {
            dag.add_task(task);
        }
        for (from, to, kind) in snapshot.edges {
            dag.add_dependency(&from, &to, kind)?;
        }
        Ok(dag)
    }
}

impl Default for TaskDag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDag")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
