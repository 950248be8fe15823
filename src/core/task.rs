//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of planned work. Each task tracks its
//! lifecycle status and the change set it produced; dependencies
//! between tasks live as edges in the DAG.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task within a run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task planned but not yet started.
    #[default]
    Pending,
    /// Task is currently executing in its workspace.
    Running,
    /// Task completed and produced a change set.
    Succeeded,
    /// Task failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
}

impl TaskStatus {
    /// Check if this status is terminal (Succeeded or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed { .. })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// The output of a completed task: a branch + commit relative to the base
/// the task's workspace was seeded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// The task that produced this change set.
    pub task_id: TaskId,
    /// Branch holding the task's commits.
    pub branch: String,
    /// The commit hash of the task's work.
    pub commit: String,
}

impl ChangeSet {
    /// Create a new change set record.
    pub fn new(task_id: TaskId, branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            task_id,
            branch: branch.into(),
            commit: commit.into(),
        }
    }
}

/// A single unit of planned work in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable title for the task.
    pub title: String,
    /// Specification of what the task should produce.
    pub spec: String,
    /// Current execution status.
    pub status: TaskStatus,
    /// Change set produced by the task, once succeeded.
    pub change: Option<ChangeSet>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task with the given title and specification.
    pub fn new(title: &str, spec: &str) -> Self {
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            spec: spec.to_string(),
            status: TaskStatus::Pending,
            change: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Start the task execution.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as succeeded with its change set.
    pub fn succeed(&mut self, change: ChangeSet) {
        self.status = TaskStatus::Succeeded;
        self.change = Some(change);
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
