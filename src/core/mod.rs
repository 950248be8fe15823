//! Core data structures: tasks and the dependency graph.

pub mod dag;
pub mod task;

pub use dag::{DagSnapshot, DependencyKind, TaskDag};
pub use task::{ChangeSet, Task, TaskId, TaskStatus};
