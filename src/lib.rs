//! maestro: autonomous multi-phase task orchestration.
//!
//! Takes a natural-language prompt and a target repository, plans the
//! work into a dependency DAG, executes tasks in parallel isolated
//! worktrees, integrates the change sets with agent-assisted conflict
//! resolution, and verifies the result with bounded self-healing.
//! Every step is checkpointed so an interrupted run resumes where it
//! stopped.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestrate;
pub mod patch;
pub mod workspace;

pub use agent::{AgentCapability, Artifact, CommandAgent, ProposalKind, ProposalRequest};
pub use checkpoint::{CheckpointStore, Snapshot};
pub use config::{Config, RepoSource, RunConfig};
pub use core::{ChangeSet, Task, TaskDag, TaskId, TaskStatus};
pub use error::{Error, Result};
pub use orchestrate::{Orchestrator, Phase, RunReport};
