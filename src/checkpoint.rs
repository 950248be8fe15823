//! Durable run state.
//!
//! One JSON document per workspace captures everything needed to resume
//! a run: the phase, the task graph with statuses, the completion order,
//! and identity fields tying the checkpoint to its prompt and repository.
//! Saves are atomic (write to a temp file, then rename) so a crash mid
//! write never leaves a half-document behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::core::{DagSnapshot, TaskId};
use crate::error::{Error, Result};
use crate::mlog_debug;
use crate::orchestrate::Phase;

/// Bumped when the snapshot layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// Hash a prompt for checkpoint identity, `sha256:<hex>`.
pub fn hash_prompt(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

/// The persisted run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Identity of the prompt this run is executing, `sha256:<hex>`.
    pub prompt_hash: String,
    /// Identity of the target repository (URL or canonical local path).
    pub repo: String,
    pub phase: Phase,
    pub dag: DagSnapshot,
    /// Task ids in the order they finished executing. Integration merges
    /// in this order, so a resumed run integrates deterministically.
    pub completion_order: Vec<TaskId>,
    /// Tasks whose branches have already been merged into the base.
    pub integrated: Vec<TaskId>,
    /// Self-healing iterations consumed so far.
    pub heal_iterations: u32,
}

impl Snapshot {
    pub fn new(prompt_hash: String, repo: String, dag: DagSnapshot) -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION,
            run_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            prompt_hash,
            repo,
            phase: Phase::Init,
            dag,
            completion_order: Vec::new(),
            integrated: Vec::new(),
            heal_iterations: 0,
        }
    }

    /// One-paragraph human summary for `checkpoint-status`.
    pub fn describe(&self) -> String {
        let total = self.dag.tasks.len();
        let succeeded = self
            .dag
            .tasks
            .iter()
            .filter(|t| t.status == crate::core::TaskStatus::Succeeded)
            .count();
        let failed = self
            .dag
            .tasks
            .iter()
            .filter(|t| matches!(t.status, crate::core::TaskStatus::Failed { .. }))
            .count();
        format!(
            "run {} phase={} tasks={} succeeded={} failed={} integrated={} heal_iterations={} updated={}",
            self.run_id,
            self.phase,
            total,
            succeeded,
            failed,
            self.integrated.len(),
            self.heal_iterations,
            self.updated_at.to_rfc3339()
        )
    }

    /// Multi-line detail for `checkpoint-info`: the summary plus one
    /// line per task.
    pub fn describe_detailed(&self) -> String {
        let mut out = self.describe();
        for task in &self.dag.tasks {
            out.push_str(&format!(
                "\n  {}  {:<12} {}",
                task.id.short(),
                task.status.to_string(),
                task.title
            ));
        }
        out
    }
}

/// Reads and writes the checkpoint file for one workspace.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Persist a snapshot atomically, refreshing `updated_at`.
    pub fn save(&self, snapshot: &mut Snapshot) -> Result<()> {
        snapshot.updated_at = Utc::now();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        mlog_debug!(
            "CheckpointStore: saved phase={} to {}",
            snapshot.phase,
            self.path.display()
        );
        Ok(())
    }

    /// Load and schema-validate the snapshot.
    ///
    /// # Errors
    /// Missing file, unparseable JSON, and schema mismatches all surface
    /// as `CheckpointCorruption`; the caller decides whether to start
    /// fresh.
    pub fn load(&self) -> Result<Snapshot> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            Error::CheckpointCorruption(format!(
                "Cannot read checkpoint {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| Error::CheckpointCorruption(format!("Unparseable checkpoint: {}", e)))?;
        if snapshot.version != SCHEMA_VERSION {
            return Err(Error::CheckpointCorruption(format!(
                "Checkpoint schema version {} (expected {})",
                snapshot.version, SCHEMA_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Refuse a snapshot whose identity does not match the current run
    /// inputs. A checkpoint for a different prompt or repository must
    /// never silently resume.
    pub fn validate_identity(
        snapshot: &Snapshot,
        prompt_hash: &str,
        repo: &str,
    ) -> Result<()> {
        if snapshot.prompt_hash != prompt_hash {
            return Err(Error::CheckpointCorruption(
                "Checkpoint belongs to a different prompt".to_string(),
            ));
        }
        if snapshot.repo != repo {
            return Err(Error::CheckpointCorruption(format!(
                "Checkpoint belongs to a different repository ({})",
                snapshot.repo
            )));
        }
        Ok(())
    }

    /// Delete the checkpoint file if present.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            mlog_debug!("CheckpointStore: cleared {}", self.path.display());
        }
        Ok(())
    }
}
