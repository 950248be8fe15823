//! Integration phase: merge completed change sets into the base.
//!
//! Merges happen one at a time, in task completion order, so every run
//! with the same completion order integrates identically. A textual
//! conflict is extracted side-by-side (base, ours, theirs) and handed
//! to the agent for a full-file resolution; resolutions are revalidated
//! for leftover conflict markers and retried a bounded number of times
//! before the run escalates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{build::CheckoutBuilder, Oid, Repository, Signature};

use crate::agent::{AgentCapability, ProposalKind, ProposalRequest};
use crate::core::{ChangeSet, TaskId};
use crate::error::{Error, Result};
use crate::patch::parse_file_blocks;
use crate::{mlog, mlog_debug, mlog_warn};

/// One side-by-side view of a conflicted path.
#[derive(Debug, Clone)]
pub struct ConflictFile {
    pub path: PathBuf,
    /// Content at the merge base, if the file existed there.
    pub base: Option<String>,
    /// Content on the integration branch.
    pub ours: Option<String>,
    /// Content on the task branch being merged.
    pub theirs: Option<String>,
}

/// What integration did, for the run report.
#[derive(Debug, Clone, Default)]
pub struct IntegrationReport {
    /// Tasks merged, in merge order.
    pub merged: Vec<TaskId>,
    /// Conflicted paths and the attempts their resolution took.
    pub resolved_conflicts: Vec<(PathBuf, u32)>,
}

pub struct Integrator {
    agent: Arc<dyn AgentCapability>,
    max_conflict_retries: u32,
}

impl Integrator {
    pub fn new(agent: Arc<dyn AgentCapability>, max_conflict_retries: u32) -> Self {
        Self {
            agent,
            max_conflict_retries: max_conflict_retries.max(1),
        }
    }

    /// Merge every change set into the repository at `repo_dir`,
    /// in the given order. Blocking.
    pub fn integrate(&self, repo_dir: &Path, changes: &[ChangeSet]) -> Result<IntegrationReport> {
        let repo = Repository::open(repo_dir)?;
        let mut report = IntegrationReport::default();

        for change in changes {
            mlog!(
                "Integrator: merging task {} ({})",
                change.task_id.short(),
                change.branch
            );
            self.merge_one(&repo, repo_dir, change, &mut report)?;
            report.merged.push(change.task_id);
        }

        // Bring the working directory up to the integrated tree so
        // verification sees the merged state.
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        Ok(report)
    }

    fn merge_one(
        &self,
        repo: &Repository,
        repo_dir: &Path,
        change: &ChangeSet,
        report: &mut IntegrationReport,
    ) -> Result<()> {
        let ours = repo.head()?.peel_to_commit()?;
        let theirs = repo.find_commit(Oid::from_str(&change.commit)?)?;

        let mut index = repo.merge_commits(&ours, &theirs, None)?;

        if index.has_conflicts() {
            let conflicts = extract_conflicts(repo, &index)?;
            mlog_warn!(
                "Integrator: {} conflicted file(s) merging {}",
                conflicts.len(),
                change.branch
            );
            for conflict in conflicts {
                let (resolution, attempts) = self.resolve_conflict(repo_dir, change, &conflict)?;
                let blob = repo.blob(resolution.as_bytes())?;
                let entry = git2::IndexEntry {
                    ctime: git2::IndexTime::new(0, 0),
                    mtime: git2::IndexTime::new(0, 0),
                    dev: 0,
                    ino: 0,
                    mode: 0o100644,
                    uid: 0,
                    gid: 0,
                    file_size: resolution.len() as u32,
                    id: blob,
                    flags: 0,
                    flags_extended: 0,
                    path: conflict.path.to_string_lossy().into_owned().into_bytes(),
                };
                index.add(&entry)?;
                // The stage-0 entry carries the resolved content, but the
                // conflict stages must be dropped explicitly or the index
                // still reports the path as conflicted.
                index.conflict_remove(&conflict.path)?;
                report
                    .resolved_conflicts
                    .push((conflict.path.clone(), attempts));
            }
        }

        if index.has_conflicts() {
            // All conflicts were replaced above; reaching here means the
            // merge produced a conflict we could not represent.
            return Err(Error::Workspace(
                "Merge index still conflicted after resolution".to_string(),
            ));
        }

        let tree_id = index.write_tree_to(repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Maestro", "maestro@localhost"))?;
        let message = format!("Merge {} ({})", change.branch, change.task_id.short());
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&ours, &theirs])?;
        mlog_debug!("Integrator: merge commit {}", commit_id);
        Ok(())
    }

    /// Ask the agent for a full-file resolution, bounded by
    /// `max_conflict_retries`. Returns the content and attempts used.
    fn resolve_conflict(
        &self,
        repo_dir: &Path,
        change: &ChangeSet,
        conflict: &ConflictFile,
    ) -> Result<(String, u32)> {
        for attempt in 1..=self.max_conflict_retries {
            mlog!(
                "Integrator: resolving {} (attempt {}/{})",
                conflict.path.display(),
                attempt,
                self.max_conflict_retries
            );
            let request = ProposalRequest::new(
                ProposalKind::ResolveConflict,
                resolution_prompt(conflict),
                repo_dir,
            );
            let artifact = match self.agent.propose(&request) {
                Ok(artifact) => artifact,
                Err(e) => {
                    mlog_warn!("Integrator: resolution attempt failed: {}", e);
                    continue;
                }
            };

            if let Some(candidate) = candidate_from_artifact(&artifact.body, &conflict.path) {
                if is_valid_resolution(&candidate) {
                    return Ok((candidate, attempt));
                }
                mlog_warn!(
                    "Integrator: resolution for {} rejected (markers or empty)",
                    conflict.path.display()
                );
            }
        }
        mlog_warn!(
            "Integrator: giving up on {} from {}",
            conflict.path.display(),
            change.branch
        );
        Err(Error::MergeConflictUnresolved {
            path: conflict.path.display().to_string(),
            attempts: self.max_conflict_retries,
        })
    }
}

/// Pull side-by-side contents for every conflicted path in the index.
fn extract_conflicts(repo: &Repository, index: &git2::Index) -> Result<Vec<ConflictFile>> {
    let mut conflicts = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let read = |entry: &Option<git2::IndexEntry>| -> Result<Option<String>> {
            match entry {
                Some(e) => {
                    let blob = repo.find_blob(e.id)?;
                    Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
                }
                None => Ok(None),
            }
        };
        let path_entry = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .ok_or_else(|| Error::Workspace("Conflict with no entries".to_string()))?;
        let path = PathBuf::from(String::from_utf8_lossy(&path_entry.path).into_owned());
        conflicts.push(ConflictFile {
            path,
            base: read(&conflict.ancestor)?,
            ours: read(&conflict.our)?,
            theirs: read(&conflict.their)?,
        });
    }
    // Deterministic resolution order.
    conflicts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(conflicts)
}

/// Prefer a file block matching the conflicted path, fall back to the
/// raw body.
fn candidate_from_artifact(body: &str, path: &Path) -> Option<String> {
    let blocks = parse_file_blocks(body);
    if let Some(block) = blocks.iter().find(|b| b.path == path) {
        return Some(block.content.clone());
    }
    if let Some(block) = blocks.first() {
        return Some(block.content.clone());
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("{}\n", trimmed))
    }
}

fn is_valid_resolution(content: &str) -> bool {
    !content.trim().is_empty()
        && !content
            .lines()
            .any(|l| l.starts_with("<<<<<<<") || l.starts_with("=======") || l.starts_with(">>>>>>>"))
}

fn resolution_prompt(conflict: &ConflictFile) -> String {
    let section = |label: &str, content: &Option<String>| match content {
        Some(c) => format!("--- {} ---\n{}\n", label, c),
        None => format!("--- {} ---\n(file absent)\n", label),
    };
    format!(
        "Two branches changed the same file and the merge conflicts.\n\
         File: {}\n\n{}{}{}\n\
         Produce the merged file combining the intent of both sides. \
         Respond with exactly:\n\
         <<<FILE: {}>>>\n<entire merged file>\n<<<END_FILE>>>",
        conflict.path.display(),
        section("base version", &conflict.base),
        section("integration branch version", &conflict.ours),
        section("task branch version", &conflict.theirs),
        conflict.path.display()
    )
}
