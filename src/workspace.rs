//! Workspace management: materializing the target repository and
//! giving every task an isolated git worktree.
//!
//! Tasks never touch the shared base checkout. Each one gets its own
//! branch and worktree seeded from the base HEAD at dispatch time; the
//! integrator later merges the branches back.

use std::fs;
use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, Repository, Signature};

use crate::config::RepoSource;
use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::{mlog_debug, mlog_warn};

/// Materialize the target repository at `dest`.
///
/// A URL source is cloned. A local directory is copied file-by-file;
/// if the copy carries no `.git`, a repository is initialized with a
/// single baseline commit so worktrees and merges have a root to hang
/// off. An already-materialized destination is left alone so resumed
/// runs keep their state.
pub fn setup_repo(source: &RepoSource, dest: &Path) -> Result<()> {
    if dest.exists() {
        mlog_debug!("setup_repo: {} already exists, keeping it", dest.display());
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    match source {
        RepoSource::Url(url) => {
            mlog_debug!("setup_repo: cloning {} into {}", url, dest.display());
            Repository::clone(url, dest)?;
        }
        RepoSource::LocalPath(src) => {
            if !src.is_dir() {
                return Err(Error::Workspace(format!(
                    "Local repo source is not a directory: {}",
                    src.display()
                )));
            }
            mlog_debug!(
                "setup_repo: copying {} into {}",
                src.display(),
                dest.display()
            );
            copy_dir_recursive(src, dest)?;
            if !dest.join(".git").exists() {
                mlog_debug!("setup_repo: no .git in copy, initializing repository");
                Repository::init(dest)?;
                let manager = WorkspaceManager::new(dest)?;
                manager.commit_all(dest, "Baseline import")?;
            }
        }
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Git plumbing over the base repository: worktrees, commits, branches.
pub struct WorkspaceManager {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(repo_path: &Path) -> Result<Self> {
        mlog_debug!("WorkspaceManager::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        let worktrees_dir = repo_path
            .parent()
            .unwrap_or(repo_path)
            .join("worktrees");
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            worktrees_dir,
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Branch name used for a task's work.
    pub fn task_branch(id: &TaskId) -> String {
        format!("maestro/task-{}", id.short())
    }

    /// Create an isolated worktree for a task, branched from the base
    /// repository's current HEAD. Returns the worktree path.
    pub fn create_task_workspace(&self, id: &TaskId) -> Result<PathBuf> {
        let branch = Self::task_branch(id);
        let worktree_name = format!("task-{}", id.short());
        let worktree_path = self.worktrees_dir.join(&worktree_name);
        mlog_debug!(
            "create_task_workspace: branch={} path={}",
            branch,
            worktree_path.display()
        );
        fs::create_dir_all(&self.worktrees_dir)?;

        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        let branch_obj = repo.branch(&branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Worktree names cannot contain slashes, so use the folder name.
        repo.worktree(&worktree_name, &worktree_path, Some(&opts))?;
        Ok(worktree_path)
    }

    /// Remove a task's worktree and its admin directory.
    ///
    /// The admin directory under `.git/worktrees/` must go too, or git
    /// keeps treating the branch as checked out and later merges fail.
    pub fn remove_task_workspace(&self, id: &TaskId) -> Result<()> {
        let worktree_name = format!("task-{}", id.short());
        let worktree_path = self.worktrees_dir.join(&worktree_name);
        mlog_debug!("remove_task_workspace: path={}", worktree_path.display());

        let repo = self.repo()?;
        if let Ok(worktree) = repo.find_worktree(&worktree_name) {
            let _ = worktree.unlock();
            if let Err(e) = worktree.prune(Some(
                git2::WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            )) {
                mlog_warn!("Worktree prune failed for '{}': {}", worktree_name, e);
            }
        }

        if worktree_path.exists() {
            fs::remove_dir_all(&worktree_path)?;
        }
        let admin_dir = repo.path().join("worktrees").join(&worktree_name);
        if admin_dir.exists() {
            let _ = fs::remove_dir_all(&admin_dir);
        }
        Ok(())
    }

    /// Path where a task's worktree lives (whether or not it exists).
    pub fn task_workspace_path(&self, id: &TaskId) -> PathBuf {
        self.worktrees_dir.join(format!("task-{}", id.short()))
    }

    /// Stage everything in a working tree and commit. Returns the new
    /// commit id, or the current HEAD if there was nothing to commit.
    pub fn commit_all(&self, workdir: &Path, message: &str) -> Result<String> {
        mlog_debug!(
            "commit_all: path={} message={}",
            workdir.display(),
            message
        );
        let repo = Repository::open(workdir)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        // Nothing staged beyond the parent tree means nothing to commit.
        if let Some(ref parent) = parent {
            if parent.tree_id() == tree_id {
                mlog_debug!("commit_all: tree unchanged, skipping empty commit");
                return Ok(parent.id().to_string());
            }
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Maestro", "maestro@localhost"))?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        mlog_debug!("commit_all: created {}", commit_id);
        Ok(commit_id.to_string())
    }

    /// Commit id of the base repository's HEAD.
    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let found = match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(found)
    }

    /// Delete a task branch. Missing branches are fine; other failures
    /// are logged and swallowed since the worktree is already gone.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    mlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => mlog_warn!("Error looking up branch '{}': {}", branch, e),
        }
        Ok(())
    }
}
