use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{mlog_debug, Error, Result};

/// Default cap on concurrently executing tasks.
pub const DEFAULT_MAX_PARALLEL: usize = 4;
/// Default bound on self-healing iterations.
pub const DEFAULT_MAX_HEAL_ITERATIONS: u32 = 3;
/// Default bound on resolution attempts per merge conflict.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Where the target repository comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum RepoSource {
    /// Clone from a remote URL.
    Url(String),
    /// Copy from a local directory.
    LocalPath(PathBuf),
}

impl std::fmt::Display for RepoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepoSource::Url(url) => write!(f, "{}", url),
            RepoSource::LocalPath(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Per-run configuration for one orchestration attempt.
///
/// The retry/iteration bounds are policy, not architecture, so they are
/// explicit fields here rather than constants at the use sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Path to the natural-language prompt file.
    pub prompt_path: PathBuf,
    /// Where the target repository comes from.
    pub repo: RepoSource,
    /// Directory where the run workspace (repo copy, worktrees, checkpoint) lives.
    pub workspace_dir: PathBuf,
    /// Maximum number of tasks executing concurrently.
    pub max_parallel: usize,
    /// Maximum self-healing iterations during verification.
    pub max_heal_iterations: u32,
    /// Maximum agent resolution attempts per merge conflict.
    pub max_conflict_retries: u32,
    /// Integrate the succeeded subset even if some tasks failed.
    pub continue_on_task_failure: bool,
    /// Resume from an existing checkpoint. When false, an existing
    /// checkpoint is cleared and the run starts fresh.
    pub resume: bool,
    /// Verification command run against the integrated base (e.g. "cargo test").
    pub verify_command: Option<String>,
    /// Agent command line; defaults to the app config's command.
    pub agent_command: Option<String>,
}

impl RunConfig {
    /// Create a run configuration with default policy bounds.
    pub fn new(prompt_path: PathBuf, repo: RepoSource, workspace_dir: PathBuf) -> Self {
        Self {
            prompt_path,
            repo,
            workspace_dir,
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_heal_iterations: DEFAULT_MAX_HEAL_ITERATIONS,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            continue_on_task_failure: false,
            resume: true,
            verify_command: None,
            agent_command: None,
        }
    }

    /// Path of the checkpoint file for this run's workspace.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.workspace_dir.join(".maestro_checkpoint.json")
    }

    /// Path where the target repository is materialized inside the workspace.
    pub fn repo_dir(&self) -> PathBuf {
        self.workspace_dir.join("target_repo")
    }
}

/// Application-level configuration (~/.maestro/maestro.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent command line used when a run does not override it.
    pub command: Option<String>,
    /// Override for the default workspace parent directory.
    pub workspace_dir: Option<String>,
}

impl Config {
    pub fn app_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("maestro.toml"))
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        mlog_debug!(
            "Config loaded: command={:?}, workspace_dir={:?}",
            config.command,
            config.workspace_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let app_dir = Self::app_dir()?;
        if !app_dir.exists() {
            fs::create_dir_all(&app_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
