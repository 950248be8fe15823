//! Agent capability seam.
//!
//! The engine never depends on a concrete agent. Every phase that needs
//! generative work (planning, implementation, conflict resolution, fix
//! proposals) goes through [`AgentCapability`]: prompt in, artifact out.
//! `propose` is a blocking call by contract; async callers drive it
//! through `spawn_blocking`.

use crate::error::{Error, Result};
use crate::{mlog_debug, mlog_trace};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Default timeout for one agent invocation (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// What kind of artifact the engine is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalKind {
    /// High-level strategy for the whole prompt.
    MasterPlan,
    /// Structured task breakdown (JSON task specs).
    TaskBreakdown,
    /// Implementation of a single task inside its workspace.
    Implement,
    /// Resolution for one conflicted file during integration.
    ResolveConflict,
    /// Fix proposal for a verification failure.
    Fix,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::MasterPlan => "master_plan",
            ProposalKind::TaskBreakdown => "task_breakdown",
            ProposalKind::Implement => "implement",
            ProposalKind::ResolveConflict => "resolve_conflict",
            ProposalKind::Fix => "fix",
        }
    }
}

impl std::fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One request to the agent: the kind of work, the full prompt, and the
/// directory the agent should treat as its working tree.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub kind: ProposalKind,
    pub prompt: String,
    pub workdir: PathBuf,
}

impl ProposalRequest {
    pub fn new(kind: ProposalKind, prompt: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            workdir: workdir.into(),
        }
    }
}

/// Raw agent output. Interpretation (JSON extraction, file blocks) is
/// the caller's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub body: String,
}

impl Artifact {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// The narrow capability the engine requires from any agent.
pub trait AgentCapability: Send + Sync {
    /// Produce an artifact for the request. Blocking.
    fn propose(&self, request: &ProposalRequest) -> Result<Artifact>;

    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether the agent can currently be invoked.
    fn is_available(&self) -> bool {
        true
    }
}

/// Agent backed by an external command line, e.g. `claude -p`.
///
/// The prompt is appended as the final argument and the child runs with
/// the request's workdir as its current directory. Stdout is the
/// artifact body.
pub struct CommandAgent {
    base_command: Vec<String>,
    timeout: Duration,
}

impl CommandAgent {
    /// Build from a space-separated command line.
    pub fn from_command(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Full argv for a given prompt.
    pub fn command(&self, prompt: &str) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        cmd.push(prompt.to_string());
        cmd
    }

    /// Error unless the binary resolves on PATH.
    pub fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::AgentNotAvailable(self.binary().to_string()))
        }
    }

    fn run(&self, prompt: &str, workdir: &Path) -> Result<(std::process::ExitStatus, String, String)> {
        let argv = self.command(prompt);
        mlog_debug!(
            "CommandAgent: spawning {} ({} args) in {}",
            self.binary(),
            argv.len() - 1,
            workdir.display()
        );

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain pipes on threads so a chatty child cannot deadlock the
        // try_wait loop below on a full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_handle = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });
        let stderr_handle = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout(self.timeout));
            }
            std::thread::sleep(Duration::from_millis(100));
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        Ok((status, stdout, stderr))
    }
}

impl AgentCapability for CommandAgent {
    fn propose(&self, request: &ProposalRequest) -> Result<Artifact> {
        self.ensure_available()?;

        let (status, stdout, stderr) = self.run(&request.prompt, &request.workdir)?;
        mlog_trace!(
            "CommandAgent: {} finished ({}), {} bytes stdout",
            request.kind,
            status,
            stdout.len()
        );

        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                format!("exit code {}", status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::AgentProposal(format!(
                "{} request failed: {}",
                request.kind, detail
            )));
        }

        Ok(Artifact::new(stdout.trim().to_string()))
    }

    fn name(&self) -> &str {
        self.binary()
    }

    fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}
