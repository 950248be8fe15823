//! Verification phase with bounded self-healing.
//!
//! The verify command (tests, lints, whatever the run configured) runs
//! against the integrated base. On failure the combined output is fed
//! to the agent as a fix request, the proposed files are applied and
//! committed, and verification reruns. The loop is hard-bounded; when
//! the budget is spent the run escalates instead of thrashing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::agent::{AgentCapability, ProposalKind, ProposalRequest};
use crate::error::{Error, Result};
use crate::patch::apply_file_blocks;
use crate::workspace::WorkspaceManager;
use crate::{mlog, mlog_debug, mlog_warn};

/// Default timeout for one verify command run (30 minutes).
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 1800;

/// How much failure output is quoted back to the agent.
const FAILURE_EXCERPT_BYTES: usize = 8000;

/// Result of one verify command run.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Execute a verify command in `workdir`. Exit status is data; only
/// spawn failures and timeouts are errors.
pub async fn run_verify(command: &str, workdir: &Path, timeout: Duration) -> Result<VerifyOutcome> {
    let argv: Vec<&str> = command.split_whitespace().collect();
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Validation("Verify command is empty".to_string()));
    };
    mlog_debug!("run_verify: {} in {}", command, workdir.display());

    let output = tokio::time::timeout(
        timeout,
        Command::new(program)
            .args(args)
            .current_dir(workdir)
            .output(),
    )
    .await
    .map_err(|_| Error::Timeout(timeout))??;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(VerifyOutcome {
        passed: output.status.success(),
        exit_code: output.status.code(),
        output: combined,
    })
}

/// One self-healing iteration, for the audit trail.
#[derive(Debug, Clone)]
pub struct HealAttempt {
    pub iteration: u32,
    /// Tail of the verify output that drove the fix request.
    pub failure_excerpt: String,
    pub files_changed: Vec<PathBuf>,
    pub commit: String,
}

/// What verification did.
#[derive(Debug, Clone)]
pub struct HealReport {
    pub passed: bool,
    pub iterations_used: u32,
    pub attempts: Vec<HealAttempt>,
}

pub struct Healer {
    agent: Arc<dyn AgentCapability>,
    workspace: Arc<WorkspaceManager>,
    verify_command: String,
    max_iterations: u32,
    verify_timeout: Duration,
}

impl Healer {
    pub fn new(
        agent: Arc<dyn AgentCapability>,
        workspace: Arc<WorkspaceManager>,
        verify_command: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            agent,
            workspace,
            verify_command: verify_command.into(),
            max_iterations,
            verify_timeout: Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
        }
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    /// Verify the repository, healing failures until the command passes
    /// or the iteration budget runs out.
    ///
    /// # Errors
    /// `VerificationFailed` once `max_iterations` fixes have been applied
    /// and the command still fails.
    pub async fn verify_and_heal(&self, repo_dir: &Path) -> Result<HealReport> {
        let mut attempts = Vec::new();

        for iteration in 0..=self.max_iterations {
            mlog!(
                "Healer: running verify command (iteration {}/{})",
                iteration,
                self.max_iterations
            );
            let outcome = run_verify(&self.verify_command, repo_dir, self.verify_timeout).await?;
            if outcome.passed {
                mlog!("Healer: verification passed after {} fix(es)", attempts.len());
                return Ok(HealReport {
                    passed: true,
                    iterations_used: iteration,
                    attempts,
                });
            }
            if iteration == self.max_iterations {
                break;
            }

            let excerpt = tail(&outcome.output, FAILURE_EXCERPT_BYTES);
            mlog_warn!(
                "Healer: verify failed (exit {:?}), requesting fix {}",
                outcome.exit_code,
                iteration + 1
            );

            let agent = Arc::clone(&self.agent);
            let prompt = fix_prompt(&self.verify_command, &excerpt);
            let workdir = repo_dir.to_path_buf();
            let artifact = tokio::task::spawn_blocking(move || {
                agent.propose(&ProposalRequest::new(ProposalKind::Fix, prompt, workdir))
            })
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))??;

            let files_changed = apply_file_blocks(repo_dir, &artifact.body)?;
            let commit = self.workspace.commit_all(
                repo_dir,
                &format!("maestro: verification fix {}", iteration + 1),
            )?;
            attempts.push(HealAttempt {
                iteration: iteration + 1,
                failure_excerpt: excerpt,
                files_changed,
                commit,
            });
        }

        Err(Error::VerificationFailed {
            iterations: self.max_iterations,
        })
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn fix_prompt(verify_command: &str, failure_excerpt: &str) -> String {
    format!(
        "Verification failed in the repository in the current directory.\n\
         Command: {}\n\nOutput (tail):\n{}\n\n\
         Diagnose the failure and fix it. Emit each changed file as a block:\n\
         <<<FILE: relative/path>>>\n<entire file contents>\n<<<END_FILE>>>",
        verify_command, failure_excerpt
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Artifact;
    use git2::Repository;
    use std::fs;
    use tempfile::TempDir;

    struct FixWritesFile {
        path: String,
    }

    impl AgentCapability for FixWritesFile {
        fn propose(&self, request: &ProposalRequest) -> Result<Artifact> {
            assert_eq!(request.kind, ProposalKind::Fix);
            Ok(Artifact::new(format!(
                "<<<FILE: {}>>>\nfixed\n<<<END_FILE>>>",
                self.path
            )))
        }

        fn name(&self) -> &str {
            "fixer"
        }
    }

    fn setup_repo(dir: &Path) -> (PathBuf, Arc<WorkspaceManager>) {
        let repo_dir = dir.join("target_repo");
        fs::create_dir_all(&repo_dir).unwrap();
        Repository::init(&repo_dir).unwrap();
        let manager = WorkspaceManager::new(&repo_dir).unwrap();
        fs::write(repo_dir.join("README.md"), "# repo\n").unwrap();
        manager.commit_all(&repo_dir, "init").unwrap();
        (repo_dir, Arc::new(manager))
    }

    #[tokio::test]
    async fn test_run_verify_pass_and_fail() {
        let dir = TempDir::new().unwrap();
        let pass = run_verify("true", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(pass.passed);

        let fail = run_verify("false", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!fail.passed);
        assert_eq!(fail.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_run_verify_captures_output() {
        let dir = TempDir::new().unwrap();
        let outcome = run_verify("echo hello", dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.output.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_verify_missing_binary_errors() {
        let dir = TempDir::new().unwrap();
        let result = run_verify(
            "definitely-not-a-real-binary-xyz",
            dir.path(),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_verify_empty_command_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(run_verify("  ", dir.path(), Duration::from_secs(5))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_heal_passes_immediately_without_agent() {
        struct NeverCalled;
        impl AgentCapability for NeverCalled {
            fn propose(&self, _request: &ProposalRequest) -> Result<Artifact> {
                panic!("agent must not be consulted when verification passes");
            }
            fn name(&self) -> &str {
                "never"
            }
        }

        let dir = TempDir::new().unwrap();
        let (repo_dir, workspace) = setup_repo(dir.path());
        let healer = Healer::new(Arc::new(NeverCalled), workspace, "true", 3);

        let report = healer.verify_and_heal(&repo_dir).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.iterations_used, 0);
        assert!(report.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_heal_fix_once_then_passes() {
        let dir = TempDir::new().unwrap();
        let (repo_dir, workspace) = setup_repo(dir.path());
        // Fails until fixed.txt exists; the fake fix writes it.
        fs::write(repo_dir.join("check.sh"), "test -f fixed.txt\n").unwrap();
        workspace.commit_all(&repo_dir, "add check").unwrap();

        let healer = Healer::new(
            Arc::new(FixWritesFile {
                path: "fixed.txt".to_string(),
            }),
            Arc::clone(&workspace),
            "sh check.sh",
            3,
        );

        let report = healer.verify_and_heal(&repo_dir).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.iterations_used, 1);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(
            report.attempts[0].files_changed,
            vec![PathBuf::from("fixed.txt")]
        );
        // The fix was committed to the integrated base.
        assert_eq!(report.attempts[0].commit.len(), 40);
        assert!(repo_dir.join("fixed.txt").exists());
    }

    #[tokio::test]
    async fn test_heal_budget_exhausted_escalates() {
        let dir = TempDir::new().unwrap();
        let (repo_dir, workspace) = setup_repo(dir.path());

        let healer = Healer::new(
            Arc::new(FixWritesFile {
                path: "useless.txt".to_string(),
            }),
            workspace,
            "false",
            2,
        );

        let err = healer.verify_and_heal(&repo_dir).await.unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { iterations: 2 }));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "αβγδε";
        let tailed = tail(text, 3);
        assert!(text.ends_with(&tailed));
        assert!(tailed.len() <= 3);
    }
}
