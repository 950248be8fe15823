//! Shared fixtures: a disposable source repository and a deterministic
//! scripted agent covering every proposal kind.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use maestro::agent::{AgentCapability, Artifact, ProposalKind, ProposalRequest};
use maestro::config::{RepoSource, RunConfig};
use maestro::error::{Error, Result};

/// A temp workspace with a source project to orchestrate against.
pub struct TestRun {
    pub dir: TempDir,
    pub prompt_path: PathBuf,
    pub source_dir: PathBuf,
    pub workspace_dir: PathBuf,
}

impl TestRun {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let source_dir = dir.path().join("source");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(source_dir.join("README.md"), "# project\n").unwrap();
        fs::write(source_dir.join("shared.txt"), "line1\nline2\nline3\n").unwrap();

        let prompt_path = dir.path().join("prompt.md");
        fs::write(&prompt_path, "Build the feature.\n").unwrap();

        let workspace_dir = dir.path().join("workspace");
        Self {
            dir,
            prompt_path,
            source_dir,
            workspace_dir,
        }
    }

    pub fn config(&self) -> RunConfig {
        RunConfig::new(
            self.prompt_path.clone(),
            RepoSource::LocalPath(self.source_dir.clone()),
            self.workspace_dir.clone(),
        )
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.workspace_dir.join("target_repo")
    }
}

/// Build a task breakdown artifact for the planner: ids double as
/// titles, dependencies by id.
pub fn breakdown(tasks: &[(&str, &[&str])]) -> String {
    let items: Vec<String> = tasks
        .iter()
        .map(|(id, deps)| {
            let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
            format!(
                "{{\"id\": \"{id}\", \"title\": \"{id}\", \"spec\": \"implement {id}\", \"depends_on\": [{}]}}",
                deps.join(", ")
            )
        })
        .collect();
    format!("```json\n[{}]\n```", items.join(",\n"))
}

/// Deterministic agent: every proposal kind scripted up front.
pub struct ScriptedAgent {
    /// Task breakdown artifact returned during planning.
    pub breakdown: String,
    /// Per-title implementation output: title -> (path, content).
    /// Titles not listed write `<title>.txt`.
    pub impl_outputs: HashMap<String, (String, String)>,
    /// Titles whose implementation fails.
    pub fail_titles: HashSet<String>,
    /// Full-file content returned for any conflict resolution.
    pub resolution: String,
    /// File written by fix proposals: (path, content).
    pub fix: Option<(String, String)>,
}

impl ScriptedAgent {
    pub fn new(breakdown: String) -> Self {
        Self {
            breakdown,
            impl_outputs: HashMap::new(),
            fail_titles: HashSet::new(),
            resolution: "resolved\n".to_string(),
            fix: None,
        }
    }

    pub fn with_impl(mut self, title: &str, path: &str, content: &str) -> Self {
        self.impl_outputs
            .insert(title.to_string(), (path.to_string(), content.to_string()));
        self
    }

    pub fn failing(mut self, title: &str) -> Self {
        self.fail_titles.insert(title.to_string());
        self
    }

    pub fn with_resolution(mut self, content: &str) -> Self {
        self.resolution = content.to_string();
        self
    }

    pub fn with_fix(mut self, path: &str, content: &str) -> Self {
        self.fix = Some((path.to_string(), content.to_string()));
        self
    }

    fn prompt_field<'a>(prompt: &'a str, label: &str) -> &'a str {
        prompt
            .lines()
            .find(|l| l.starts_with(label))
            .map(|l| l.trim_start_matches(label).trim())
            .unwrap_or("")
    }
}

impl AgentCapability for ScriptedAgent {
    fn propose(&self, request: &ProposalRequest) -> Result<Artifact> {
        match request.kind {
            ProposalKind::MasterPlan => Ok(Artifact::new("Do the tasks in order.")),
            ProposalKind::TaskBreakdown => Ok(Artifact::new(self.breakdown.clone())),
            ProposalKind::Implement => {
                let title = Self::prompt_field(&request.prompt, "Task: ").to_string();
                if self.fail_titles.contains(&title) {
                    return Err(Error::AgentProposal(format!(
                        "scripted failure for '{}'",
                        title
                    )));
                }
                let (path, content) = self
                    .impl_outputs
                    .get(&title)
                    .cloned()
                    .unwrap_or_else(|| (format!("{}.txt", title), format!("{}\n", title)));
                Ok(Artifact::new(format!(
                    "<<<FILE: {}>>>\n{}<<<END_FILE>>>",
                    path, content
                )))
            }
            ProposalKind::ResolveConflict => {
                let path = Self::prompt_field(&request.prompt, "File: ");
                Ok(Artifact::new(format!(
                    "<<<FILE: {}>>>\n{}<<<END_FILE>>>",
                    path, self.resolution
                )))
            }
            ProposalKind::Fix => match &self.fix {
                Some((path, content)) => Ok(Artifact::new(format!(
                    "<<<FILE: {}>>>\n{}<<<END_FILE>>>",
                    path, content
                ))),
                None => Err(Error::AgentProposal("no fix scripted".to_string())),
            },
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
