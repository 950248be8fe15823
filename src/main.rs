use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use maestro::agent::CommandAgent;
use maestro::config::{Config, RepoSource, RunConfig};
use maestro::orchestrate::{checkpoint_detail, checkpoint_summary, clear_checkpoint, Orchestrator};
use maestro::{log, mlog, Result};

#[derive(Parser)]
#[command(name = "maestro", about = "Autonomous multi-phase task orchestrator", version)]
struct Cli {
    /// Enable debug logging (maestro.log in the run workspace)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start or resume a run
    Start {
        /// Path to the prompt file describing the objective
        #[arg(long)]
        prompt: PathBuf,

        /// Clone the target repository from this URL
        #[arg(long, conflicts_with = "repo_path")]
        repo_url: Option<String>,

        /// Copy the target repository from this local directory
        #[arg(long)]
        repo_path: Option<PathBuf>,

        /// Directory holding the run workspace (repo copy, worktrees, checkpoint)
        #[arg(long, default_value = ".maestro-workspace")]
        workspace: PathBuf,

        /// Maximum tasks executing concurrently
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Maximum self-healing iterations during verification
        #[arg(long)]
        max_heal_iterations: Option<u32>,

        /// Maximum agent attempts per merge conflict
        #[arg(long)]
        max_conflict_retries: Option<u32>,

        /// Integrate the succeeded subset even if some tasks failed
        #[arg(long)]
        continue_on_failure: bool,

        /// Clear any existing checkpoint instead of resuming it
        #[arg(long)]
        fresh: bool,

        /// Verification command to run against the integrated result
        #[arg(long)]
        verify: Option<String>,

        /// Agent command line (overrides the config file)
        #[arg(long)]
        agent: Option<String>,
    },
    /// Show the checkpoint for a workspace
    CheckpointStatus {
        #[arg(long, default_value = ".maestro-workspace")]
        workspace: PathBuf,
    },
    /// Show the checkpoint with per-task detail
    CheckpointInfo {
        #[arg(long, default_value = ".maestro-workspace")]
        workspace: PathBuf,
    },
    /// Delete the checkpoint for a workspace
    CheckpointClear {
        #[arg(long, default_value = ".maestro-workspace")]
        workspace: PathBuf,
    },
}

/// Minimal run config for checkpoint subcommands; only the workspace
/// path matters there.
fn workspace_config(workspace: PathBuf) -> RunConfig {
    RunConfig::new(
        PathBuf::new(),
        RepoSource::LocalPath(PathBuf::new()),
        workspace,
    )
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Start {
            prompt,
            repo_url,
            repo_path,
            workspace,
            max_parallel,
            max_heal_iterations,
            max_conflict_retries,
            continue_on_failure,
            fresh,
            verify,
            agent,
        } => {
            let repo = match (repo_url, repo_path) {
                (Some(url), None) => RepoSource::Url(url),
                (None, Some(path)) => RepoSource::LocalPath(path),
                _ => {
                    return Err(maestro::Error::Validation(
                        "Exactly one of --repo-url or --repo-path is required".to_string(),
                    ))
                }
            };

            let mut config = RunConfig::new(prompt, repo, workspace);
            if let Some(n) = max_parallel {
                config.max_parallel = n;
            }
            if let Some(n) = max_heal_iterations {
                config.max_heal_iterations = n;
            }
            if let Some(n) = max_conflict_retries {
                config.max_conflict_retries = n;
            }
            config.continue_on_task_failure = continue_on_failure;
            config.resume = !fresh;
            config.verify_command = verify;
            config.agent_command = agent;
            log::attach_to_workspace(&config.workspace_dir);

            let app_config = Config::load()?;
            let agent_command = config
                .agent_command
                .clone()
                .unwrap_or_else(|| app_config.effective_command().to_string());
            let agent = Arc::new(CommandAgent::from_command(&agent_command));
            agent.ensure_available()?;
            mlog!("maestro start: agent={} repo={}", agent_command, config.repo);

            let orchestrator = Orchestrator::new(config, agent);
            let cancel = orchestrator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupt received, aborting run (checkpoint is preserved)");
                    cancel.cancel();
                }
            });

            let report = orchestrator.run().await?;
            println!(
                "Run {} finished: {} of {} tasks merged, {} conflict(s) resolved, {} heal iteration(s)",
                report.run_id,
                report.merged.len(),
                report.tasks_total,
                report.resolved_conflicts.len(),
                report.heal_iterations
            );
            println!("Final commit: {}", report.final_commit);
        }
        Command::CheckpointStatus { workspace } => {
            match checkpoint_summary(&workspace_config(workspace))? {
                Some(summary) => println!("{}", summary),
                None => println!("No checkpoint"),
            }
        }
        Command::CheckpointInfo { workspace } => {
            match checkpoint_detail(&workspace_config(workspace))? {
                Some(detail) => println!("{}", detail),
                None => println!("No checkpoint"),
            }
        }
        Command::CheckpointClear { workspace } => {
            clear_checkpoint(&workspace_config(workspace))?;
            println!("Checkpoint cleared");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    log::init(cli.debug);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
