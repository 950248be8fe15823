use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Agent proposal failed: {0}")]
    AgentProposal(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Task {task} failed: {reason}")]
    Task { task: String, reason: String },

    #[error("Merge conflict on {path} unresolved after {attempts} attempts")]
    MergeConflictUnresolved { path: String, attempts: u32 },

    #[error("Verification failed after {iterations} self-healing iterations")]
    VerificationFailed { iterations: u32 },

    #[error("Checkpoint rejected: {0}")]
    CheckpointCorruption(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Run aborted by operator")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;
