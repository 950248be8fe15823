//! Run phase state machine.
//!
//! Every run moves through a fixed set of phases. Transitions are
//! validated so the engine can never, say, integrate before executing;
//! each accepted transition is recorded with a timestamp for the audit
//! trail and the checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mlog;

/// Phase of an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Workspace and repository setup.
    #[default]
    Init,
    /// Agent-driven plan and task breakdown.
    Planning,
    /// Parallel task execution in isolated workspaces.
    Execution,
    /// Sequential merge of completed change sets.
    Integration,
    /// Verification with bounded self-healing.
    Verification,
    /// Run finished successfully.
    Done,
    /// Run finished with an unrecoverable failure.
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Planning => "planning",
            Phase::Execution => "execution",
            Phase::Integration => "integration",
            Phase::Verification => "verification",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }

    /// Terminal phases accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Whether moving from `self` to `to` is a legal transition.
    ///
    /// Any non-terminal phase may escalate to Failed. Verification may
    /// fall back to Execution for a full re-execution pass.
    pub fn can_transition(&self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == Phase::Failed {
            return true;
        }
        matches!(
            (self, to),
            (Phase::Init, Phase::Planning)
                | (Phase::Planning, Phase::Execution)
                | (Phase::Execution, Phase::Integration)
                | (Phase::Integration, Phase::Verification)
                | (Phase::Verification, Phase::Done)
                | (Phase::Verification, Phase::Execution)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One accepted phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Tracks the current phase and the full transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMachine {
    current: Phase,
    history: Vec<PhaseTransition>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: Phase::Init,
            history: Vec::new(),
        }
    }

    /// Rebuild from a checkpointed phase with empty history.
    pub fn resumed_at(phase: Phase) -> Self {
        Self {
            current: phase,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn history(&self) -> &[PhaseTransition] {
        &self.history
    }

    /// Move to a new phase.
    ///
    /// # Errors
    /// Returns `InvalidPhaseTransition` if the edge is not in the
    /// transition table.
    pub fn transition(&mut self, to: Phase, note: Option<String>) -> Result<()> {
        if !self.current.can_transition(to) {
            return Err(Error::InvalidPhaseTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        mlog!("Phase: {} -> {}", self.current, to);
        self.history.push(PhaseTransition {
            from: self.current,
            to,
            at: Utc::now(),
            note,
        });
        self.current = to;
        Ok(())
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}
