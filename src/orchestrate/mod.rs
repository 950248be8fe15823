//! Orchestration: phases, planning, scheduling, integration, healing.

pub mod healer;
pub mod integrator;
pub mod orchestrator;
pub mod phase;
pub mod planner;
pub mod scheduler;

pub use healer::{HealReport, Healer, VerifyOutcome};
pub use integrator::{ConflictFile, IntegrationReport, Integrator};
pub use orchestrator::{
    checkpoint_detail, checkpoint_summary, clear_checkpoint, Orchestrator, RunReport,
};
pub use phase::{Phase, PhaseMachine, PhaseTransition};
pub use planner::{Plan, Planner, TaskSpec};
pub use scheduler::{Scheduler, SchedulerEvent};
