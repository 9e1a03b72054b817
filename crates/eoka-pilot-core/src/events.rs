//! Run progress notifications.

use crate::executor::StepResult;
use crate::state::{PlannedStep, RunPhase};
use serde::Serialize;
use uuid::Uuid;

/// Progress notifications published while a run is live.
///
/// Delivery is best-effort: events sent with no subscriber are dropped, and a
/// slow subscriber may miss events rather than stall the run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Status {
        run_id: Uuid,
        phase: RunPhase,
        message: String,
    },
    /// A fragment of the model's streamed reasoning.
    Thinking { run_id: Uuid, delta: String },
    StepStarted { run_id: Uuid, step: PlannedStep },
    StepFinished {
        run_id: Uuid,
        step: PlannedStep,
        result: StepResult,
    },
    Finished {
        run_id: Uuid,
        phase: RunPhase,
        message: String,
    },
}

impl AgentEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            AgentEvent::Status { run_id, .. }
            | AgentEvent::Thinking { run_id, .. }
            | AgentEvent::StepStarted { run_id, .. }
            | AgentEvent::StepFinished { run_id, .. }
            | AgentEvent::Finished { run_id, .. } => *run_id,
        }
    }
}
