//! Run state and the step/record types that flow through the loop.

use crate::host::TargetId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How a run chooses its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Replay a cached template when one matches, then plan iteratively.
    #[default]
    Auto,
    /// Always plan step by step.
    Agent,
    /// Hand the goal to a script generator.
    Script,
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(RunMode::Auto),
            "agent" => Ok(RunMode::Agent),
            "script" => Ok(RunMode::Script),
            other => Err(Error::Config(format!(
                "unknown mode '{}', expected auto, agent or script",
                other
            ))),
        }
    }
}

/// Why a run ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The model kept producing unusable output, or proposed nothing.
    Planning,
    /// The page or tab went away.
    Environment,
    /// Credentials or configuration are missing.
    Config,
    /// The model endpoint failed.
    Model,
    IterationCap,
    HistoryCap,
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Planning,
    Executing,
    WaitingForLoad,
    WaitingForConfirm,
    Finished,
    Failed(FailureKind),
    Stopped,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Finished | RunPhase::Failed(_) | RunPhase::Stopped
        )
    }
}

/// Primitive page operations a step can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Navigate,
    Fill,
    Click,
    Wait,
    Scroll,
    Hover,
    Select,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Fill => "fill",
            ActionKind::Click => "click",
            ActionKind::Wait => "wait",
            ActionKind::Scroll => "scroll",
            ActionKind::Hover => "hover",
            ActionKind::Select => "select",
        }
    }

    /// Whether the step addresses an element by selector.
    pub fn targets_element(&self) -> bool {
        matches!(
            self,
            ActionKind::Fill | ActionKind::Click | ActionKind::Hover | ActionKind::Select
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "navigate" => Ok(ActionKind::Navigate),
            "fill" => Ok(ActionKind::Fill),
            "click" => Ok(ActionKind::Click),
            "wait" => Ok(ActionKind::Wait),
            "scroll" => Ok(ActionKind::Scroll),
            "hover" => Ok(ActionKind::Hover),
            "select" => Ok(ActionKind::Select),
            other => Err(Error::ActionFailed(format!("unknown action '{}'", other))),
        }
    }
}

/// One step proposed by the planner or replayed from a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub id: u32,
    pub action: ActionKind,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub fallback_targets: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl PlannedStep {
    pub fn new(id: u32, action: ActionKind, target: impl Into<String>) -> Self {
        Self {
            id,
            action,
            target: target.into(),
            value: String::new(),
            fallback_targets: Vec::new(),
            description: String::new(),
            timeout_ms: None,
            requires_confirmation: false,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Name under which this step's selector is remembered.
    pub fn memory_name(&self) -> String {
        if self.description.trim().is_empty() {
            format!("step_{}", self.id)
        } else {
            self.description.trim().to_string()
        }
    }

    /// Identity used for loop detection.
    pub fn signature(&self) -> String {
        format!("{}|{}|{}", self.action, self.target.trim(), self.value.trim())
    }

    /// Primary target followed by fallbacks, blanks and duplicates removed.
    pub fn candidates(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for t in std::iter::once(&self.target).chain(self.fallback_targets.iter()) {
            let t = t.trim();
            if !t.is_empty() && !out.iter().any(|o| o == t) {
                out.push(t.to_string());
            }
        }
        out
    }
}

/// Outcome of one executed step. Append-only; only `success` and `repaired`
/// change after a successful repair-retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub iteration: u32,
    pub action: ActionKind,
    pub target: String,
    #[serde(default)]
    pub value: String,
    pub description: String,
    pub success: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub repaired: bool,
}

/// Everything needed to continue a run after the process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub active: bool,
    pub target_id: TargetId,
    pub goal: String,
    pub mode: RunMode,
    pub phase: RunPhase,
    pub iteration_count: u32,
    pub action_history: Vec<ActionRecord>,
    pub waiting_for_load: bool,
    pub waiting_for_confirm: bool,
    /// Human-readable status. Never drives control flow.
    pub status_message: String,
    /// Corrective note for the next planning prompt.
    #[serde(default)]
    pub planner_notice: Option<String>,
    /// Signatures of the most recent proposals, newest last.
    #[serde(default)]
    pub recent_proposals: Vec<String>,
    #[serde(default)]
    pub malformed_streak: u32,
    /// Step parked while waiting for the user to confirm it.
    #[serde(default)]
    pub pending_step: Option<PlannedStep>,
    /// Domain the run started on; used for template capture.
    #[serde(default)]
    pub start_url: String,
    pub started_at: i64,
    pub updated_at: i64,
}

impl RunState {
    pub fn new(target_id: TargetId, goal: impl Into<String>, mode: RunMode, now_ms: i64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            active: true,
            target_id,
            goal: goal.into(),
            mode,
            phase: RunPhase::Planning,
            iteration_count: 0,
            action_history: Vec::new(),
            waiting_for_load: false,
            waiting_for_confirm: false,
            status_message: "starting".into(),
            planner_notice: None,
            recent_proposals: Vec::new(),
            malformed_streak: 0,
            pending_step: None,
            start_url: String::new(),
            started_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Move to a terminal phase with a final status line.
    pub fn finish(&mut self, phase: RunPhase, message: impl Into<String>) {
        debug_assert!(phase.is_terminal());
        self.phase = phase;
        self.active = false;
        self.waiting_for_load = false;
        self.waiting_for_confirm = false;
        self.pending_step = None;
        self.status_message = message.into();
    }

    pub fn successful_steps(&self) -> impl Iterator<Item = &ActionRecord> {
        self.action_history.iter().filter(|r| r.success)
    }
}
