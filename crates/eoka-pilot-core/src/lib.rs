//! # eoka-pilot-core
//!
//! Goal-driven page automation. A [`Pilot`] observes a page, asks a language
//! model for the next step, executes it with retries and fallbacks, and
//! remembers which selectors worked per domain.
//!
//! The engine never touches a browser directly: everything page-related goes
//! through the [`Host`] trait, persistence through [`KvStore`], and model calls
//! through [`ChatModel`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eoka_pilot_core::{
//!     FileKv, OpenAiCompatClient, Pilot, PilotConfig, RunMode, TargetId,
//! };
//!
//! # async fn demo(host: Arc<dyn eoka_pilot_core::Host>) -> eoka_pilot_core::Result<()> {
//! let config = PilotConfig::load("pilot.yaml")?;
//! let model = Arc::new(OpenAiCompatClient::from_config(&config.model)?);
//! let store = Arc::new(FileKv::open(&config.store.dir)?);
//! let pilot = Pilot::builder(config, host, model, store).build();
//!
//! pilot.start(TargetId::new("tab-1"), "log in as alice", RunMode::Agent).await?;
//! let state = pilot.wait().await?;
//! println!("{}", state.status_message);
//! # Ok(())
//! # }
//! ```

mod agent;
mod clock;
mod config;
mod events;
mod executor;
mod host;
mod llm;
mod memory;
mod observe;
mod placeholders;
mod planner;
mod repair;
mod state;
mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use agent::{Pilot, PilotBuilder, ScriptGenerator, RUN_STATE_KEY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BrowserConfig, ExecutorSettings, LimitSettings, MemorySettings, ModelConfig, Params,
    PilotConfig, StoreConfig, Viewport,
};
pub use events::AgentEvent;
pub use executor::{Executor, StepResult};
pub use host::{
    ElementPresence, Host, InteractionOutcome, PageScript, RawActionable, RawInput, RawObservation,
    ScrollDirection, TabInfo, TargetId,
};
pub use llm::{
    redact_secrets, ChatMessage, ChatModel, ChatRequest, ImagePart, OpenAiCompatClient,
    RateLimiter, Role, Throttled,
};
pub use memory::{
    domain_of, normalize_intent, DomainMemory, MemoryExport, MemoryStats, MemoryStore,
    SelectorPattern, TaskTemplate,
};
pub use observe::{compress_screenshot, ActionableSummary, InputSummary, Observer, PageSummary};
pub use placeholders::{parse_user_memory, resolve_placeholders, UserMemory};
pub use planner::{extract_json, parse_decision, PlanDecision, PlanInput, Planner, ProposalWindow};
pub use repair::{RepairResult, SelectorRepair};
pub use state::{
    ActionKind, ActionRecord, FailureKind, PlannedStep, RunMode, RunPhase, RunState,
};
pub use store::{FileKv, KvStore, MemoryKv};

/// Result type for eoka-pilot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or driving a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host error: {0}")]
    Host(String),

    #[error("target closed: {0}")]
    TargetClosed(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("run stopped")]
    Stopped,
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Model(redact_secrets(&e.to_string()))
    }
}
