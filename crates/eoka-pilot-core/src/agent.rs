//! The plan, act, observe loop and its control surface.

use crate::clock::{Clock, SystemClock};
use crate::config::PilotConfig;
use crate::events::AgentEvent;
use crate::executor::{Executor, StepResult};
use crate::host::{Host, TargetId};
use crate::llm::{ChatModel, RateLimiter, Throttled};
use crate::memory::{domain_of, MemoryStore};
use crate::observe::{Observer, PageSummary};
use crate::placeholders::{parse_user_memory, resolve_placeholders, UserMemory};
use crate::planner::{
    loop_notice, PlanDecision, PlanInput, Planner, ProposalWindow, MALFORMED_NOTICE,
};
use crate::repair::SelectorRepair;
use crate::state::{ActionRecord, FailureKind, PlannedStep, RunMode, RunPhase, RunState};
use crate::store::KvStore;
use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key under which the live [`RunState`] is persisted.
pub const RUN_STATE_KEY: &str = "run_state";

const EVENT_CAPACITY: usize = 256;

/// How long a superseded run gets to write its final state.
const SUPERSEDE_GRACE: Duration = Duration::from_secs(5);

/// Turns a goal into a complete step list up front, for [`RunMode::Script`].
///
/// `model` is the engine's model behind the shared rate limiter; generators
/// should make their model calls through it.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate(
        &self,
        goal: &str,
        page: &PageSummary,
        model: &dyn ChatModel,
    ) -> Result<Vec<PlannedStep>>;
}

struct Engine {
    config: PilotConfig,
    host: Arc<dyn Host>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    /// Planner model, rate limited.
    model: Arc<dyn ChatModel>,
    memory: Arc<MemoryStore>,
    observer: Arc<Observer>,
    planner: Planner,
    executor: Executor,
    repair: SelectorRepair,
    scripts: Option<Arc<dyn ScriptGenerator>>,
    user_memory: UserMemory,
    events: broadcast::Sender<AgentEvent>,
    /// Serializes every read-check-write of the persisted run state.
    state_lock: Mutex<()>,
}

impl Engine {
    async fn load_state(&self) -> Result<Option<RunState>> {
        match self.kv.get(RUN_STATE_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::Store(format!("corrupt run state: {}", e))),
            None => Ok(None),
        }
    }

    async fn store_state(&self, state: &RunState) -> Result<()> {
        self.kv
            .set(RUN_STATE_KEY, serde_json::to_value(state)?)
            .await
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    confirm: mpsc::UnboundedSender<bool>,
    /// Cancelled by the run task once its final state is written.
    finished: CancellationToken,
    task: Option<JoinHandle<RunState>>,
}

/// Builder for [`Pilot`].
pub struct PilotBuilder {
    config: PilotConfig,
    host: Arc<dyn Host>,
    model: Arc<dyn ChatModel>,
    vision_model: Option<Arc<dyn ChatModel>>,
    kv: Arc<dyn KvStore>,
    clock: Option<Arc<dyn Clock>>,
    scripts: Option<Arc<dyn ScriptGenerator>>,
}

impl PilotBuilder {
    /// Use a different model for selector repair. Defaults to the planner's.
    pub fn vision_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.vision_model = Some(model);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn script_generator(mut self, generator: Arc<dyn ScriptGenerator>) -> Self {
        self.scripts = Some(generator);
        self
    }

    pub fn build(self) -> Pilot {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(
            config.model.min_interval_ms,
        )));
        let planner_model: Arc<dyn ChatModel> =
            Arc::new(Throttled::new(self.model.clone(), limiter.clone()));
        let vision_model: Arc<dyn ChatModel> = Arc::new(Throttled::new(
            self.vision_model.unwrap_or(self.model),
            limiter,
        ));

        let observer = Arc::new(Observer::new(self.host.clone(), &config.limits));
        let memory = Arc::new(MemoryStore::new(
            self.kv.clone(),
            clock.clone(),
            config.memory.clone(),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = Engine {
            planner: Planner::new(planner_model.clone(), &config.model, &config.memory),
            model: planner_model,
            executor: Executor::new(self.host.clone(), config.executor.clone()),
            repair: SelectorRepair::new(
                self.host.clone(),
                observer.clone(),
                vision_model,
                &config.model,
            ),
            user_memory: parse_user_memory(&config.user_memory),
            host: self.host,
            kv: self.kv,
            clock,
            memory,
            observer,
            scripts: self.scripts,
            events,
            state_lock: Mutex::new(()),
            config,
        };
        Pilot {
            engine: Arc::new(engine),
            current: Mutex::new(None),
        }
    }
}

/// Drives one goal at a time against one tab.
///
/// Starting a run supersedes any run already in progress. The persisted
/// [`RunState`] is the source of truth; [`Pilot::get_status`] reads it.
pub struct Pilot {
    engine: Arc<Engine>,
    current: Mutex<Option<RunHandle>>,
}

impl Pilot {
    pub fn builder(
        config: PilotConfig,
        host: Arc<dyn Host>,
        model: Arc<dyn ChatModel>,
        store: Arc<dyn KvStore>,
    ) -> PilotBuilder {
        PilotBuilder {
            config,
            host,
            model,
            vision_model: None,
            kv: store,
            clock: None,
            scripts: None,
        }
    }

    /// Begin working on `goal` in `target`. Returns the new run's id.
    pub async fn start(&self, target: TargetId, goal: &str, mode: RunMode) -> Result<Uuid> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(Error::Config("goal must not be empty".into()));
        }
        match self.engine.memory.cleanup_expired().await {
            Ok(0) => {}
            Ok(n) => info!("memory: purged {} stale domain(s)", n),
            Err(e) => warn!("memory cleanup failed: {}", e),
        }

        let state = RunState::new(target, goal, mode, self.engine.clock.now_ms());
        info!("run {}: starting '{}' ({:?} mode)", state.run_id, goal, mode);
        self.launch(state).await
    }

    /// Continue the persisted run after a restart.
    pub async fn resume(&self) -> Result<Uuid> {
        let mut state = self
            .engine
            .load_state()
            .await?
            .filter(|s| s.active)
            .ok_or_else(|| Error::Config("no active run to resume".into()))?;
        if state.phase == RunPhase::Executing {
            // The step's outcome is unknown; look at the page again.
            state.phase = RunPhase::Planning;
        }
        info!("run {}: resuming in {:?}", state.run_id, state.phase);
        self.launch(state).await
    }

    async fn launch(&self, state: RunState) -> Result<Uuid> {
        let run_id = state.run_id;
        let mut current = self.current.lock().await;
        if let Some(prev) = current.take() {
            if prev.run_id != run_id {
                info!("run {}: superseded by {}", prev.run_id, run_id);
            }
            prev.cancel.cancel();
            // Its last write must land before ours, or it would clobber the new state.
            let ended = tokio::time::timeout(SUPERSEDE_GRACE, prev.finished.cancelled()).await;
            if ended.is_err() {
                warn!("run {}: did not stop in time; aborting it", prev.run_id);
                if let Some(task) = &prev.task {
                    task.abort();
                }
            }
        }
        {
            let _guard = self.engine.state_lock.lock().await;
            self.engine.store_state(&state).await?;
        }

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        let run = Run {
            loads: self.engine.host.subscribe_loads(),
            engine: self.engine.clone(),
            state,
            cancel: cancel.clone(),
            finished: finished.clone(),
            confirm: confirm_rx,
            abandoned: false,
            replay_attempted: false,
            replayed_clean: false,
        };
        *current = Some(RunHandle {
            run_id,
            cancel,
            confirm: confirm_tx,
            finished,
            task: Some(tokio::spawn(run.run())),
        });
        Ok(run_id)
    }

    /// Stop the current run immediately. Also stops a persisted run that has
    /// no live task, e.g. after a restart.
    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.current.lock().await.as_ref() {
            handle.cancel.cancel();
        }
        let _guard = self.engine.state_lock.lock().await;
        if let Some(mut state) = self.engine.load_state().await? {
            if state.active {
                state.finish(RunPhase::Stopped, "stopped by user");
                state.updated_at = self.engine.clock.now_ms();
                self.engine.store_state(&state).await?;
                info!("run {}: stopped by user", state.run_id);
            }
        }
        Ok(())
    }

    /// The persisted run state, if any run has been started.
    pub async fn get_status(&self) -> Result<Option<RunState>> {
        self.engine.load_state().await
    }

    /// Answer a pending confirmation request.
    pub async fn confirm(&self, approved: bool) -> Result<()> {
        let waiting = self
            .engine
            .load_state()
            .await?
            .map(|s| s.active && s.waiting_for_confirm)
            .unwrap_or(false);
        if !waiting {
            return Err(Error::Config("no step is waiting for confirmation".into()));
        }
        let current = self.current.lock().await;
        let handle = current
            .as_ref()
            .ok_or_else(|| Error::Config("the waiting run is not live; resume it first".into()))?;
        handle
            .confirm
            .send(approved)
            .map_err(|_| Error::Config("run already ended".into()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.engine.events.subscribe()
    }

    /// Wait for the live run to end and return its final state. With no live
    /// run, returns the persisted state.
    pub async fn wait(&self) -> Result<RunState> {
        let task = self
            .current
            .lock()
            .await
            .as_mut()
            .and_then(|h| h.task.take());
        match task {
            Some(task) => task
                .await
                .map_err(|e| Error::Host(format!("run task failed: {}", e))),
            None => self
                .engine
                .load_state()
                .await?
                .ok_or_else(|| Error::Config("no run has been started".into())),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.engine.memory
    }
}

/// One live run. Owns its state; the persisted copy trails it by at most one
/// mutation.
struct Run {
    engine: Arc<Engine>,
    state: RunState,
    cancel: CancellationToken,
    finished: CancellationToken,
    confirm: mpsc::UnboundedReceiver<bool>,
    loads: broadcast::Receiver<TargetId>,
    /// Another run or a stop took over the persisted state.
    abandoned: bool,
    replay_attempted: bool,
    replayed_clean: bool,
}

impl Run {
    async fn run(mut self) -> RunState {
        let outcome = self.drive().await;
        if let Err(e) = outcome {
            let (phase, message) = match e {
                Error::Stopped if self.abandoned => {
                    (RunPhase::Stopped, "superseded or stopped".to_string())
                }
                Error::Stopped => (RunPhase::Stopped, "stopped by user".to_string()),
                Error::TargetClosed(_) => (
                    RunPhase::Failed(FailureKind::Environment),
                    "target page was closed".to_string(),
                ),
                Error::Timeout(m) | Error::Host(m) | Error::ActionFailed(m) => {
                    (RunPhase::Failed(FailureKind::Environment), m)
                }
                Error::Model(m) => (
                    RunPhase::Failed(FailureKind::Model),
                    format!("model request failed: {}", m),
                ),
                e @ (Error::MissingCredentials(_) | Error::Config(_)) => {
                    (RunPhase::Failed(FailureKind::Config), e.to_string())
                }
                other => (RunPhase::Failed(FailureKind::Config), other.to_string()),
            };
            if !self.state.phase.is_terminal() {
                self.state.finish(phase, message);
            }
        }

        if !self.abandoned {
            if let Err(e) = self.persist().await {
                debug!("run {}: final state not written: {}", self.state.run_id, e);
            }
        }
        self.finished.cancel();
        info!(
            "run {}: {:?} after {} iteration(s): {}",
            self.state.run_id, self.state.phase, self.state.iteration_count, self.state.status_message
        );
        self.engine.emit(AgentEvent::Finished {
            run_id: self.state.run_id,
            phase: self.state.phase,
            message: self.state.status_message.clone(),
        });
        self.state
    }

    /// Advance until the state is terminal.
    async fn drive(&mut self) -> Result<()> {
        if self.state.mode == RunMode::Script && self.state.action_history.is_empty() {
            return self.run_script().await;
        }
        loop {
            let phase = self.state.phase;
            match phase {
                phase if phase.is_terminal() => return Ok(()),
                RunPhase::WaitingForLoad => self.await_load().await?,
                RunPhase::WaitingForConfirm => self.await_confirmation().await?,
                _ => {
                    if self.state.mode == RunMode::Auto && !self.replay_attempted {
                        self.replay_attempted = true;
                        self.replay_template().await?;
                        continue;
                    }
                    self.plan_round().await?;
                }
            }
        }
    }

    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Stopped),
            out = fut => Ok(out),
        }
    }

    async fn pause(&self, ms: u64) -> Result<()> {
        self.guard(tokio::time::sleep(Duration::from_millis(ms))).await
    }

    /// Write the state unless this run no longer owns the persisted copy.
    async fn persist(&mut self) -> Result<()> {
        let _guard = self.engine.state_lock.lock().await;
        if let Some(stored) = self.engine.load_state().await? {
            let ours = stored.run_id == self.state.run_id;
            if !ours || stored.phase == RunPhase::Stopped {
                self.abandoned = true;
                return Err(Error::Stopped);
            }
        }
        self.state.updated_at = self.engine.clock.now_ms();
        self.engine.store_state(&self.state).await
    }

    async fn transition(&mut self, phase: RunPhase, message: impl Into<String>) -> Result<()> {
        self.state.phase = phase;
        self.state.status_message = message.into();
        self.engine.emit(AgentEvent::Status {
            run_id: self.state.run_id,
            phase,
            message: self.state.status_message.clone(),
        });
        self.persist().await
    }

    async fn finish(&mut self, phase: RunPhase, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        info!("run {}: {}", self.state.run_id, message);
        self.state.finish(phase, message);
        self.persist().await
    }

    async fn current_url(&self) -> Result<String> {
        let tab = self
            .guard(self.engine.host.tab_info(&self.state.target_id))
            .await??
            .ok_or_else(|| Error::TargetClosed(self.state.target_id.to_string()))?;
        Ok(tab.url)
    }

    async fn plan_round(&mut self) -> Result<()> {
        let limits = &self.engine.config.limits;
        if self.state.iteration_count >= limits.max_iterations {
            let message = format!(
                "stopped after {} iterations without completing the goal",
                limits.max_iterations
            );
            return self.finish(RunPhase::Failed(FailureKind::IterationCap), message).await;
        }
        if self.state.action_history.len() >= limits.history_cap {
            let message = format!("action history reached {} steps", limits.history_cap);
            return self.finish(RunPhase::Failed(FailureKind::HistoryCap), message).await;
        }
        let settle = limits.settle_delay_ms;

        self.state.iteration_count += 1;
        let round = self.state.iteration_count;
        self.transition(RunPhase::Planning, format!("analyzing page (round {})", round))
            .await?;
        self.pause(settle).await?;

        let url = self.current_url().await?;
        if self.state.start_url.is_empty() {
            self.state.start_url = url.clone();
        }
        let target = self.state.target_id.clone();
        let page = self.guard(self.engine.observer.observe(&target)).await??;
        let memory = self
            .engine
            .memory
            .get_domain_memory(&domain_of(&page.url))
            .await?;
        let screenshot = if self.engine.config.vision {
            self.guard(self.engine.observer.screenshot(&target)).await?
        } else {
            None
        };

        let notice = self.state.planner_notice.take();
        let events = self.engine.events.clone();
        let run_id = self.state.run_id;
        let on_delta = move |delta: &str| {
            let _ = events.send(AgentEvent::Thinking {
                run_id,
                delta: delta.to_string(),
            });
        };
        let input = PlanInput {
            goal: &self.state.goal,
            page: &page,
            history: &self.state.action_history,
            memory: &memory,
            notice: notice.as_deref(),
            user_keys: self.engine.user_memory.keys().map(String::as_str).collect(),
            screenshot,
        };
        let decision = self
            .guard(self.engine.planner.plan_next(input, &on_delta))
            .await??;

        match decision {
            PlanDecision::Completed { reason } => {
                self.capture_template().await;
                let message = if reason.trim().is_empty() {
                    "goal completed".to_string()
                } else {
                    format!("goal completed: {}", reason.trim())
                };
                self.finish(RunPhase::Finished, message).await
            }
            PlanDecision::NoAction { thinking } => {
                debug!("planner gave no action: {}", thinking);
                self.finish(
                    RunPhase::Failed(FailureKind::Planning),
                    "cannot determine next step",
                )
                .await
            }
            PlanDecision::Malformed { .. } => {
                self.state.malformed_streak += 1;
                if self.state.malformed_streak >= 2 {
                    return self
                        .finish(
                            RunPhase::Failed(FailureKind::Planning),
                            "model output could not be parsed after a correction",
                        )
                        .await;
                }
                self.state.planner_notice = Some(MALFORMED_NOTICE.to_string());
                self.transition(RunPhase::Planning, "model answer unreadable, asking again")
                    .await
            }
            PlanDecision::Next {
                step,
                confidence,
                remaining,
                ..
            } => {
                self.state.malformed_streak = 0;
                debug!(
                    "planner: {} {} (confidence {:?}, ~{:?} left)",
                    step.action, step.target, confidence, remaining
                );
                let mut window = ProposalWindow::new(
                    std::mem::take(&mut self.state.recent_proposals),
                    self.engine.config.limits.loop_threshold,
                );
                let repeated = window.record(&step);
                self.state.recent_proposals = window.into_inner();
                if repeated {
                    warn!("planner repeated '{}' without progress; skipping", step.signature());
                    self.state.planner_notice = Some(loop_notice(&step));
                    return self
                        .transition(RunPhase::Planning, "skipped a repeated step")
                        .await;
                }
                if self.engine.config.confirm_sensitive && step.requires_confirmation {
                    return self.park_for_confirmation(step).await;
                }
                self.execute_step(step).await.map(|_| ())
            }
        }
    }

    async fn park_for_confirmation(&mut self, step: PlannedStep) -> Result<()> {
        let label = step_label(&step);
        self.state.pending_step = Some(step);
        self.state.waiting_for_confirm = true;
        self.transition(
            RunPhase::WaitingForConfirm,
            format!("waiting for confirmation: {}", label),
        )
        .await
    }

    async fn await_confirmation(&mut self) -> Result<()> {
        let approved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Stopped),
            answer = self.confirm.recv() => answer.ok_or(Error::Stopped)?,
        };
        self.state.waiting_for_confirm = false;
        let Some(step) = self.state.pending_step.take() else {
            return self.transition(RunPhase::Planning, "nothing to confirm").await;
        };
        if approved {
            info!("user approved '{}'", step_label(&step));
            return self.execute_step(step).await.map(|_| ());
        }
        info!("user declined '{}'", step_label(&step));
        self.state.action_history.push(ActionRecord {
            iteration: self.state.iteration_count,
            action: step.action,
            target: step.target.clone(),
            value: step.value.clone(),
            description: step.description.clone(),
            success: false,
            error: Some("declined by user".into()),
            repaired: false,
        });
        self.state.planner_notice = Some(format!(
            "The user declined `{}`. Find another way or report that the goal cannot be completed.",
            step_label(&step)
        ));
        self.transition(RunPhase::Planning, "step declined by user").await
    }

    async fn await_load(&mut self) -> Result<()> {
        let timeout = Duration::from_millis(self.engine.config.limits.load_timeout_ms);
        let target = self.state.target_id.clone();
        let loads = &mut self.loads;
        let loaded = async {
            loop {
                match loads.recv().await {
                    Ok(t) if t == target => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Stopped),
            _ = loaded => debug!("page load finished"),
            _ = tokio::time::sleep(timeout) => warn!("no load event within {:?}; continuing", timeout),
        }
        self.state.waiting_for_load = false;
        self.transition(RunPhase::Planning, "page loaded").await
    }

    fn drain_loads(&mut self) {
        loop {
            match self.loads.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
    }

    /// Append remembered selectors for this step's element as fallbacks.
    async fn add_memory_fallbacks(&self, step: &mut PlannedStep, url: &str) {
        match self.engine.memory.get_selector(url, &step.memory_name()).await {
            Ok(Some(pattern)) => {
                step.fallback_targets.push(pattern.selector);
                step.fallback_targets.extend(pattern.fallbacks);
            }
            Ok(None) => {}
            Err(e) => warn!("memory lookup failed: {}", e),
        }
    }

    async fn remember(&self, url: &str, name: &str, selector: &str, success: bool) {
        if let Err(e) = self
            .engine
            .memory
            .save_selector(url, name, selector, success)
            .await
        {
            warn!("memory update failed: {}", e);
        }
    }

    /// Execute one step with repair on failure and record it. Leaves the
    /// phase at `WaitingForLoad` when the step navigated, `Planning` otherwise.
    async fn execute_step(&mut self, step: PlannedStep) -> Result<StepResult> {
        let url = self.current_url().await?;
        let mut resolved = resolve_placeholders(&step, &self.engine.user_memory);
        if resolved.action.targets_element() {
            self.add_memory_fallbacks(&mut resolved, &url).await;
        }

        let message = format!("step {}: {}", self.state.iteration_count, step_label(&step));
        self.transition(RunPhase::Executing, message).await?;
        self.engine.emit(AgentEvent::StepStarted {
            run_id: self.state.run_id,
            step: step.clone(),
        });
        self.drain_loads();

        let target = self.state.target_id.clone();
        let mut result = self
            .guard(self.engine.executor.execute(&target, &resolved))
            .await??;
        self.state.action_history.push(ActionRecord {
            iteration: self.state.iteration_count,
            action: step.action,
            target: resolved.target.clone(),
            value: step.value.clone(),
            description: step.description.clone(),
            success: result.success,
            error: result.error.clone(),
            repaired: false,
        });
        self.persist().await?;

        let name = step.memory_name();
        if resolved.action.targets_element() {
            let used = result.used_selector.as_deref().unwrap_or(&resolved.target);
            self.remember(&url, &name, used, result.success).await;
        }

        if !result.success && resolved.action.targets_element() {
            warn!(
                "step failed ({}); trying selector repair",
                result.error.as_deref().unwrap_or("unknown")
            );
            let repair = self.guard(self.engine.repair.repair(&target, &resolved)).await??;
            if let Some(selector) = repair.new_selector.filter(|_| repair.success) {
                let mut retry = resolved.clone();
                retry.target = selector.clone();
                retry.fallback_targets = repair.alternative_selectors;
                let retried = self.guard(self.engine.executor.execute(&target, &retry)).await??;
                if retried.success {
                    info!("repaired selector '{}' worked", selector);
                    if let Some(record) = self.state.action_history.last_mut() {
                        record.success = true;
                        record.repaired = true;
                    }
                    let used = retried.used_selector.clone().unwrap_or(selector);
                    self.remember(&url, &name, &used, true).await;
                    result = retried;
                }
                self.persist().await?;
            }
        }

        self.engine.emit(AgentEvent::StepFinished {
            run_id: self.state.run_id,
            step,
            result: result.clone(),
        });
        if result.caused_navigation {
            self.state.waiting_for_load = true;
            self.transition(RunPhase::WaitingForLoad, "waiting for page load").await?;
        } else {
            let message = if result.success { "step done" } else { "step failed" };
            self.transition(RunPhase::Planning, message).await?;
        }
        Ok(result)
    }

    /// Execute `steps` in order, waiting for loads between them. Returns the
    /// 1-based index and error of the first failed step.
    async fn run_steps(&mut self, steps: Vec<PlannedStep>) -> Result<Option<(usize, String)>> {
        for (i, mut step) in steps.into_iter().enumerate() {
            step.id = self.state.action_history.len() as u32 + 1;
            self.state.iteration_count += 1;
            let result = self.execute_step(step).await?;
            if self.state.phase == RunPhase::WaitingForLoad {
                self.await_load().await?;
            }
            if !result.success {
                return Ok(Some((i + 1, result.error.unwrap_or_default())));
            }
        }
        Ok(None)
    }

    /// Replay a cached template for this goal, if one exists. Any failure
    /// hands control back to iterative planning.
    async fn replay_template(&mut self) -> Result<()> {
        let url = self.current_url().await?;
        if self.state.start_url.is_empty() {
            self.state.start_url = url.clone();
        }
        let template = match self
            .engine
            .memory
            .get_task_template(&url, &self.state.goal)
            .await
        {
            Ok(Some(t)) => t,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("template lookup failed: {}", e);
                return Ok(());
            }
        };
        let cap = self.engine.config.limits.template_history_cap;
        if template.steps.len() > cap {
            warn!("template has {} steps, over the replay cap of {}", template.steps.len(), cap);
            return Ok(());
        }

        info!("replaying {} saved step(s)", template.steps.len());
        self.transition(RunPhase::Executing, "replaying saved steps").await?;
        let failed = self.run_steps(template.steps).await?;
        let success = failed.is_none();
        if let Err(e) = self
            .engine
            .memory
            .record_template_outcome(&self.state.start_url, &self.state.goal, success)
            .await
        {
            warn!("template bookkeeping failed: {}", e);
        }
        match failed {
            None => {
                self.replayed_clean = true;
                self.state.planner_notice = Some(
                    "Saved steps for this goal were replayed. Check whether the goal is complete."
                        .into(),
                );
            }
            Some((n, error)) => {
                info!("replay failed at step {}: {}", n, error);
                self.state.planner_notice = Some(format!(
                    "Replaying saved steps failed at step {} ({}). Continue from the current page.",
                    n, error
                ));
            }
        }
        if self.state.phase.is_terminal() {
            return Ok(());
        }
        self.transition(RunPhase::Planning, "replay done, planning").await
    }

    /// Save the successful steps as a template for this goal.
    async fn capture_template(&self) {
        if self.replayed_clean || self.state.mode == RunMode::Script {
            return;
        }
        let steps: Vec<PlannedStep> = self
            .state
            .successful_steps()
            .enumerate()
            .map(|(i, r)| {
                PlannedStep::new(i as u32 + 1, r.action, r.target.clone())
                    .with_value(r.value.clone())
                    .with_description(r.description.clone())
            })
            .collect();
        if steps.is_empty() {
            return;
        }
        if let Err(e) = self
            .engine
            .memory
            .save_task_template(&self.state.start_url, &self.state.goal, steps)
            .await
        {
            warn!("template save failed: {}", e);
        }
    }

    async fn run_script(&mut self) -> Result<()> {
        let Some(generator) = self.engine.scripts.clone() else {
            return self
                .finish(
                    RunPhase::Failed(FailureKind::Config),
                    "script mode needs a script generator and none is configured",
                )
                .await;
        };
        self.transition(RunPhase::Planning, "generating script").await?;
        let url = self.current_url().await?;
        self.state.start_url = url;
        let target = self.state.target_id.clone();
        let page = self.guard(self.engine.observer.observe(&target)).await??;
        let steps = self
            .guard(generator.generate(&self.state.goal, &page, self.engine.model.as_ref()))
            .await??;
        if steps.is_empty() {
            return self
                .finish(RunPhase::Failed(FailureKind::Planning), "script generator produced no steps")
                .await;
        }
        let cap = self.engine.config.limits.history_cap;
        if steps.len() > cap {
            let message = format!("script has {} steps, over the cap of {}", steps.len(), cap);
            return self.finish(RunPhase::Failed(FailureKind::HistoryCap), message).await;
        }

        let total = steps.len();
        match self.run_steps(steps).await? {
            None => {
                self.finish(RunPhase::Finished, format!("script completed ({} steps)", total))
                    .await
            }
            Some((n, error)) => {
                self.finish(
                    RunPhase::Failed(FailureKind::Planning),
                    format!("script step {} failed: {}", n, error),
                )
                .await
            }
        }
    }
}

fn step_label(step: &PlannedStep) -> String {
    if step.description.trim().is_empty() {
        format!("{} {}", step.action, step.target)
    } else {
        step.description.trim().to_string()
    }
}
