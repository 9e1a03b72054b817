//! End-to-end runs of the agent loop against the in-memory host and a
//! scripted model. All tests run on paused tokio time, so backoffs, settle
//! delays and load timeouts cost nothing.

use async_trait::async_trait;
use eoka_pilot_core::fake::{FakeElement, FakeHost, FakePage, ScriptedModel};
use eoka_pilot_core::{
    ActionKind, AgentEvent, ChatMessage, ChatModel, ChatRequest, FailureKind, KvStore,
    ManualClock, MemoryKv, PageSummary, Pilot, PilotConfig, PlannedStep, RunMode, RunPhase,
    RunState, ScriptGenerator, TargetId, RUN_STATE_KEY,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LOGIN_URL: &str = "https://a.test/login";
const GOAL: &str = "log in as alice";

struct Harness {
    host: Arc<FakeHost>,
    model: Arc<ScriptedModel>,
    kv: Arc<MemoryKv>,
    pilot: Pilot,
    target: TargetId,
}

fn login_page() -> FakePage {
    FakePage::new(LOGIN_URL, "Sign in")
        .text("Sign in to continue")
        .with(FakeElement::input("#email", "email"))
        .with(FakeElement::password("#password", "password"))
        .with(FakeElement::button("#login", "Sign in").navigates_to("https://a.test/home"))
        .with(FakeElement::button("#noop", "Remember me"))
        .with(FakeElement::button("#buy", "Buy now"))
}

fn home_page() -> FakePage {
    FakePage::new("https://a.test/home", "Home")
        .text("Welcome back, alice")
        .with(FakeElement::link("#logout", "Log out", "https://a.test/login"))
        .with(FakeElement::button("#menu", "Menu"))
}

fn harness_with(model: ScriptedModel, config: PilotConfig) -> Harness {
    let host = Arc::new(FakeHost::new());
    let target = host.add_tab(login_page());
    host.add_site(home_page());
    let model = Arc::new(model);
    let kv = Arc::new(MemoryKv::new());
    let pilot = Pilot::builder(config, host.clone(), model.clone(), kv.clone())
        .clock(Arc::new(ManualClock::new(1_700_000_000_000)))
        .build();
    Harness {
        host,
        model,
        kv,
        pilot,
        target,
    }
}

fn harness(model: ScriptedModel) -> Harness {
    harness_with(model, PilotConfig::default())
}

fn step(action: &str, target: &str, value: &str, description: &str) -> String {
    json!({
        "thinking": format!("next: {}", description),
        "goalCompleted": false,
        "nextAction": {
            "action": action,
            "target": target,
            "value": value,
            "description": description,
        },
        "confidence": 0.8,
        "estimatedRemainingSteps": 2,
    })
    .to_string()
}

fn done(reason: &str) -> String {
    json!({
        "thinking": "the goal is reached",
        "goalCompleted": true,
        "completionReason": reason,
        "nextAction": null,
    })
    .to_string()
}

fn login_script() -> Vec<String> {
    vec![
        step("fill", "#email", "{{memory.email}}", "enter email"),
        step("fill", "#password", "{{memory.password}}", "enter password"),
        step("click", "#login", "", "submit login"),
        done("dashboard shows welcome message"),
    ]
}

fn with_user_memory() -> PilotConfig {
    PilotConfig {
        user_memory: "email: alice@example.com\npassword=hunter2".into(),
        ..Default::default()
    }
}

async fn wait_for_phase(pilot: &Pilot, phase: RunPhase) -> RunState {
    for _ in 0..2000 {
        if let Some(state) = pilot.get_status().await.expect("status") {
            if state.phase == phase {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run never reached {:?}", phase);
}

#[tokio::test(start_paused = true)]
async fn test_login_scenario() {
    let h = harness_with(ScriptedModel::new(login_script()), with_user_memory());
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .expect("start");
    let state = h.pilot.wait().await.expect("wait");

    assert_eq!(state.phase, RunPhase::Finished);
    assert!(state.status_message.contains("goal completed"));
    assert!(!state.active);
    assert_eq!(
        h.host.interactions(),
        vec![
            "fill #email=alice@example.com",
            "fill #password=hunter2",
            "click #login",
            "navigate https://a.test/home",
        ]
    );
    assert_eq!(state.action_history.len(), 3);
    assert!(state.action_history.iter().all(|r| r.success));
    assert_eq!(state.action_history[1].value, "{{memory.password}}");
    assert_eq!(h.model.call_count(), 4);

    let persisted = h.pilot.get_status().await.unwrap().expect("persisted");
    assert_eq!(persisted.iteration_count, state.iteration_count);
    assert_eq!(persisted.iteration_count, 4);
    assert_eq!(persisted.phase, RunPhase::Finished);
    assert!(h.kv.get(RUN_STATE_KEY).await.unwrap().is_some());

    let template = h
        .pilot
        .memory()
        .get_task_template(LOGIN_URL, GOAL)
        .await
        .unwrap()
        .expect("template captured");
    assert_eq!(template.steps.len(), 3);
    assert_eq!(template.steps[2].action, ActionKind::Click);

    let email = h
        .pilot
        .memory()
        .get_selector(LOGIN_URL, "enter email")
        .await
        .unwrap()
        .expect("selector remembered");
    assert_eq!(email.selector, "#email");
}

#[tokio::test(start_paused = true)]
async fn test_progress_events() {
    let h = harness_with(ScriptedModel::new(login_script()), with_user_memory());
    let mut events = h.pilot.subscribe();
    let run_id = h
        .pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    h.pilot.wait().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.run_id(), run_id);
        seen.push(event);
    }
    let started = seen
        .iter()
        .filter(|e| matches!(e, AgentEvent::StepStarted { .. }))
        .count();
    assert_eq!(started, 3);
    assert!(seen.iter().any(|e| matches!(e, AgentEvent::Thinking { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        AgentEvent::Status {
            phase: RunPhase::WaitingForLoad,
            ..
        }
    )));
    assert!(matches!(
        seen.last(),
        Some(AgentEvent::Finished {
            phase: RunPhase::Finished,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_iteration_cap() {
    let replies: Vec<String> = (0..40)
        .map(|i| step("wait", "", &(100 + i).to_string(), "pause"))
        .collect();
    let h = harness(ScriptedModel::new(replies));
    h.pilot
        .start(h.target.clone(), "never finishes", RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Failed(FailureKind::IterationCap));
    assert_eq!(state.iteration_count, 30);
    assert_eq!(h.model.call_count(), 30);
    assert!(state.status_message.contains("30 iterations"));
    let persisted = h.pilot.get_status().await.unwrap().unwrap();
    assert_eq!(persisted.iteration_count, 30);
}

#[tokio::test(start_paused = true)]
async fn test_null_action_cannot_determine_next_step() {
    let h = harness(ScriptedModel::new([
        r#"{"thinking": "hmm", "nextAction": null, "goalCompleted": false}"#,
    ]));
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Failed(FailureKind::Planning));
    assert_eq!(state.status_message, "cannot determine next step");
    assert!(h.host.interactions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_third_identical_proposal_not_executed() {
    let click = step("click", "#noop", "", "tick remember me");
    let h = harness(ScriptedModel::new([
        click.clone(),
        click.clone(),
        click,
        done("done"),
    ]));
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(h.host.interactions(), vec!["click #noop", "click #noop"]);
    assert_eq!(state.action_history.len(), 2);
    let fourth = &h.model.requests()[3];
    assert!(fourth.messages[1].text.contains("several times in a row"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_primary_falls_back_and_promotes() {
    let stale = json!({
        "goalCompleted": false,
        "nextAction": {
            "action": "fill",
            "target": "#old-email",
            "value": "a@b.c",
            "description": "enter email",
            "fallbackTargets": ["#email"],
        },
    })
    .to_string();
    let h = harness(ScriptedModel::new([stale, done("filled")]));
    h.pilot
        .memory()
        .save_selector(LOGIN_URL, "enter email", "#old-email", true)
        .await
        .unwrap();
    let mut events = h.pilot.subscribe();

    h.pilot
        .start(h.target.clone(), "fill the email", RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Finished);

    let mut used_fallback = false;
    while let Ok(event) = events.try_recv() {
        if let AgentEvent::StepFinished { result, .. } = event {
            used_fallback = result.used_fallback;
            assert_eq!(result.used_selector.as_deref(), Some("#email"));
        }
    }
    assert!(used_fallback);

    let pattern = h
        .pilot
        .memory()
        .get_selector(LOGIN_URL, "enter email")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pattern.selector, "#email");
    assert_eq!(pattern.fallbacks, vec!["#old-email"]);
    assert_eq!(pattern.success_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_remembered_selector_rescues_stale_proposal() {
    let h = harness(ScriptedModel::new([
        step("fill", "#renamed-email", "a@b.c", "enter email"),
        done("filled"),
    ]));
    h.pilot
        .memory()
        .save_selector(LOGIN_URL, "enter email", "#email", true)
        .await
        .unwrap();
    h.pilot
        .start(h.target.clone(), "fill the email", RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(h.host.interactions(), vec!["fill #email=a@b.c"]);
    assert!(state.action_history[0].success);
    assert!(!state.action_history[0].repaired);
}

#[tokio::test(start_paused = true)]
async fn test_failed_step_repaired_by_vision() {
    let h = harness(ScriptedModel::new([
        step("fill", "#gone", "a@b.c", "enter email"),
        json!({
            "found": true,
            "selector": "#email",
            "confidence": 0.9,
            "alternativeSelectors": [],
        })
        .to_string(),
        done("filled"),
    ]));
    h.pilot
        .start(h.target.clone(), "fill the email", RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Finished);
    let record = &state.action_history[0];
    assert!(record.success);
    assert!(record.repaired);
    assert!(h.model.requests()[1].json_mode);
    let pattern = h
        .pilot
        .memory()
        .get_selector(LOGIN_URL, "enter email")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pattern.selector, "#email");
}

#[tokio::test(start_paused = true)]
async fn test_older_remembered_selector_rescues_stale_proposal() {
    let h = harness(ScriptedModel::new([
        step("fill", "#renamed-email", "a@b.c", "enter email"),
        done("filled"),
    ]));
    let memory = h.pilot.memory();
    memory
        .save_selector(LOGIN_URL, "enter email", "#email", true)
        .await
        .unwrap();
    memory
        .save_selector(LOGIN_URL, "enter email", "#email-v1", true)
        .await
        .unwrap();
    let before = memory
        .get_selector(LOGIN_URL, "enter email")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.selector, "#email-v1");
    assert_eq!(before.fallbacks, vec!["#email"]);

    let mut events = h.pilot.subscribe();
    h.pilot
        .start(h.target.clone(), "fill the email", RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(h.host.interactions(), vec!["fill #email=a@b.c"]);
    assert!(state.action_history[0].success);
    let mut used = None;
    while let Ok(event) = events.try_recv() {
        if let AgentEvent::StepFinished { result, .. } = event {
            assert!(result.used_fallback);
            used = result.used_selector;
        }
    }
    assert_eq!(used.as_deref(), Some("#email"));

    let after = memory
        .get_selector(LOGIN_URL, "enter email")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.selector, "#email");
    assert_eq!(after.fallbacks, vec!["#email-v1"]);
}

#[tokio::test(start_paused = true)]
async fn test_unobservable_page_during_repair_keeps_run_alive() {
    let h = harness(ScriptedModel::new([
        step("fill", "#gone", "a@b.c", "enter email"),
        done("gave up on the email"),
    ]));
    // The planning round observes once; the repair's observation fails.
    h.host.fail_observes(1, 1);
    h.pilot
        .start(h.target.clone(), "fill the email", RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(state.action_history.len(), 1);
    assert!(!state.action_history[0].success);
    assert!(!state.action_history[0].repaired);
    assert_eq!(h.model.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_immediate() {
    let h = harness(ScriptedModel::new([step("wait", "", "60000", "long pause")]));
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    wait_for_phase(&h.pilot, RunPhase::Executing).await;

    h.pilot.stop().await.unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Stopped);

    let persisted = h.pilot.get_status().await.unwrap().unwrap();
    assert_eq!(persisted.phase, RunPhase::Stopped);
    assert!(!persisted.active);
    assert_eq!(persisted.status_message, "stopped by user");
}

#[tokio::test(start_paused = true)]
async fn test_malformed_twice_fails() {
    let h = harness(ScriptedModel::new([
        "I would click the sign in button.",
        "still not json",
    ]));
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Failed(FailureKind::Planning));
    assert_eq!(h.model.call_count(), 2);
    assert!(h.model.requests()[1].messages[1]
        .text
        .contains("could not be parsed"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_once_then_recovers() {
    let h = harness(ScriptedModel::new([
        "```\n{\"goalCompleted\": fals".to_string(),
        done("already signed in"),
    ]));
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(state.malformed_streak, 1);
}

fn sensitive_click() -> String {
    json!({
        "goalCompleted": false,
        "nextAction": {
            "action": "click",
            "target": "#buy",
            "description": "place order",
            "requiresConfirmation": true,
        },
    })
    .to_string()
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_approved() {
    let config = PilotConfig {
        confirm_sensitive: true,
        ..Default::default()
    };
    let h = harness_with(
        ScriptedModel::new([sensitive_click(), done("ordered")]),
        config,
    );
    h.pilot
        .start(h.target.clone(), "buy it", RunMode::Agent)
        .await
        .unwrap();

    let parked = wait_for_phase(&h.pilot, RunPhase::WaitingForConfirm).await;
    assert!(parked.waiting_for_confirm);
    assert_eq!(parked.pending_step.as_ref().unwrap().target, "#buy");
    assert!(h.host.interactions().is_empty());

    h.pilot.confirm(true).await.unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(h.host.interactions(), vec!["click #buy"]);
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_declined() {
    let config = PilotConfig {
        confirm_sensitive: true,
        ..Default::default()
    };
    let h = harness_with(
        ScriptedModel::new([sensitive_click(), done("user declined")]),
        config,
    );
    h.pilot
        .start(h.target.clone(), "buy it", RunMode::Agent)
        .await
        .unwrap();
    wait_for_phase(&h.pilot, RunPhase::WaitingForConfirm).await;

    h.pilot.confirm(false).await.unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Finished);
    assert!(h.host.interactions().is_empty());
    assert_eq!(
        state.action_history[0].error.as_deref(),
        Some("declined by user")
    );
    assert!(h.model.requests()[1].messages[1].text.contains("declined"));
    assert!(h.pilot.confirm(true).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_template_replay_in_auto_mode() {
    let mut replies = login_script();
    replies.push(done("welcome message visible"));
    let h = harness_with(ScriptedModel::new(replies), with_user_memory());

    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Auto)
        .await
        .unwrap();
    assert_eq!(h.pilot.wait().await.unwrap().phase, RunPhase::Finished);
    assert_eq!(h.model.call_count(), 4);

    let second_tab = h.host.add_tab(login_page());
    h.pilot
        .start(second_tab.clone(), GOAL, RunMode::Auto)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(h.model.call_count(), 5);
    assert_eq!(state.action_history.len(), 3);
    assert_eq!(h.host.page(&second_tab).unwrap().url, "https://a.test/home");
    assert!(h.model.requests()[4].messages[1].text.contains("replayed"));

    let template = h
        .pilot
        .memory()
        .get_task_template(LOGIN_URL, GOAL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(template.success_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_new_start_supersedes_running_run() {
    let h = harness(ScriptedModel::new([done("nothing to do")]));
    let first = h
        .pilot
        .start(h.target.clone(), "first goal", RunMode::Agent)
        .await
        .unwrap();
    let second = h
        .pilot
        .start(h.target.clone(), "second goal", RunMode::Agent)
        .await
        .unwrap();
    assert_ne!(first, second);

    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.run_id, second);
    assert_eq!(state.phase, RunPhase::Finished);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let persisted = h.pilot.get_status().await.unwrap().unwrap();
    assert_eq!(persisted.run_id, second);
    assert_eq!(persisted.goal, "second goal");
    assert_eq!(h.model.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closed_tab_fails_run() {
    let h = harness(ScriptedModel::new([done("x")]));
    h.host.close_tab(&h.target);
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Failed(FailureKind::Environment));
    assert_eq!(state.status_message, "target page was closed");
    assert_eq!(h.model.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_model_error_fails_run() {
    let h = harness(ScriptedModel::new(Vec::<String>::new()).then_error("HTTP 401"));
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Failed(FailureKind::Model));
    assert!(state.status_message.contains("HTTP 401"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_load_event_times_out_and_continues() {
    let h = harness(ScriptedModel::new([
        step("click", "#login", "", "submit login"),
        done("logged in"),
    ]));
    h.host.silence_loads(true);
    let started = tokio::time::Instant::now();
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Agent)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();

    assert_eq!(state.phase, RunPhase::Finished);
    assert!(started.elapsed() >= Duration::from_millis(9000));
}

#[tokio::test(start_paused = true)]
async fn test_resume_rearms_load_wait() {
    let h = harness(ScriptedModel::new([done("home page reached")]));
    let mut crashed = RunState::new(h.target.clone(), GOAL, RunMode::Agent, 0);
    crashed.phase = RunPhase::WaitingForLoad;
    crashed.waiting_for_load = true;
    crashed.iteration_count = 3;
    h.kv.set(RUN_STATE_KEY, serde_json::to_value(&crashed).unwrap())
        .await
        .unwrap();

    let run_id = h.pilot.resume().await.unwrap();
    assert_eq!(run_id, crashed.run_id);
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(state.iteration_count, 4);

    assert!(h.pilot.resume().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_resume_while_live_takes_over_the_run() {
    let config = PilotConfig {
        confirm_sensitive: true,
        ..Default::default()
    };
    let h = harness_with(
        ScriptedModel::new([sensitive_click(), done("ordered")]),
        config,
    );
    let run_id = h
        .pilot
        .start(h.target.clone(), "buy it", RunMode::Agent)
        .await
        .unwrap();
    wait_for_phase(&h.pilot, RunPhase::WaitingForConfirm).await;

    assert_eq!(h.pilot.resume().await.unwrap(), run_id);
    let parked = h.pilot.get_status().await.unwrap().unwrap();
    assert!(parked.active);
    assert_eq!(parked.phase, RunPhase::WaitingForConfirm);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let still = h.pilot.get_status().await.unwrap().unwrap();
    assert_eq!(still.phase, RunPhase::WaitingForConfirm);

    h.pilot.confirm(true).await.unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.run_id, run_id);
    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(h.host.interactions(), vec!["click #buy"]);
}

#[tokio::test(start_paused = true)]
async fn test_script_mode_without_generator() {
    let h = harness(ScriptedModel::new(Vec::<String>::new()));
    h.pilot
        .start(h.target.clone(), GOAL, RunMode::Script)
        .await
        .unwrap();
    let state = h.pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Failed(FailureKind::Config));
    assert!(state.status_message.contains("script generator"));
}

struct FixedScript;

#[async_trait]
impl ScriptGenerator for FixedScript {
    async fn generate(
        &self,
        _goal: &str,
        page: &PageSummary,
        _model: &dyn ChatModel,
    ) -> eoka_pilot_core::Result<Vec<PlannedStep>> {
        let email = page.inputs[0].selector.clone();
        Ok(vec![
            PlannedStep::new(1, ActionKind::Fill, email).with_value("bob@example.com"),
            PlannedStep::new(2, ActionKind::Click, "#login"),
        ])
    }
}

#[tokio::test(start_paused = true)]
async fn test_script_mode_with_generator() {
    let host = Arc::new(FakeHost::new());
    let target = host.add_tab(login_page());
    let model = Arc::new(ScriptedModel::new(Vec::<String>::new()));
    let pilot = Pilot::builder(
        PilotConfig::default(),
        host.clone(),
        model.clone(),
        Arc::new(MemoryKv::new()),
    )
    .script_generator(Arc::new(FixedScript))
    .build();

    pilot.start(target, GOAL, RunMode::Script).await.unwrap();
    let state = pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(state.status_message, "script completed (2 steps)");
    assert_eq!(model.call_count(), 0);
    assert_eq!(
        host.interactions(),
        vec![
            "fill #email=bob@example.com",
            "click #login",
            "navigate https://a.test/home",
        ]
    );
}

/// Asks the model twice and records how long both answers took.
struct TwoDraftScript {
    gap: std::sync::Mutex<Option<Duration>>,
}

#[async_trait]
impl ScriptGenerator for TwoDraftScript {
    async fn generate(
        &self,
        goal: &str,
        _page: &PageSummary,
        model: &dyn ChatModel,
    ) -> eoka_pilot_core::Result<Vec<PlannedStep>> {
        let ask = || ChatRequest::new(vec![ChatMessage::user(goal)]);
        let started = tokio::time::Instant::now();
        model.complete(ask()).await?;
        model.complete(ask()).await?;
        *self.gap.lock().unwrap() = Some(started.elapsed());
        Ok(vec![PlannedStep::new(1, ActionKind::Click, "#login")])
    }
}

#[tokio::test(start_paused = true)]
async fn test_script_generator_calls_are_rate_limited() {
    let host = Arc::new(FakeHost::new());
    let target = host.add_tab(login_page());
    let model = Arc::new(ScriptedModel::new(["draft one", "draft two"]));
    let generator = Arc::new(TwoDraftScript {
        gap: std::sync::Mutex::new(None),
    });
    let pilot = Pilot::builder(
        PilotConfig::default(),
        host.clone(),
        model.clone(),
        Arc::new(MemoryKv::new()),
    )
    .script_generator(generator.clone())
    .build();

    pilot.start(target, GOAL, RunMode::Script).await.unwrap();
    let state = pilot.wait().await.unwrap();
    assert_eq!(state.phase, RunPhase::Finished);
    assert_eq!(model.call_count(), 2);
    let gap = generator.gap.lock().unwrap().expect("second call made");
    assert!(gap >= Duration::from_millis(500), "both calls took only {:?}", gap);
}

#[tokio::test]
async fn test_empty_goal_rejected() {
    let h = harness(ScriptedModel::new(Vec::<String>::new()));
    assert!(h
        .pilot
        .start(h.target.clone(), "   ", RunMode::Agent)
        .await
        .is_err());
    assert!(h.pilot.get_status().await.unwrap().is_none());
}
