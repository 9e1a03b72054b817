//! Next-step planning: prompt construction, response repair and parsing, and
//! repeated-proposal detection.

use crate::config::{MemorySettings, ModelConfig};
use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::memory::DomainMemory;
use crate::observe::{truncate_chars, PageSummary};
use crate::state::{ActionKind, ActionRecord, PlannedStep};
use crate::Result;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

const PROMPT_INPUTS: usize = 15;
const PROMPT_ACTIONABLES: usize = 25;
const PROMPT_TEXT_CHARS: usize = 1000;
const EXCERPT_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are a browser automation expert. Plan only the next \
single step; you will see its result before choosing another. Reply with one JSON object \
and nothing else.";

/// What the model decided this round.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    /// The goal is reached.
    Completed { reason: String },
    /// Execute `step` next. `confidence` and `remaining` are advisory only.
    Next {
        step: PlannedStep,
        thinking: String,
        confidence: Option<f64>,
        remaining: Option<u32>,
    },
    /// Valid answer, but no action and not complete.
    NoAction { thinking: String },
    /// Nothing usable could be recovered from the answer.
    Malformed { excerpt: String },
}

/// Everything the planner looks at for one round.
pub struct PlanInput<'a> {
    pub goal: &'a str,
    pub page: &'a PageSummary,
    pub history: &'a [ActionRecord],
    pub memory: &'a DomainMemory,
    /// Corrective note carried over from the previous round.
    pub notice: Option<&'a str>,
    /// Names usable as `{{memory.name}}` placeholders.
    pub user_keys: Vec<&'a str>,
    pub screenshot: Option<String>,
}

pub struct Planner {
    model: Arc<dyn ChatModel>,
    max_tokens: u32,
    temperature: f32,
    hint_confidence: f64,
    max_hints: usize,
}

impl Planner {
    pub fn new(model: Arc<dyn ChatModel>, config: &ModelConfig, memory: &MemorySettings) -> Self {
        Self {
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            hint_confidence: memory.hint_confidence,
            max_hints: memory.max_hints,
        }
    }

    /// Ask the model for the next step. Each streamed fragment is passed to
    /// `on_delta`. Model errors propagate; unusable answers become
    /// [`PlanDecision::Malformed`].
    pub async fn plan_next(
        &self,
        input: PlanInput<'_>,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<PlanDecision> {
        let prompt = self.build_prompt(&input);
        let mut user = ChatMessage::user(prompt);
        if let Some(shot) = input.screenshot {
            user = user.with_image(shot);
        }
        let mut request = ChatRequest::new(vec![ChatMessage::system(SYSTEM_PROMPT), user]);
        request.max_tokens = self.max_tokens;
        request.temperature = self.temperature;

        let raw = self.model.stream(request, on_delta).await?;
        let next_id = input.history.len() as u32 + 1;
        let decision = parse_decision(&raw, next_id);
        if let PlanDecision::Malformed { excerpt } = &decision {
            warn!("planner: unusable answer: {}", excerpt);
        }
        Ok(decision)
    }

    pub fn build_prompt(&self, input: &PlanInput<'_>) -> String {
        let page = input.page;
        let inputs: Vec<_> = page.inputs.iter().take(PROMPT_INPUTS).collect();
        let actionables: Vec<_> = page.actionables.iter().take(PROMPT_ACTIONABLES).collect();

        let mut p = String::new();
        let _ = writeln!(p, "# Goal\n\"{}\"\n", input.goal);
        let _ = writeln!(p, "# Current page\n- URL: {}\n- Title: {}\n", page.url, page.title);
        let _ = writeln!(
            p,
            "## Inputs\n{}\n",
            serde_json::to_string_pretty(&inputs).unwrap_or_default()
        );
        let _ = writeln!(
            p,
            "## Buttons and links\n{}\n",
            serde_json::to_string_pretty(&actionables).unwrap_or_default()
        );
        let _ = writeln!(p, "## Page text\n{}\n", truncate_chars(&page.text, PROMPT_TEXT_CHARS));

        p.push_str("# Steps so far\n");
        if input.history.is_empty() {
            p.push_str("(none yet)\n");
        }
        for (i, record) in input.history.iter().enumerate() {
            let label = if record.description.is_empty() {
                format!("{} {}", record.action, record.target)
            } else {
                record.description.clone()
            };
            let outcome = if record.success { "success" } else { "failed" };
            let _ = writeln!(p, "{}. {} -> {}", i + 1, label, outcome);
        }

        p.push_str("\n# Known selectors\n");
        let hints = input.memory.hints(self.hint_confidence, self.max_hints);
        if hints.is_empty() {
            p.push_str("(none)\n");
        }
        for (name, pattern) in hints {
            let _ = writeln!(p, "- {}: {}", name, pattern.selector);
        }

        if !input.user_keys.is_empty() {
            p.push_str("\n# User facts\nUse these placeholders instead of guessing values: ");
            let keys: Vec<String> = input
                .user_keys
                .iter()
                .map(|k| format!("{{{{memory.{}}}}}", k))
                .collect();
            p.push_str(&keys.join(", "));
            p.push('\n');
        }

        if let Some(notice) = input.notice {
            let _ = writeln!(p, "\n# Notice\n{}", notice);
        }

        p.push_str(
            r#"
# Task
Decide whether the goal is already complete. If it is not, choose the single next action.

# Answer format (JSON only)
{
  "thinking": "short analysis of the current state",
  "goalCompleted": true | false,
  "completionReason": "why the goal is complete, if it is",
  "nextAction": {
    "action": "navigate" | "fill" | "click" | "wait" | "scroll" | "hover" | "select" | null,
    "target": "CSS selector, element key, or URL",
    "value": "text to enter, option, wait condition or scroll direction",
    "description": "what this step does",
    "fallbackTargets": ["other selectors for the same element"],
    "requiresConfirmation": false
  },
  "confidence": 0.0,
  "estimatedRemainingSteps": 0
}

Rules:
- nextAction is null when the goal is complete.
- Act first and observe the result next round; never assume what a click will do.
- Set requiresConfirmation for purchases, deletions, or sending messages.
"#,
        );
        p
    }
}

/// Pull the first JSON object out of `raw`: strips code fences and prose and
/// closes brackets and strings left open by a truncated stream.
pub fn extract_json(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let body = &raw[start..];

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
                if stack.is_empty() {
                    return Some(body[..=i].to_string());
                }
            }
            _ => {}
        }
    }

    // Truncated: close whatever is open.
    let mut repaired = body.trim_end().to_string();
    if in_string {
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    } else {
        while repaired.ends_with(',') {
            repaired.pop();
        }
        if repaired.ends_with(':') {
            repaired.push_str("null");
        }
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    Some(repaired)
}

fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn lenient_strings<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) if !s.trim().is_empty() => vec![s],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .filter(|s| !s.trim().is_empty())
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<bool, D::Error> {
    Ok(truthy(&Value::deserialize(de)?))
}

fn lenient_millis<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<u64>, D::Error> {
    Ok(as_number(&Value::deserialize(de)?)
        .filter(|n| *n >= 0.0)
        .map(|n| n as u64))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    #[serde(default, deserialize_with = "lenient_string")]
    thinking: String,
    #[serde(default)]
    goal_completed: Value,
    #[serde(default, deserialize_with = "lenient_string")]
    completion_reason: String,
    #[serde(default)]
    next_action: Option<RawAction>,
    #[serde(default)]
    confidence: Value,
    #[serde(default)]
    estimated_remaining_steps: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    #[serde(default, deserialize_with = "lenient_string")]
    action: String,
    #[serde(default, deserialize_with = "lenient_string")]
    target: String,
    #[serde(default, deserialize_with = "lenient_string")]
    value: String,
    #[serde(default, deserialize_with = "lenient_string")]
    description: String,
    #[serde(default, deserialize_with = "lenient_strings")]
    fallback_targets: Vec<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    requires_confirmation: bool,
    #[serde(default, deserialize_with = "lenient_millis")]
    timeout_ms: Option<u64>,
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn malformed(raw: &str) -> PlanDecision {
    PlanDecision::Malformed {
        excerpt: truncate_chars(raw.trim(), EXCERPT_CHARS),
    }
}

/// Interpret a raw model answer. `next_id` becomes the proposed step's id.
pub fn parse_decision(raw: &str, next_id: u32) -> PlanDecision {
    let Some(json) = extract_json(raw) else {
        return malformed(raw);
    };
    let plan: RawPlan = match serde_json::from_str(&json) {
        Ok(plan) => plan,
        Err(e) => {
            debug!("planner: json rejected: {}", e);
            return malformed(raw);
        }
    };

    if truthy(&plan.goal_completed) {
        return PlanDecision::Completed {
            reason: plan.completion_reason,
        };
    }
    let Some(action) = plan.next_action.filter(|a| !a.action.trim().is_empty()) else {
        return PlanDecision::NoAction {
            thinking: plan.thinking,
        };
    };
    let Ok(kind) = action.action.parse::<ActionKind>() else {
        return malformed(raw);
    };

    let mut step = PlannedStep::new(next_id, kind, action.target.trim())
        .with_value(action.value)
        .with_description(action.description.trim());
    step.fallback_targets = action.fallback_targets;
    step.requires_confirmation = action.requires_confirmation;
    step.timeout_ms = action.timeout_ms;

    PlanDecision::Next {
        step,
        thinking: plan.thinking,
        confidence: as_number(&plan.confidence).map(|c| c.clamp(0.0, 1.0)),
        remaining: as_number(&plan.estimated_remaining_steps).map(|n| n.max(0.0) as u32),
    }
}

/// Sliding window of proposal signatures used to spot a model repeating itself.
#[derive(Debug, Clone)]
pub struct ProposalWindow {
    recent: Vec<String>,
    threshold: usize,
}

impl ProposalWindow {
    pub fn new(recent: Vec<String>, threshold: usize) -> Self {
        Self {
            recent,
            threshold: threshold.max(2),
        }
    }

    /// Record `step`. Returns true when it completes a run of `threshold`
    /// identical consecutive proposals and must not be executed.
    pub fn record(&mut self, step: &PlannedStep) -> bool {
        self.recent.push(step.signature());
        if self.recent.len() > self.threshold {
            let excess = self.recent.len() - self.threshold;
            self.recent.drain(..excess);
        }
        self.recent.len() == self.threshold && self.recent.iter().all(|s| s == &self.recent[0])
    }

    pub fn into_inner(self) -> Vec<String> {
        self.recent
    }
}

pub(crate) fn loop_notice(step: &PlannedStep) -> String {
    format!(
        "You proposed `{} {}` several times in a row without progress. It was not executed \
         again. Choose a different action or target.",
        step.action, step.target
    )
}

pub(crate) const MALFORMED_NOTICE: &str = "Your previous answer could not be parsed. \
Reply with exactly one JSON object in the documented format and nothing else.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::ScriptedModel;
    use crate::memory::SelectorPattern;
    use crate::observe::{ActionableSummary, InputSummary};
    use std::sync::Mutex;

    fn page() -> PageSummary {
        PageSummary {
            url: "https://a.test/login".into(),
            title: "Login".into(),
            text: "x".repeat(3000),
            inputs: (0..20)
                .map(|i| InputSummary {
                    key: format!("idx_{}", i),
                    input_type: "text".into(),
                    selector: format!("#in{}", i),
                    ..Default::default()
                })
                .collect(),
            actionables: vec![ActionableSummary {
                key: "btn_idx_0".into(),
                text: "Sign in".into(),
                tag: "button".into(),
                input_type: None,
                selector: "#go".into(),
            }],
            restricted: false,
        }
    }

    fn planner(model: Arc<dyn ChatModel>) -> Planner {
        Planner::new(model, &ModelConfig::default(), &MemorySettings::default())
    }

    #[test]
    fn test_extract_json_fenced_and_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"a\": {\"b\": \"}\"}}\n```\nthanks";
        assert_eq!(extract_json(raw).unwrap(), "{\"a\": {\"b\": \"}\"}}");
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn test_extract_json_truncated() {
        let raw = r##"{"thinking": "fill the email", "nextAction": {"action": "fill", "target": "#em"##;
        let fixed = extract_json(raw).unwrap();
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["nextAction"]["target"], "#em");

        let v: Value =
            serde_json::from_str(&extract_json(r#"{"a": [1, 2,"#).unwrap()).unwrap();
        assert_eq!(v["a"][1], 2);
        let v: Value = serde_json::from_str(&extract_json(r#"{"a": 1, "b":"#).unwrap()).unwrap();
        assert!(v["b"].is_null());
    }

    #[test]
    fn test_parse_next_step() {
        let raw = r#"{"thinking":"t","goalCompleted":false,"nextAction":{"action":"Fill","target":" #email ","value":"a@b.c","description":"enter email"},"confidence":"0.8","estimatedRemainingSteps":3}"#;
        match parse_decision(raw, 4) {
            PlanDecision::Next {
                step,
                confidence,
                remaining,
                ..
            } => {
                assert_eq!(step.id, 4);
                assert_eq!(step.action, ActionKind::Fill);
                assert_eq!(step.target, "#email");
                assert_eq!(step.description, "enter email");
                assert_eq!(confidence, Some(0.8));
                assert_eq!(remaining, Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_wait_numeric_value() {
        let raw = r#"{"nextAction":{"action":"wait","target":"","value":2000}}"#;
        let PlanDecision::Next { step, .. } = parse_decision(raw, 1) else {
            panic!("expected step");
        };
        assert_eq!(step.value, "2000");
    }

    #[test]
    fn test_parse_tolerates_loose_optional_fields() {
        let raw = r##"{"goalCompleted":false,"nextAction":{"action":"click","target":"#go","fallbackTargets":null,"requiresConfirmation":null}}"##;
        let PlanDecision::Next { step, .. } = parse_decision(raw, 1) else {
            panic!("expected step");
        };
        assert!(step.fallback_targets.is_empty());
        assert!(!step.requires_confirmation);

        let raw = r##"{"nextAction":{"action":"click","target":"#buy","fallbackTargets":"btn_idx_2","requiresConfirmation":"true"}}"##;
        let PlanDecision::Next { step, .. } = parse_decision(raw, 1) else {
            panic!("expected step");
        };
        assert_eq!(step.fallback_targets, vec!["btn_idx_2".to_string()]);
        assert!(step.requires_confirmation);

        let raw = r##"{"nextAction":{"action":"wait","target":"#done","requiresConfirmation":"false","timeoutMs":"2500","fallbackTargets":["#a", 3, ""]}}"##;
        let PlanDecision::Next { step, .. } = parse_decision(raw, 1) else {
            panic!("expected step");
        };
        assert!(!step.requires_confirmation);
        assert_eq!(step.timeout_ms, Some(2500));
        assert_eq!(step.fallback_targets, vec!["#a".to_string()]);
    }

    #[test]
    fn test_parse_completion_and_null_action() {
        let done = parse_decision(r#"{"goalCompleted":true,"completionReason":"logged in"}"#, 1);
        assert_eq!(
            done,
            PlanDecision::Completed {
                reason: "logged in".into()
            }
        );
        let none = parse_decision(r#"{"nextAction": null, "goalCompleted": false}"#, 1);
        assert!(matches!(none, PlanDecision::NoAction { .. }));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_decision("I think you should click the button", 1),
            PlanDecision::Malformed { .. }
        ));
        assert!(matches!(
            parse_decision(r#"{"nextAction":{"action":"teleport","target":"x"}}"#, 1),
            PlanDecision::Malformed { .. }
        ));
    }

    #[test]
    fn test_window_blocks_third_identical() {
        let step = PlannedStep::new(1, ActionKind::Click, "#go");
        let other = PlannedStep::new(2, ActionKind::Click, "#other");
        let mut window = ProposalWindow::new(Vec::new(), 3);
        assert!(!window.record(&step));
        assert!(!window.record(&step));
        assert!(window.record(&step));

        let mut window = ProposalWindow::new(Vec::new(), 3);
        assert!(!window.record(&step));
        assert!(!window.record(&other));
        assert!(!window.record(&step));
        assert!(!window.record(&step));
        assert!(window.record(&step));
    }

    #[test]
    fn test_prompt_bounds_and_hints() {
        let mut memory = DomainMemory::new(0);
        for (name, conf) in [("login button", 0.9), ("weak", 0.5)] {
            memory.selectors.insert(
                name.into(),
                SelectorPattern {
                    selector: format!("#{}", name.replace(' ', "-")),
                    fallbacks: vec![],
                    success_count: 1,
                    fail_count: 0,
                    confidence: conf,
                    last_success: None,
                    last_used: 0,
                },
            );
        }
        let history = vec![ActionRecord {
            iteration: 1,
            action: ActionKind::Fill,
            target: "#in0".into(),
            value: "secret".into(),
            description: "enter email".into(),
            success: true,
            error: None,
            repaired: false,
        }];
        let page = page();
        let prompt = planner(Arc::new(ScriptedModel::new(Vec::<String>::new()))).build_prompt(
            &PlanInput {
                goal: "log in",
                page: &page,
                history: &history,
                memory: &memory,
                notice: Some("try something else"),
                user_keys: vec!["email"],
                screenshot: None,
            },
        );
        assert!(prompt.contains("#in14"));
        assert!(!prompt.contains("#in15"));
        assert!(prompt.contains("1. enter email -> success"));
        assert!(!prompt.contains("secret"));
        assert!(prompt.contains("- login button: #login-button"));
        assert!(!prompt.contains("#weak"));
        assert!(prompt.contains("{{memory.email}}"));
        assert!(prompt.contains("try something else"));
        assert!(!prompt.contains(&"x".repeat(1001)));
    }

    #[tokio::test]
    async fn test_plan_next_streams_and_attaches_screenshot() {
        let model = Arc::new(ScriptedModel::new([
            r#"```json
{"thinking":"done","goalCompleted":true,"completionReason":"ok"}
```"#,
        ]));
        let page = page();
        let memory = DomainMemory::new(0);
        let seen = Mutex::new(String::new());
        let decision = planner(model.clone())
            .plan_next(
                PlanInput {
                    goal: "g",
                    page: &page,
                    history: &[],
                    memory: &memory,
                    notice: None,
                    user_keys: vec![],
                    screenshot: Some("data:image/jpeg;base64,AA".into()),
                },
                &|d: &str| seen.lock().unwrap().push_str(d),
            )
            .await
            .unwrap();
        assert!(matches!(decision, PlanDecision::Completed { .. }));
        assert!(seen.lock().unwrap().contains("goalCompleted"));
        let request = &model.requests()[0];
        assert_eq!(request.messages[1].images.len(), 1);
        assert_eq!(request.max_tokens, 1500);
    }
}
