//! Vision-assisted recovery of a selector that stopped matching.

use crate::config::ModelConfig;
use crate::host::{run_typed, ElementPresence, Host, PageScript, TargetId};
use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::observe::{truncate_chars, Observer, PageSummary};
use crate::planner::extract_json;
use crate::state::PlannedStep;
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const REPAIR_INPUTS: usize = 15;
const REPAIR_ACTIONABLES: usize = 20;
const REPAIR_TEXT_CHARS: usize = 500;
const ALTERNATIVE_PENALTY: f64 = 0.8;

const SYSTEM_PROMPT: &str = "You analyze screenshots of web pages and locate elements. \
Reply with JSON only.";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairResult {
    pub success: bool,
    pub new_selector: Option<String>,
    /// Other proposed selectors that also matched a visible element.
    pub alternative_selectors: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
}

impl RepairResult {
    fn failed(reasoning: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Located {
    found: bool,
    selector: Option<String>,
    confidence: Option<f64>,
    alternative_selectors: Vec<String>,
    reasoning: String,
}

pub struct SelectorRepair {
    host: Arc<dyn Host>,
    observer: Arc<Observer>,
    model: Arc<dyn ChatModel>,
    model_name: String,
    max_tokens: u32,
    temperature: f32,
}

impl SelectorRepair {
    pub fn new(
        host: Arc<dyn Host>,
        observer: Arc<Observer>,
        model: Arc<dyn ChatModel>,
        config: &ModelConfig,
    ) -> Self {
        Self {
            host,
            observer,
            model,
            model_name: config.vision_model().to_string(),
            max_tokens: config.vision_max_tokens,
            temperature: config.temperature,
        }
    }

    /// Ask the vision model where `failed`'s element went and verify its
    /// answer against the live page. A miss is reported, never retried. Only a
    /// closed tab is an error.
    pub async fn repair(&self, target: &TargetId, failed: &PlannedStep) -> Result<RepairResult> {
        info!("repair: locating '{}'", failed.memory_name());
        let page = match self.observer.observe(target).await {
            Ok(page) => page,
            Err(e @ Error::TargetClosed(_)) => return Err(e),
            Err(e) => {
                warn!("repair: could not observe the page: {}", e);
                return Ok(RepairResult::failed(e.to_string()));
            }
        };
        let screenshot = self.observer.screenshot(target).await;

        let mut user = ChatMessage::user(self.prompt(failed, &page));
        if let Some(shot) = screenshot {
            user = user.with_image(shot);
        }
        let mut request = ChatRequest::new(vec![ChatMessage::system(SYSTEM_PROMPT), user]);
        request.model = Some(self.model_name.clone());
        request.max_tokens = self.max_tokens;
        request.temperature = self.temperature;
        request.json_mode = true;

        let raw = match self.model.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("repair: vision model failed: {}", e);
                return Ok(RepairResult::failed(e.to_string()));
            }
        };
        let located: Located = match extract_json(&raw).map(|j| serde_json::from_str(&j)) {
            Some(Ok(located)) => located,
            _ => {
                debug!("repair: unusable answer");
                return Ok(RepairResult::failed("vision answer could not be parsed"));
            }
        };

        let tried = failed.candidates();
        let fresh = |s: &String| !s.trim().is_empty() && !tried.contains(s);
        let base_confidence = located.confidence.unwrap_or(0.5).clamp(0.0, 1.0);

        if located.found {
            if let Some(primary) = located.selector.as_ref().filter(|s| fresh(s)) {
                if self.verify(target, primary).await? {
                    info!("repair: '{}' verified", primary);
                    let mut alternatives = Vec::new();
                    for alt in located
                        .alternative_selectors
                        .iter()
                        .filter(|s| fresh(s) && *s != primary)
                    {
                        if self.verify(target, alt).await? {
                            alternatives.push(alt.clone());
                        }
                    }
                    return Ok(RepairResult {
                        success: true,
                        new_selector: Some(primary.clone()),
                        alternative_selectors: alternatives,
                        confidence: base_confidence,
                        reasoning: located.reasoning,
                    });
                }
            }
        }
        for alt in located.alternative_selectors.iter().filter(|s| fresh(s)) {
            if self.verify(target, alt).await? {
                info!("repair: alternative '{}' verified", alt);
                return Ok(RepairResult {
                    success: true,
                    new_selector: Some(alt.clone()),
                    alternative_selectors: Vec::new(),
                    confidence: base_confidence * ALTERNATIVE_PENALTY,
                    reasoning: "used an alternative selector".into(),
                });
            }
        }
        warn!("repair: no proposed selector matched a visible element");
        Ok(RepairResult::failed(if located.reasoning.is_empty() {
            "no proposed selector matched".to_string()
        } else {
            located.reasoning
        }))
    }

    async fn verify(&self, target: &TargetId, selector: &str) -> Result<bool> {
        let script = PageScript::Inspect {
            selector: selector.to_string(),
        };
        match run_typed::<ElementPresence>(self.host.as_ref(), target, &script).await {
            Ok(presence) => Ok(presence.exists && presence.visible),
            Err(e @ Error::TargetClosed(_)) => Err(e),
            Err(e) => {
                debug!("repair: inspecting '{}' failed: {}", selector, e);
                Ok(false)
            }
        }
    }

    fn prompt(&self, failed: &PlannedStep, page: &PageSummary) -> String {
        let description = if failed.description.trim().is_empty() {
            format!("the target of a {} action", failed.action)
        } else {
            failed.description.trim().to_string()
        };
        let inputs: Vec<_> = page
            .inputs
            .iter()
            .filter(|i| !i.disabled)
            .take(REPAIR_INPUTS)
            .map(|i| {
                json!({
                    "type": i.input_type,
                    "placeholder": i.placeholder,
                    "label": i.label,
                    "selector": i.selector,
                })
            })
            .collect();
        let buttons: Vec<_> = page
            .actionables
            .iter()
            .take(REPAIR_ACTIONABLES)
            .map(|a| json!({ "text": truncate_chars(&a.text, 30), "tag": a.tag, "selector": a.selector }))
            .collect();

        format!(
            r#"# Locate an element

Find this element on the page: "{description}"
The selector `{failed}` no longer works.

## Page
- URL: {url}
- Title: {title}

### Inputs
{inputs}

### Buttons and links
{buttons}

### Text
{text}

Using the screenshot and the structure above, give the most likely CSS selector.

Answer format (JSON):
{{
  "found": true | false,
  "selector": "CSS selector",
  "confidence": 0.0,
  "alternativeSelectors": ["other candidates, best first"],
  "reasoning": "why"
}}"#,
            description = description,
            failed = failed.target,
            url = page.url,
            title = page.title,
            inputs = serde_json::to_string_pretty(&inputs).unwrap_or_default(),
            buttons = serde_json::to_string_pretty(&buttons).unwrap_or_default(),
            text = truncate_chars(&page.text, REPAIR_TEXT_CHARS),
        )
    }
}
