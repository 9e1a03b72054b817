//! In-memory page host and scripted model for exercising the engine without a
//! browser or network.
//!
//! [`FakeHost`] interprets every [`PageScript`] against a small simulated DOM,
//! resolving `idx_N` / `btn_idx_N` in the same order the real observer emits
//! them. [`ScriptedModel`] replays canned answers and records what it was asked.

use crate::host::{
    ElementPresence, Host, InteractionOutcome, PageScript, RawActionable, RawInput, RawObservation,
    ScrollDirection, TabInfo, TargetId,
};
use crate::llm::{ChatModel, ChatRequest};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum FakeKind {
    Input { input_type: String },
    Select { options: Vec<String> },
    Button,
    Link { href: String },
}

/// One simulated element.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeElement {
    pub selector: String,
    /// Other selectors that also resolve to this element.
    pub aliases: Vec<String>,
    pub kind: FakeKind,
    pub key: String,
    pub text: String,
    pub placeholder: String,
    pub label: String,
    pub visible: bool,
    pub disabled: bool,
    pub value: String,
    /// Navigate here when clicked.
    pub navigates_to: Option<String>,
    /// Interactions that fail before one succeeds.
    pub flaky: u32,
}

impl FakeElement {
    fn base(selector: &str, kind: FakeKind) -> Self {
        Self {
            selector: selector.to_string(),
            aliases: Vec::new(),
            kind,
            key: String::new(),
            text: String::new(),
            placeholder: String::new(),
            label: String::new(),
            visible: true,
            disabled: false,
            value: String::new(),
            navigates_to: None,
            flaky: 0,
        }
    }

    pub fn input(selector: &str, key: &str) -> Self {
        let mut el = Self::base(
            selector,
            FakeKind::Input {
                input_type: "text".into(),
            },
        );
        el.key = key.to_string();
        el
    }

    pub fn password(selector: &str, key: &str) -> Self {
        let mut el = Self::input(selector, key);
        el.kind = FakeKind::Input {
            input_type: "password".into(),
        };
        el
    }

    pub fn select(selector: &str, key: &str, options: &[&str]) -> Self {
        let mut el = Self::base(
            selector,
            FakeKind::Select {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
        );
        el.key = key.to_string();
        el
    }

    pub fn button(selector: &str, text: &str) -> Self {
        let mut el = Self::base(selector, FakeKind::Button);
        el.text = text.to_string();
        el
    }

    pub fn link(selector: &str, text: &str, href: &str) -> Self {
        let mut el = Self::base(
            selector,
            FakeKind::Link {
                href: href.to_string(),
            },
        );
        el.text = text.to_string();
        el
    }

    pub fn alias(mut self, selector: &str) -> Self {
        self.aliases.push(selector.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn navigates_to(mut self, url: &str) -> Self {
        self.navigates_to = Some(url.to_string());
        self
    }

    pub fn flaky(mut self, failures: u32) -> Self {
        self.flaky = failures;
        self
    }

    fn matches(&self, selector: &str) -> bool {
        self.selector == selector || self.aliases.iter().any(|a| a == selector)
    }

    fn is_field(&self) -> bool {
        matches!(self.kind, FakeKind::Input { .. } | FakeKind::Select { .. })
    }

    fn is_actionable(&self) -> bool {
        matches!(self.kind, FakeKind::Button | FakeKind::Link { .. }) && !self.text.is_empty()
    }
}

/// One simulated document.
#[derive(Debug, Clone, PartialEq)]
pub struct FakePage {
    pub url: String,
    pub title: String,
    pub text: String,
    pub elements: Vec<FakeElement>,
}

impl FakePage {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
            text: String::new(),
            elements: Vec::new(),
        }
    }

    pub fn with(mut self, element: FakeElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn element(&self, selector: &str) -> Option<&FakeElement> {
        self.resolve(selector).map(|i| &self.elements[i])
    }

    /// Index of the element `selector` names, honoring pseudo-selectors.
    fn resolve(&self, selector: &str) -> Option<usize> {
        if let Some(n) = selector.strip_prefix("btn_idx_").and_then(|n| n.parse::<usize>().ok()) {
            return self.actionable_order().get(n).copied();
        }
        if let Some(n) = selector.strip_prefix("idx_").and_then(|n| n.parse::<usize>().ok()) {
            return self.field_order().get(n).copied();
        }
        self.elements.iter().position(|e| e.matches(selector))
    }

    fn field_order(&self) -> Vec<usize> {
        (0..self.elements.len())
            .filter(|&i| self.elements[i].visible && self.elements[i].is_field())
            .collect()
    }

    /// Buttons before links, each in document order.
    fn actionable_order(&self) -> Vec<usize> {
        let visible = |i: &usize| self.elements[*i].visible && self.elements[*i].is_actionable();
        let buttons = (0..self.elements.len())
            .filter(visible)
            .filter(|&i| self.elements[i].kind == FakeKind::Button);
        let links = (0..self.elements.len())
            .filter(visible)
            .filter(|&i| matches!(self.elements[i].kind, FakeKind::Link { .. }));
        buttons.chain(links).collect()
    }

    fn observe(&self) -> RawObservation {
        let inputs = self
            .field_order()
            .into_iter()
            .enumerate()
            .map(|(n, i)| {
                let el = &self.elements[i];
                let input_type = match &el.kind {
                    FakeKind::Input { input_type } => input_type.clone(),
                    _ => "select".to_string(),
                };
                RawInput {
                    key: if el.key.is_empty() {
                        format!("idx_{}", n)
                    } else {
                        el.key.clone()
                    },
                    value: if input_type == "password" {
                        String::new()
                    } else {
                        el.value.chars().take(20).collect()
                    },
                    input_type,
                    placeholder: el.placeholder.clone(),
                    label: el.label.clone(),
                    selector: el.selector.clone(),
                    disabled: el.disabled,
                }
            })
            .collect();
        let actionables = self
            .actionable_order()
            .into_iter()
            .enumerate()
            .map(|(n, i)| {
                let el = &self.elements[i];
                RawActionable {
                    key: format!("btn_idx_{}", n),
                    text: el.text.clone(),
                    tag: match el.kind {
                        FakeKind::Link { .. } => "a".into(),
                        _ => "button".into(),
                    },
                    input_type: None,
                    selector: el.selector.clone(),
                }
            })
            .collect();
        RawObservation {
            url: self.url.clone(),
            title: self.title.clone(),
            text: self.text.clone(),
            inputs,
            actionables,
        }
    }
}

struct FakeTab {
    page: FakePage,
    loading: bool,
}

#[derive(Default)]
struct FakeState {
    tabs: HashMap<TargetId, FakeTab>,
    sites: HashMap<String, FakePage>,
    log: Vec<String>,
    scripts: Vec<String>,
    next_tab: u32,
    silent_loads: bool,
    fail_capture: bool,
    observe_skips: u32,
    observe_failures: u32,
}

/// Simulated browser.
pub struct FakeHost {
    state: Mutex<FakeState>,
    loads: broadcast::Sender<TargetId>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        let (loads, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(FakeState::default()),
            loads,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open a tab showing `page`. The page is also registered as a site.
    pub fn add_tab(&self, page: FakePage) -> TargetId {
        let mut state = self.lock();
        state.next_tab += 1;
        let id = TargetId::new(format!("tab-{}", state.next_tab));
        state.sites.insert(page.url.clone(), page.clone());
        state.tabs.insert(
            id.clone(),
            FakeTab {
                page,
                loading: false,
            },
        );
        id
    }

    /// Register a page that navigation to its URL will load.
    pub fn add_site(&self, page: FakePage) {
        self.lock().sites.insert(page.url.clone(), page);
    }

    pub fn close_tab(&self, target: &TargetId) {
        self.lock().tabs.remove(target);
    }

    /// Stop emitting load-complete events, as pages that never settle do.
    pub fn silence_loads(&self, silent: bool) {
        self.lock().silent_loads = silent;
    }

    /// Let `skip` observations through, then fail the next `count` with a
    /// host error.
    pub fn fail_observes(&self, skip: u32, count: u32) {
        let mut state = self.lock();
        state.observe_skips = skip;
        state.observe_failures = count;
    }

    pub fn fail_capture(&self, fail: bool) {
        self.lock().fail_capture = fail;
    }

    /// Snapshot of the page currently shown in `target`.
    pub fn page(&self, target: &TargetId) -> Option<FakePage> {
        self.lock().tabs.get(target).map(|t| t.page.clone())
    }

    /// Mutate the live page in `target`.
    pub fn edit_page(&self, target: &TargetId, f: impl FnOnce(&mut FakePage)) {
        if let Some(tab) = self.lock().tabs.get_mut(target) {
            f(&mut tab.page);
        }
    }

    /// Human-readable log of successful interactions, e.g. `fill #email=a@b.c`.
    pub fn interactions(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// How many times a script with this name ran.
    pub fn script_count(&self, name: &str) -> usize {
        self.lock().scripts.iter().filter(|s| *s == name).count()
    }

    fn load(&self, state: &mut FakeState, target: &TargetId, url: &str) {
        let page = state
            .sites
            .get(url)
            .cloned()
            .unwrap_or_else(|| FakePage::new(url, ""));
        if let Some(tab) = state.tabs.get_mut(target) {
            tab.page = page;
            tab.loading = state.silent_loads;
        }
        state.log.push(format!("navigate {}", url));
        if !state.silent_loads {
            let _ = self.loads.send(target.clone());
        }
    }

    fn interact(&self, target: &TargetId, script: &PageScript) -> Result<InteractionOutcome> {
        let mut state = self.lock();
        let tab = state
            .tabs
            .get_mut(target)
            .ok_or_else(|| Error::TargetClosed(target.to_string()))?;

        let selector = match script {
            PageScript::Fill { selector, .. }
            | PageScript::Click { selector }
            | PageScript::Hover { selector }
            | PageScript::Select { selector, .. } => selector.clone(),
            PageScript::Scroll {
                direction,
                amount,
                selector,
            } => {
                let outcome = match (direction, selector) {
                    (ScrollDirection::To, Some(sel)) if tab.page.resolve(sel).is_none() => {
                        InteractionOutcome::failed(format!("element not found: {}", sel))
                    }
                    _ => InteractionOutcome::ok(),
                };
                if outcome.success {
                    state
                        .log
                        .push(format!("scroll {:?} {}", direction, amount).to_lowercase());
                }
                return Ok(outcome);
            }
            _ => return Err(Error::Host(format!("{} is not an interaction", script.name()))),
        };

        let Some(idx) = tab.page.resolve(&selector) else {
            return Ok(InteractionOutcome::failed(format!(
                "element not found: {}",
                selector
            )));
        };
        let el = &mut tab.page.elements[idx];
        if !el.visible {
            return Ok(InteractionOutcome::failed("element is hidden"));
        }
        if el.disabled {
            return Ok(InteractionOutcome::failed("element is disabled"));
        }
        if el.flaky > 0 {
            el.flaky -= 1;
            return Ok(InteractionOutcome::failed("element detached during interaction"));
        }

        let mut navigate = None;
        let mut outcome = InteractionOutcome::ok();
        let entry = match script {
            PageScript::Fill { value, .. } => {
                if !el.is_field() {
                    return Ok(InteractionOutcome::failed("element is not fillable"));
                }
                el.value = value.clone();
                format!("fill {}={}", el.selector, value)
            }
            PageScript::Click { .. } => {
                if let FakeKind::Link { href } = &el.kind {
                    outcome.is_link = true;
                    navigate = Some(href.clone());
                }
                if let Some(url) = &el.navigates_to {
                    navigate = Some(url.clone());
                }
                format!("click {}", el.selector)
            }
            PageScript::Hover { .. } => format!("hover {}", el.selector),
            PageScript::Select { value, .. } => {
                let FakeKind::Select { options } = &el.kind else {
                    return Ok(InteractionOutcome::failed("element is not a select"));
                };
                if !options.iter().any(|o| o == value) {
                    return Ok(InteractionOutcome::failed(format!("no option '{}'", value)));
                }
                el.value = value.clone();
                format!("select {}={}", el.selector, value)
            }
            _ => unreachable!("handled above"),
        };
        state.log.push(entry);
        if let Some(url) = navigate {
            self.load(&mut state, target, &url);
        }
        Ok(outcome)
    }
}

fn tiny_png() -> Result<Vec<u8>> {
    let img = image::RgbImage::from_pixel(32, 20, image::Rgb([240, 240, 240]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(
            &mut std::io::Cursor::new(&mut out),
            image::ImageOutputFormat::Png,
        )
        .map_err(|e| Error::Host(e.to_string()))?;
    Ok(out)
}

#[async_trait]
impl Host for FakeHost {
    async fn tab_info(&self, target: &TargetId) -> Result<Option<TabInfo>> {
        Ok(self.lock().tabs.get(target).map(|t| TabInfo {
            url: t.page.url.clone(),
            title: t.page.title.clone(),
            loading: t.loading,
        }))
    }

    async fn run_script(&self, target: &TargetId, script: &PageScript) -> Result<serde_json::Value> {
        self.lock().scripts.push(script.name().to_string());
        match script {
            PageScript::Observe => {
                let mut state = self.lock();
                if state.observe_skips > 0 {
                    state.observe_skips -= 1;
                } else if state.observe_failures > 0 {
                    state.observe_failures -= 1;
                    return Err(Error::Host("page is not responding".into()));
                }
                let tab = state
                    .tabs
                    .get(target)
                    .ok_or_else(|| Error::TargetClosed(target.to_string()))?;
                Ok(serde_json::to_value(tab.page.observe())?)
            }
            PageScript::Inspect { selector } => {
                let state = self.lock();
                let tab = state
                    .tabs
                    .get(target)
                    .ok_or_else(|| Error::TargetClosed(target.to_string()))?;
                let presence = match tab.page.element(selector) {
                    Some(el) => ElementPresence {
                        exists: true,
                        visible: el.visible,
                    },
                    None => ElementPresence::default(),
                };
                Ok(serde_json::to_value(presence)?)
            }
            _ => Ok(serde_json::to_value(self.interact(target, script)?)?),
        }
    }

    async fn navigate(&self, target: &TargetId, url: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.tabs.contains_key(target) {
            return Err(Error::TargetClosed(target.to_string()));
        }
        self.load(&mut state, target, url);
        Ok(())
    }

    async fn capture_visible(&self, target: &TargetId) -> Result<Vec<u8>> {
        {
            let state = self.lock();
            if state.fail_capture {
                return Err(Error::Host("capture not permitted".into()));
            }
            if !state.tabs.contains_key(target) {
                return Err(Error::TargetClosed(target.to_string()));
            }
        }
        tiny_png()
    }

    fn subscribe_loads(&self) -> broadcast::Receiver<TargetId> {
        self.loads.subscribe()
    }
}

enum Reply {
    Text(String),
    Error(String),
}

/// Model that answers from a queue, then repeats a fallback answer.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Option<String>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Reply::Text(r.into())).collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer with `reply` once the queue is exhausted.
    pub fn then_repeat(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Queue a provider error.
    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Reply::Error(message.into()));
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request);
        let next = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match next {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Error(message)) => Err(Error::Model(message)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| Error::Model("scripted model exhausted".into())),
        }
    }
}
