//! Deterministic step execution with per-selector retries and fallbacks.

use crate::config::ExecutorSettings;
use crate::host::{
    run_typed, ElementPresence, Host, InteractionOutcome, PageScript, ScrollDirection, TargetId,
};
use crate::state::{ActionKind, PlannedStep};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of executing one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepResult {
    pub success: bool,
    pub error: Option<String>,
    /// A fallback target, not the primary, was the one that worked.
    pub used_fallback: bool,
    pub used_selector: Option<String>,
    /// Failed attempts before the outcome.
    pub retries: u32,
    /// The step started a page load the loop must wait for.
    pub caused_navigation: bool,
}

impl StepResult {
    pub(crate) fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

enum WaitCondition<'a> {
    UrlContains(&'a str),
    ElementVisible(&'a str),
    ElementGone(&'a str),
    PageLoad,
    Delay(u64),
}

impl<'a> WaitCondition<'a> {
    fn parse(value: &str, target: &'a str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "url_contains" => WaitCondition::UrlContains(target),
            "element_visible" => WaitCondition::ElementVisible(target),
            "element_gone" => WaitCondition::ElementGone(target),
            "page_load" => WaitCondition::PageLoad,
            other => WaitCondition::Delay(other.parse().unwrap_or(1000)),
        }
    }
}

/// Normalize a navigation target into an absolute URL.
fn navigation_url(target: &str) -> Result<String> {
    let target = target.trim();
    if target.is_empty() {
        return Err(Error::ActionFailed("navigate needs a URL".into()));
    }
    match url::Url::parse(target) {
        Ok(u) => Ok(u.to_string()),
        Err(_) if !target.contains("://") => url::Url::parse(&format!("https://{}", target))
            .map(|u| u.to_string())
            .map_err(|e| Error::ActionFailed(format!("invalid URL '{}': {}", target, e))),
        Err(e) => Err(Error::ActionFailed(format!("invalid URL '{}': {}", target, e))),
    }
}

pub struct Executor {
    host: Arc<dyn Host>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(host: Arc<dyn Host>, settings: ExecutorSettings) -> Self {
        Self { host, settings }
    }

    /// Execute `step` against `target`.
    ///
    /// Element failures are reported in the returned [`StepResult`]; only a
    /// closed tab surfaces as an error.
    pub async fn execute(&self, target: &TargetId, step: &PlannedStep) -> Result<StepResult> {
        match step.action {
            ActionKind::Navigate => {
                info!("navigate: {}", step.target);
                let url = match navigation_url(&step.target) {
                    Ok(url) => url,
                    Err(e) => return Ok(StepResult::failed(e.to_string())),
                };
                self.host.navigate(target, &url).await?;
                Ok(StepResult {
                    caused_navigation: true,
                    used_selector: Some(url),
                    ..StepResult::ok()
                })
            }
            ActionKind::Fill => {
                info!("fill: {}", step.target);
                self.with_candidates(target, step, |selector| PageScript::Fill {
                    selector,
                    value: step.value.clone(),
                })
                .await
            }
            ActionKind::Click => {
                info!("click: {}", step.target);
                let before = self.host.tab_info(target).await?.map(|t| t.url);
                let mut result = self
                    .with_candidates(target, step, |selector| PageScript::Click { selector })
                    .await?;
                if result.success && !result.caused_navigation {
                    let after = self.host.tab_info(target).await?;
                    result.caused_navigation = match (before, after) {
                        (Some(b), Some(a)) => a.loading || a.url != b,
                        _ => false,
                    };
                }
                Ok(result)
            }
            ActionKind::Hover => {
                debug!("hover: {}", step.target);
                self.with_candidates(target, step, |selector| PageScript::Hover { selector })
                    .await
            }
            ActionKind::Select => {
                info!("select: {} = '{}'", step.target, step.value);
                self.with_candidates(target, step, |selector| PageScript::Select {
                    selector,
                    value: step.value.clone(),
                })
                .await
            }
            ActionKind::Wait => self.wait(target, step).await,
            ActionKind::Scroll => self.scroll(target, step).await,
        }
    }

    /// Try the primary target then each fallback, `max_retries` times each,
    /// backing off `backoff_ms * (retry + 1)` between tries of one selector.
    async fn with_candidates(
        &self,
        target: &TargetId,
        step: &PlannedStep,
        script: impl Fn(String) -> PageScript,
    ) -> Result<StepResult> {
        let candidates = step.candidates();
        if candidates.is_empty() {
            return Ok(StepResult::failed(format!("{} needs a target selector", step.action)));
        }

        let tries = self.settings.max_retries.max(1);
        let mut failures = 0u32;
        let mut last_error = String::new();
        for (i, selector) in candidates.iter().enumerate() {
            for retry in 0..tries {
                let attempt =
                    run_typed::<InteractionOutcome>(self.host.as_ref(), target, &script(selector.clone()))
                        .await;
                match attempt {
                    Ok(outcome) if outcome.success => {
                        if i > 0 {
                            info!("{}: fallback '{}' worked", step.action, selector);
                        }
                        return Ok(StepResult {
                            success: true,
                            error: None,
                            used_fallback: i > 0,
                            used_selector: Some(selector.clone()),
                            retries: failures,
                            caused_navigation: outcome.is_link,
                        });
                    }
                    Ok(outcome) => {
                        last_error = outcome.error.unwrap_or_else(|| "interaction failed".into());
                    }
                    Err(e @ Error::TargetClosed(_)) => return Err(e),
                    Err(e) => last_error = e.to_string(),
                }
                failures += 1;
                debug!(
                    "{} '{}' attempt {}/{} failed: {}",
                    step.action,
                    selector,
                    retry + 1,
                    tries,
                    last_error
                );
                if retry + 1 < tries {
                    let backoff = self.settings.backoff_ms * u64::from(retry + 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }

        warn!("{}: every selector failed for '{}'", step.action, step.target);
        Ok(StepResult {
            retries: failures,
            ..StepResult::failed(format!(
                "{} failed: no selector worked ({} tried, last error: {})",
                step.action,
                candidates.len(),
                last_error
            ))
        })
    }

    async fn wait(&self, target: &TargetId, step: &PlannedStep) -> Result<StepResult> {
        let condition = WaitCondition::parse(&step.value, step.target.trim());
        if let WaitCondition::Delay(ms) = condition {
            debug!("wait: {}ms", ms);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(StepResult::ok());
        }

        let timeout = Duration::from_millis(step.timeout_ms.unwrap_or(self.settings.default_timeout_ms));
        let poll = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        debug!("wait: {} {} (timeout {:?})", step.value, step.target, timeout);
        let start = Instant::now();
        loop {
            if self.condition_met(target, &condition).await? {
                return Ok(StepResult::ok());
            }
            if start.elapsed() >= timeout {
                return Ok(StepResult::failed(format!(
                    "wait timeout: {} {}",
                    step.value.trim(),
                    step.target.trim()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn condition_met(&self, target: &TargetId, condition: &WaitCondition<'_>) -> Result<bool> {
        let tab = self
            .host
            .tab_info(target)
            .await?
            .ok_or_else(|| Error::TargetClosed(target.to_string()))?;
        Ok(match condition {
            WaitCondition::UrlContains(part) => tab.url.contains(part),
            WaitCondition::PageLoad => !tab.loading,
            WaitCondition::ElementVisible(selector) => self.inspect(target, selector).await?.visible,
            WaitCondition::ElementGone(selector) => {
                let presence = self.inspect(target, selector).await?;
                !presence.exists || !presence.visible
            }
            WaitCondition::Delay(_) => true,
        })
    }

    async fn inspect(&self, target: &TargetId, selector: &str) -> Result<ElementPresence> {
        let script = PageScript::Inspect {
            selector: selector.to_string(),
        };
        match run_typed::<ElementPresence>(self.host.as_ref(), target, &script).await {
            Ok(presence) => Ok(presence),
            Err(e @ Error::TargetClosed(_)) => Err(e),
            Err(e) => {
                debug!("inspecting '{}' failed: {}", selector, e);
                Ok(ElementPresence::default())
            }
        }
    }

    async fn scroll(&self, target: &TargetId, step: &PlannedStep) -> Result<StepResult> {
        let direction = match step.value.trim().to_ascii_lowercase().as_str() {
            "up" => ScrollDirection::Up,
            "to" => ScrollDirection::To,
            _ => ScrollDirection::Down,
        };
        let (amount, selector) = match direction {
            ScrollDirection::To => (0, Some(step.target.trim().to_string())),
            _ => (
                step.target
                    .trim()
                    .parse::<i64>()
                    .unwrap_or(self.settings.default_scroll_px),
                None,
            ),
        };
        debug!("scroll: {:?} x{}", direction, amount);
        let outcome: InteractionOutcome = run_typed(
            self.host.as_ref(),
            target,
            &PageScript::Scroll {
                direction,
                amount,
                selector,
            },
        )
        .await?;
        tokio::time::sleep(Duration::from_millis(self.settings.scroll_delay_ms)).await;
        Ok(if outcome.success {
            StepResult::ok()
        } else {
            StepResult::failed(outcome.error.unwrap_or_else(|| "scroll failed".into()))
        })
    }
}
