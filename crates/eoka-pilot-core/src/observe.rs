//! Page observation: what can be filled, what can be clicked, what the page says.

use crate::config::LimitSettings;
use crate::host::{run_typed, Host, PageScript, RawObservation, TargetId};
use crate::{Error, Result};
use base64::Engine;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Browser-internal URL prefixes no script can run on.
const RESTRICTED_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "edge://",
    "about:",
    "view-source:",
    "devtools://",
];

const MAX_INPUTS: usize = 30;
const MAX_ACTIONABLES: usize = 50;
const MAX_TEXT_CHARS: usize = 2500;

const SCREENSHOT_MAX_WIDTH: u32 = 1280;
const SCREENSHOT_MAX_HEIGHT: u32 = 800;
const SCREENSHOT_QUALITY: u8 = 70;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSummary {
    pub key: String,
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub placeholder: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
    pub selector: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionableSummary {
    pub key: String,
    pub text: String,
    pub tag: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    pub selector: String,
}

/// Bounded description of the current page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub url: String,
    pub title: String,
    pub text: String,
    pub inputs: Vec<InputSummary>,
    pub actionables: Vec<ActionableSummary>,
    /// Browser-internal page; nothing on it can be automated.
    pub restricted: bool,
}

impl PageSummary {
    fn restricted(url: String, title: String) -> Self {
        Self {
            url,
            title,
            text: "This is a browser-internal page that cannot be automated. \
                   Navigate to a regular web page to continue."
                .into(),
            restricted: true,
            ..Default::default()
        }
    }

    fn from_raw(raw: RawObservation) -> Self {
        Self {
            url: raw.url,
            title: raw.title,
            text: truncate_chars(&raw.text, MAX_TEXT_CHARS),
            inputs: raw
                .inputs
                .into_iter()
                .take(MAX_INPUTS)
                .map(|i| InputSummary {
                    key: i.key,
                    input_type: i.input_type,
                    placeholder: i.placeholder,
                    label: i.label,
                    selector: i.selector,
                    disabled: i.disabled,
                    value: i.value,
                })
                .collect(),
            actionables: raw
                .actionables
                .into_iter()
                .take(MAX_ACTIONABLES)
                .map(|a| ActionableSummary {
                    key: a.key,
                    text: a.text,
                    tag: a.tag,
                    input_type: a.input_type,
                    selector: a.selector,
                })
                .collect(),
            restricted: false,
        }
    }

    /// Few enough elements that the page may still be rendering.
    pub fn looks_empty(&self) -> bool {
        self.inputs.is_empty() && self.actionables.len() < 2
    }
}

pub fn is_restricted_url(url: &str) -> bool {
    RESTRICTED_PREFIXES.iter().any(|p| url.starts_with(p))
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Downscale to fit 1280x800 and re-encode as JPEG quality 70.
pub fn compress_screenshot(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| Error::Host(format!("failed to decode screenshot: {}", e)))?;
    let (width, height) = img.dimensions();
    let img = if width > SCREENSHOT_MAX_WIDTH || height > SCREENSHOT_MAX_HEIGHT {
        img.resize(
            SCREENSHOT_MAX_WIDTH,
            SCREENSHOT_MAX_HEIGHT,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, SCREENSHOT_QUALITY)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)
        .map_err(|e| Error::Host(format!("failed to encode screenshot: {}", e)))?;
    Ok(out)
}

/// Produces [`PageSummary`]s through the host.
pub struct Observer {
    host: Arc<dyn Host>,
    timeout: Duration,
    reobserve_delay: Duration,
}

impl Observer {
    pub fn new(host: Arc<dyn Host>, limits: &LimitSettings) -> Self {
        Self {
            host,
            timeout: Duration::from_millis(limits.observe_timeout_ms),
            reobserve_delay: Duration::from_millis(limits.reobserve_delay_ms),
        }
    }

    /// Summarize the page. A page that looks empty is observed once more after
    /// a short delay; whatever comes back the second time is returned as-is.
    pub async fn observe(&self, target: &TargetId) -> Result<PageSummary> {
        let tab = self
            .host
            .tab_info(target)
            .await?
            .ok_or_else(|| Error::TargetClosed(target.to_string()))?;
        if is_restricted_url(&tab.url) {
            debug!("observe: restricted page {}", tab.url);
            return Ok(PageSummary::restricted(tab.url, tab.title));
        }

        let summary = self.observe_once(target).await?;
        if !summary.looks_empty() {
            return Ok(summary);
        }
        debug!(
            "observe: sparse page ({} inputs, {} actionables), retrying once",
            summary.inputs.len(),
            summary.actionables.len()
        );
        tokio::time::sleep(self.reobserve_delay).await;
        self.observe_once(target).await
    }

    async fn observe_once(&self, target: &TargetId) -> Result<PageSummary> {
        let raw: RawObservation = tokio::time::timeout(
            self.timeout,
            run_typed(self.host.as_ref(), target, &PageScript::Observe),
        )
        .await
        .map_err(|_| Error::Timeout(format!("observation exceeded {:?}", self.timeout)))??;
        Ok(PageSummary::from_raw(raw))
    }

    /// Visible viewport as a compressed JPEG data URL. Failures are logged and
    /// yield `None`; a screenshot is never required to proceed.
    pub async fn screenshot(&self, target: &TargetId) -> Option<String> {
        let raw = match self.host.capture_visible(target).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("screenshot failed: {}", e);
                return None;
            }
        };
        match compress_screenshot(&raw) {
            Ok(jpeg) => Some(format!(
                "data:image/jpeg;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(jpeg)
            )),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }
}
