//! The page-control boundary. A [`Host`] owns the real browser; the engine
//! only ever asks it to run one of the typed [`PageScript`]s.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Opaque handle to the single tab a run drives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of tab metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub url: String,
    pub title: String,
    pub loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Down,
    Up,
    /// Scroll the element named by `selector` into view.
    To,
}

/// Functions the engine injects into the page.
///
/// Every selector accepts the pseudo-selectors `idx_N` (N-th visible input)
/// and `btn_idx_N` (N-th visible actionable), counted in the observer's query
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PageScript {
    /// Enumerate inputs, actionables and visible text. Returns [`RawObservation`].
    Observe,
    /// Set a field's value and fire focus/input/change. Returns [`InteractionOutcome`].
    Fill { selector: String, value: String },
    /// Scroll into view, dispatch pointer events, click. Returns [`InteractionOutcome`].
    Click { selector: String },
    /// Dispatch mouseenter/mouseover. Returns [`InteractionOutcome`].
    Hover { selector: String },
    /// Choose an option of a `<select>` by value or text. Returns [`InteractionOutcome`].
    Select { selector: String, value: String },
    /// Returns [`InteractionOutcome`].
    Scroll {
        direction: ScrollDirection,
        amount: i64,
        selector: Option<String>,
    },
    /// Existence and visibility of an element. Returns [`ElementPresence`].
    Inspect { selector: String },
}

impl PageScript {
    pub fn name(&self) -> &'static str {
        match self {
            PageScript::Observe => "observe",
            PageScript::Fill { .. } => "fill",
            PageScript::Click { .. } => "click",
            PageScript::Hover { .. } => "hover",
            PageScript::Select { .. } => "select",
            PageScript::Scroll { .. } => "scroll",
            PageScript::Inspect { .. } => "inspect",
        }
    }
}

/// Raw observation as produced by the page script, before trimming.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub url: String,
    pub title: String,
    pub text: String,
    pub inputs: Vec<RawInput>,
    pub actionables: Vec<RawActionable>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    pub key: String,
    pub input_type: String,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub label: String,
    pub selector: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawActionable {
    pub key: String,
    pub text: String,
    pub tag: String,
    #[serde(default)]
    pub input_type: Option<String>,
    pub selector: String,
}

/// Result of an element interaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// The clicked element was a link with an href.
    #[serde(default)]
    pub is_link: bool,
}

impl InteractionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            is_link: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementPresence {
    pub exists: bool,
    pub visible: bool,
}

/// Browser integration the engine drives.
#[async_trait]
pub trait Host: Send + Sync {
    /// Current tab metadata, or `None` if the tab no longer exists.
    async fn tab_info(&self, target: &TargetId) -> Result<Option<TabInfo>>;

    /// Run one page script and return its JSON result.
    async fn run_script(&self, target: &TargetId, script: &PageScript) -> Result<serde_json::Value>;

    /// Start navigating the tab. Does not wait for the load to finish.
    async fn navigate(&self, target: &TargetId, url: &str) -> Result<()>;

    /// Screenshot of the visible viewport, in any format `image` can decode.
    async fn capture_visible(&self, target: &TargetId) -> Result<Vec<u8>>;

    /// Load-complete notifications, one message per finished load.
    fn subscribe_loads(&self) -> broadcast::Receiver<TargetId>;
}

/// Run a script and decode its result.
pub(crate) async fn run_typed<T: DeserializeOwned>(
    host: &dyn Host,
    target: &TargetId,
    script: &PageScript,
) -> Result<T> {
    let value = host.run_script(target, script).await?;
    serde_json::from_value(value).map_err(|e| {
        Error::Host(format!("{} script returned unexpected shape: {}", script.name(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_script_wire_shape() {
        let script = PageScript::Fill {
            selector: "#email".into(),
            value: "a@b.c".into(),
        };
        assert_eq!(
            serde_json::to_value(&script).unwrap(),
            json!({"op": "fill", "selector": "#email", "value": "a@b.c"})
        );
        let scroll: PageScript =
            serde_json::from_value(json!({"op": "scroll", "direction": "down", "amount": 500, "selector": null}))
                .unwrap();
        assert_eq!(scroll.name(), "scroll");
    }

    #[test]
    fn test_outcome_defaults() {
        let outcome: InteractionOutcome = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(outcome.success);
        assert!(!outcome.is_link);
        assert!(outcome.error.is_none());
    }
}
