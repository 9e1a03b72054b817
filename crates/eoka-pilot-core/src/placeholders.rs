//! `{{memory.key}}` substitution from user-supplied facts.

use crate::state::PlannedStep;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Facts the user wants available to steps, keyed by name.
pub type UserMemory = BTreeMap<String, String>;

static LINE_RE: OnceLock<Regex> = OnceLock::new();
static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn line_re() -> &'static Regex {
    LINE_RE.get_or_init(|| Regex::new(r"^\s*(\w+)\s*[:=]\s*(.+?)\s*$").unwrap())
}

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{\{memory\.(\w+)\}\}").unwrap())
}

/// Parse `key: value` and `key=value` lines. Other lines are ignored.
pub fn parse_user_memory(text: &str) -> UserMemory {
    text.lines()
        .filter_map(|line| line_re().captures(line))
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

fn substitute(text: &str, memory: &UserMemory) -> String {
    placeholder_re()
        .replace_all(text, |caps: &regex::Captures| {
            memory
                .get(&caps[1])
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Copy of `step` with placeholders in `target` and `value` filled in.
/// Unknown keys stay literal.
pub fn resolve_placeholders(step: &PlannedStep, memory: &UserMemory) -> PlannedStep {
    let mut resolved = step.clone();
    if !memory.is_empty() {
        resolved.target = substitute(&step.target, memory);
        resolved.value = substitute(&step.value, memory);
    }
    resolved
}
