use crate::{Error, Result};
use std::collections::HashMap;

/// Values substituted into `${var}` references when a config is loaded.
///
/// Lookup order is explicit params first, then the process environment.
/// Unknown references are left untouched.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, String>,
    use_env: bool,
}

impl Params {
    /// Params that also fall back to environment variables.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            use_env: true,
        }
    }

    /// Params that never read the environment.
    pub fn isolated() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.values.get(key) {
            return Some(v.clone());
        }
        if self.use_env {
            return std::env::var(key).ok();
        }
        None
    }

    /// Parse from CLI args like "key=value".
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut params = Self::new();
        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                Error::Config(format!("invalid param '{}', expected key=value", arg))
            })?;
            params.values.insert(key.to_string(), value.to_string());
        }
        Ok(params)
    }
}

/// Substitute `${var}` patterns in a string.
pub fn substitute(template: &str, params: &Params) -> String {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(offset) = result[start..].find("${") {
        let var_start = start + offset;
        let Some(len) = result[var_start..].find('}') else {
            break;
        };
        let var_end = var_start + len;
        let name = &result[var_start + 2..var_end];

        match params.get(name) {
            Some(value) => {
                result.replace_range(var_start..=var_end, &value);
                start = var_start + value.len();
            }
            None => start = var_end + 1,
        }
    }

    result
}

/// Recursively substitute params in every string of a YAML document.
pub fn substitute_value(value: &mut serde_yaml::Value, params: &Params) {
    match value {
        serde_yaml::Value::String(s) => *s = substitute(s, params),
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, params);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                substitute_value(v, params);
            }
        }
        _ => {}
    }
}
