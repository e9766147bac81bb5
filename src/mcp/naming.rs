//! Tool names handed to the model must match `^[a-zA-Z0-9_-]+$` and be
//! unique across every connected server.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

const FALLBACK_NAME: &str = "tool";

fn invalid_chars() -> &'static Regex {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("static regex"))
}

/// Replaces every character outside `[a-zA-Z0-9_-]` with `_`.
pub fn sanitize_tool_name(name: &str) -> String {
    let sanitized = invalid_chars().replace_all(name, "_").into_owned();
    if sanitized.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        sanitized
    }
}

/// Registry of names already handed out to the model.
#[derive(Debug, Default)]
pub struct ToolNameRegistry {
    used: HashSet<String>,
}

impl ToolNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitizes `name` and suffixes `_2`, `_3`, ... until it is unused.
    pub fn register(&mut self, name: &str) -> String {
        let base = sanitize_tool_name(name);
        let mut candidate = base.clone();
        let mut index = 1;
        while self.used.contains(&candidate) {
            index += 1;
            candidate = format!("{}_{}", base, index);
        }
        self.used.insert(candidate.clone());
        candidate
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}
