//! Argument references and string interpolation.
//!
//! A reference is either `arg` (resolved within the active agent) or
//! `agent.arg`. Bot utterances may embed `${arg}` / `${agent.arg}`
//! placeholders which render through the variable store; unresolved
//! placeholders become empty strings.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::tracker::Tracker;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex is valid")
});

/// A parsed `agent.arg` (or bare `arg`) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgRef {
    /// Explicit agent qualifier, if any.
    pub agent: Option<String>,
    /// The argument name.
    pub arg: String,
}

impl ArgRef {
    /// Parse a reference, splitting on the last dot.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.rsplit_once('.') {
            Some((agent, arg)) if !agent.is_empty() && !arg.is_empty() => Self {
                agent: Some(agent.to_owned()),
                arg: arg.to_owned(),
            },
            _ => Self {
                agent: None,
                arg: raw.to_owned(),
            },
        }
    }

    /// The agent this reference resolves against, given the active agent.
    #[must_use]
    pub fn agent_or<'a>(&'a self, default_agent: &'a str) -> &'a str {
        self.agent.as_deref().unwrap_or(default_agent)
    }

    /// Look the reference up in the variable store.
    #[must_use]
    pub fn lookup(&self, tracker: &Tracker, default_agent: &str) -> Option<Value> {
        tracker.get_arg(self.agent_or(default_agent), &self.arg)
    }
}

/// Render a value for interpolation and history display.
///
/// Strings render bare (no quotes), null renders empty, everything else
/// uses its JSON representation.
#[must_use]
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `${...}` placeholders against the store, scoped to `agent`.
///
/// References that do not resolve, or resolve to null, render as "".
#[must_use]
pub fn interpolate(text: &str, agent: &str, tracker: &Tracker) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let reference = ArgRef::parse(caps[1].trim());
            reference
                .lookup(tracker, agent)
                .map(|v| stringify(&v))
                .unwrap_or_default()
        })
        .into_owned()
}
