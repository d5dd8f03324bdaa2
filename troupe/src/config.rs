//! Parsed bot-package structures.
//!
//! The gateway-side loader validates and parses the authored YAML; the core
//! receives the resulting JSON structure and deserializes it into these
//! types. Assembly errors are typed and fail before the first message.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::BuildError;

/// Connection settings for the OpenAI-compatible chat provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfig {
    /// Model identifier; defaults to `gpt-4`.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Nucleus sampling parameter.
    pub top_p: Option<f64>,
    /// Presence penalty.
    pub presence_penalty: Option<f64>,
    /// Frequency penalty.
    pub frequency_penalty: Option<f64>,
    /// Maximum completion tokens.
    pub max_tokens: Option<u32>,
    /// Chat-completions endpoint; defaults to the OpenAI API.
    pub server: Option<String>,
    /// Bearer token used when `headers` is not given.
    pub api_key: Option<String>,
    /// Fully custom request headers.
    pub headers: Option<HashMap<String, String>>,
}

/// One agent declaration from the bot package.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentDecl {
    /// Agent type: `"flow agent"`, `"llm agent"`, `"ensemble agent"` or
    /// `"kb agent"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// One-line description used by selection prompts.
    #[serde(default)]
    pub description: Option<String>,
    /// Step program (flow agents) or init steps (ensemble agents).
    #[serde(default)]
    pub steps: Option<Vec<Value>>,
    /// Instruction prompt (LLM agents).
    #[serde(default)]
    pub prompt: Option<String>,
    /// Declared argument slots.
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    /// Names of tool functions the agent may call.
    #[serde(default)]
    pub uses: Option<Vec<String>>,
    /// Candidate agents (ensemble agents); entries may carry arg bindings.
    #[serde(default)]
    pub contains: Option<Vec<Value>>,
    /// Fallback agent: `"default"`, an agent name, or `{policy: text}`.
    #[serde(default)]
    pub fallback: Option<Value>,
    /// Exit agent: `"default"`, an agent name, or `{policy: text}`.
    #[serde(default)]
    pub exit: Option<Value>,
    /// FAQ entries (kb agents).
    #[serde(default)]
    pub faq: Option<Vec<FaqEntry>>,
    /// Document paths (kb agents); indexing is a collaborator concern.
    #[serde(default)]
    pub file: Option<Value>,
    /// Web sources (kb agents); loading is a collaborator concern.
    #[serde(default)]
    pub web: Option<Value>,
    /// Mixed path/url sources (kb agents).
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    /// Retrieval result count (kb agents).
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Minimum similarity score (kb agents).
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
}

/// One question/answer pair in a knowledge base.
#[derive(Debug, Clone, Deserialize)]
pub struct FaqEntry {
    /// The question.
    pub q: String,
    /// The answer.
    pub a: String,
}

/// The `main` entrypoint block.
#[derive(Debug, Clone, Deserialize)]
pub struct MainDecl {
    /// Initialization steps; conventionally a single `call` of the root
    /// ensemble, optionally carrying a `schedule` field.
    pub steps: Vec<Value>,
}

impl MainDecl {
    /// The declared scheduling policy, defaulting to `priority`.
    #[must_use]
    pub fn schedule(&self) -> &str {
        self.steps
            .first()
            .and_then(|s| s.get("schedule"))
            .and_then(Value::as_str)
            .unwrap_or("priority")
    }
}

/// The whole parsed bot package: `main` plus the named agents.
#[derive(Debug, Clone)]
pub struct BotPackage {
    /// The entrypoint declaration.
    pub main: MainDecl,
    /// Agent declarations by name.
    pub agents: Vec<(String, AgentDecl)>,
}

impl BotPackage {
    /// Split a parsed package value into the entrypoint and agent
    /// declarations, preserving declaration order.
    ///
    /// # Errors
    ///
    /// Fails when the structure is not an object, `main` is missing or
    /// malformed, or an agent entry cannot be deserialized.
    pub fn from_value(data: &Value) -> Result<Self, BuildError> {
        let Some(map) = data.as_object() else {
            return Err(BuildError::InvalidPackage(
                "bot package must be a JSON object".to_owned(),
            ));
        };
        let main_value = map
            .get("main")
            .ok_or_else(|| BuildError::InvalidPackage("missing 'main' entry".to_owned()))?;
        let main: MainDecl = serde_json::from_value(main_value.clone())
            .map_err(|e| BuildError::InvalidPackage(format!("invalid 'main' entry: {e}")))?;

        let mut agents = Vec::new();
        for (name, value) in map {
            if name == "main" || name == "tools" {
                continue;
            }
            let decl: AgentDecl = serde_json::from_value(value.clone()).map_err(|e| {
                BuildError::InvalidPackage(format!("invalid agent '{name}': {e}"))
            })?;
            agents.push((name.clone(), decl));
        }
        Ok(Self { main, agents })
    }
}

/// Extract declared argument names.
///
/// Entries are either bare strings or single-key maps carrying extra
/// authoring detail; only the name matters to the runtime.
#[must_use]
pub fn arg_names(args: Option<&Vec<Value>>) -> Vec<String> {
    let Some(args) = args else {
        return Vec::new();
    };
    args.iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(name.clone()),
            Value::Object(map) => map.keys().next().cloned(),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn package_splits_main_and_agents() {
        let data = json!({
            "main": {"steps": [{"call": "meta", "schedule": "priority"}]},
            "meta": {"type": "ensemble agent", "contains": ["book"]},
            "book": {"type": "llm agent", "prompt": "Book tables."},
        });
        let package = BotPackage::from_value(&data).unwrap();
        assert_eq!(package.main.schedule(), "priority");
        assert_eq!(package.agents.len(), 2);
    }

    #[test]
    fn missing_main_fails_fast() {
        let err = BotPackage::from_value(&json!({"a": {"type": "llm agent"}})).unwrap_err();
        assert!(matches!(err, BuildError::InvalidPackage(_)));
    }

    #[test]
    fn arg_names_handle_both_shapes() {
        let args = vec![json!("date"), json!({"city": "where to book"})];
        assert_eq!(arg_names(Some(&args)), vec!["date", "city"]);
        assert!(arg_names(None).is_empty());
    }
}
