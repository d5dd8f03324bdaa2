//! The model adapter contract.
//!
//! Any text+tool-call generation backend can drive the runtime by
//! implementing [`Model`]. Returned events are limited to
//! [`Event::BotUtter`] and [`Event::FunctionCall`]; everything else the
//! runtime derives itself.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::error::ModelError;
use crate::event::Event;
use crate::message::ChatMessage;

/// Stream of incremental reply text for streaming-capable backends.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

/// A tool function schema attached to a generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Name of the callable function.
    pub name: String,
    /// What the function does, shown to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the keyword arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl FunctionSpec {
    /// Create a schema-less function spec.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: None,
        }
    }
}

/// The core trait for language-model backends.
///
/// Implementations translate one prompt (plus optional tool schemas) into a
/// list of events. Transport failures should be reported as
/// [`ModelError::Transport`]; callers absorb them into an empty event list so
/// a turn never crashes on a flaky provider.
#[async_trait]
pub trait Model: Send + Sync {
    /// Identifier of the underlying model (e.g. "gpt-4o").
    fn model_id(&self) -> &str;

    /// Generate events for the given conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be reached or answers with an
    /// unusable payload.
    async fn generate_message(
        &self,
        messages: Vec<ChatMessage>,
        functions: &[FunctionSpec],
        provider: Option<&str>,
    ) -> Result<Vec<Event>, ModelError>;

    /// Generate a streaming response.
    ///
    /// The default implementation falls back to non-streaming generation
    /// and yields the reply texts as one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying generation fails.
    async fn generate_stream(
        &self,
        messages: Vec<ChatMessage>,
        functions: &[FunctionSpec],
        provider: Option<&str>,
    ) -> Result<ModelStream, ModelError> {
        let events = self.generate_message(messages, functions, provider).await?;
        let texts: Vec<Result<String, ModelError>> = events
            .into_iter()
            .filter_map(|event| match event {
                Event::BotUtter { text, .. } => Some(Ok(text)),
                _ => None,
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(texts)))
    }

    /// Whether the backend supports incremental streaming natively.
    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Call the model, absorbing transport failures into an empty event list.
///
/// A failed generation is a no-progress step by design: the interpreter
/// treats the empty list like a no-op and outer fallback logic takes over.
pub async fn generate_or_empty(
    model: &dyn Model,
    messages: Vec<ChatMessage>,
    functions: &[FunctionSpec],
    provider: Option<&str>,
) -> Vec<Event> {
    match model.generate_message(messages, functions, provider).await {
        Ok(events) => events,
        Err(e) => {
            warn!(model = model.model_id(), error = %e, "model generation failed");
            Vec::new()
        }
    }
}

/// Leniently recover a JSON object from model output.
///
/// Tries a strict parse first, then scans for the first balanced `{...}`
/// region that parses, and finally wraps the whole text as `{"bot": text}`.
/// The recovery rules live here and nowhere else.
#[must_use]
pub fn recover_json(text: &str) -> Map<String, Value> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return map;
    }

    for (start, _) in text.char_indices().filter(|&(_, c)| c == '{') {
        if let Some(candidate) = balanced_object(&text[start..])
            && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate)
        {
            return map;
        }
    }

    let mut map = Map::new();
    map.insert("bot".to_owned(), json!(text));
    map
}

/// Find the shortest balanced `{...}` prefix of `text`, if any.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
