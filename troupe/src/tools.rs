//! Tool-function plumbing.
//!
//! The sandboxed user-code executor is an external collaborator; this module
//! defines its contract ([`ToolExecutor`]) and translates the tool-result
//! protocol back into conversation events and slot writes.
//!
//! The result protocol is a JSON list whose items are one of
//! `{"bot": text}`, `{"arg": name, "value": v}` or
//! `{"status": "success"|"error", "msg": ...}`. Any other shape logs an
//! error and yields no events at all.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::error;

use crate::event::Event;
use crate::model::FunctionSpec;

/// Description of one callable tool function, used for prompt generation.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Function name.
    pub name: String,
    /// What the function does.
    pub description: String,
    /// JSON-schema properties of the keyword arguments.
    pub args: Value,
    /// Names of required arguments.
    pub required: Vec<String>,
}

impl ToolDescriptor {
    /// Create a descriptor with no arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: json!({}),
            required: Vec::new(),
        }
    }

    /// Attach argument schema properties and the required-name list.
    #[must_use]
    pub fn with_args(mut self, args: Value, required: Vec<String>) -> Self {
        self.args = args;
        self.required = required;
        self
    }

    /// Names of all declared arguments.
    #[must_use]
    pub fn arg_names(&self) -> Vec<String> {
        self.args
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Render as a function schema for the model adapter.
    #[must_use]
    pub fn function_spec(&self) -> FunctionSpec {
        let parameters = self.args.as_object().filter(|m| !m.is_empty()).map(|m| {
            json!({
                "type": "object",
                "properties": m,
                "required": self.required,
            })
        });
        FunctionSpec {
            name: self.name.clone(),
            description: (!self.description.is_empty()).then(|| self.description.clone()),
            parameters,
        }
    }
}

/// Completion status of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    /// The function ran to completion.
    Success,
    /// The function raised or could not be found.
    Error,
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Completion status.
    pub status: ToolStatus,
    /// The structured result list (the protocol above), when produced.
    pub result: Option<Value>,
    /// Captured standard output; non-empty stdout re-enters the LLM loop.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Executor-reported error message, when `status` is `Error`.
    pub error: Option<String>,
}

impl ToolOutcome {
    /// A successful outcome with a structured result.
    #[must_use]
    pub fn success(result: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            result: Some(result),
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        }
    }

    /// A failed outcome carrying the executor's error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            result: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(message.into()),
        }
    }

    /// Attach captured stdout.
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }
}

/// Contract of the sandboxed tool-function executor.
///
/// The executor loads a user-provided script once at bot load; the runtime
/// only ever asks it for descriptors (prompt generation) and invocations.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Descriptor of a named function, if loaded.
    fn get(&self, name: &str) -> Option<ToolDescriptor>;

    /// Names of all loaded functions.
    fn names(&self) -> Vec<String>;

    /// Invoke a function with keyword arguments.
    async fn execute(&self, name: &str, kwargs: Map<String, Value>) -> ToolOutcome;
}

/// Translate a tool-result list into events attributed to `provider`.
///
/// Slot items come back as [`Event::SetSlot`]; the caller applies them to
/// the tracker, resolving unqualified names against itself.
#[must_use]
pub fn translate_result(provider: &str, result: &Value) -> Vec<Event> {
    let Some(items) = result.as_array() else {
        error!(provider, "tool result is not a list; dropping it");
        return Vec::new();
    };

    let mut events = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else {
            error!(provider, "tool result item is not an object; dropping the result");
            return Vec::new();
        };
        if let Some(text) = obj.get("bot").and_then(Value::as_str) {
            events.push(Event::bot_utter(text, provider));
        } else if let Some(arg) = obj.get("arg").and_then(Value::as_str) {
            let value = obj.get("value").cloned().unwrap_or(Value::Null);
            events.push(Event::set_slot(arg, value, provider));
        } else if let Some(status) = obj.get("status").and_then(Value::as_str) {
            let msg = obj.get("msg").cloned().unwrap_or(Value::Null);
            match status {
                "success" => events.push(Event::agent_complete_with(provider, msg)),
                "error" => events.push(Event::agent_fail_with(provider, msg)),
                other => {
                    error!(provider, status = other, "unknown tool result status");
                    return Vec::new();
                }
            }
        } else {
            error!(provider, item = %item, "unrecognized tool result item");
            return Vec::new();
        }
    }
    events
}

type ToolFn = Arc<dyn Fn(Map<String, Value>) -> ToolOutcome + Send + Sync>;

/// A [`ToolExecutor`] backed by in-process closures.
///
/// Stands in for the sandboxed script executor in tests and in embedders
/// that implement their tools natively.
#[derive(Default)]
pub struct InProcessExecutor {
    descriptors: HashMap<String, ToolDescriptor>,
    functions: HashMap<String, ToolFn>,
}

impl fmt::Debug for InProcessExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessExecutor")
            .field("functions", &self.descriptors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InProcessExecutor {
    /// Create an empty executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under its descriptor.
    #[must_use]
    pub fn with_function(
        mut self,
        descriptor: ToolDescriptor,
        function: impl Fn(Map<String, Value>) -> ToolOutcome + Send + Sync + 'static,
    ) -> Self {
        self.functions
            .insert(descriptor.name.clone(), Arc::new(function));
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        self
    }
}

#[async_trait]
impl ToolExecutor for InProcessExecutor {
    fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.descriptors.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.descriptors.keys().cloned().collect()
    }

    async fn execute(&self, name: &str, kwargs: Map<String, Value>) -> ToolOutcome {
        match self.functions.get(name) {
            Some(f) => f(kwargs),
            None => ToolOutcome::error(format!("function '{name}' not found")),
        }
    }
}
