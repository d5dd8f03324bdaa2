//! OpenAI-compatible chat-completions provider.
//!
//! Speaks the `/chat/completions` wire format, so any compatible endpoint
//! works by overriding `server` in the [`LlmConfig`]. Transport and HTTP
//! failures are reported as [`ModelError::Transport`]; the runtime absorbs
//! them into an empty event list.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::config::LlmConfig;
use crate::error::{BuildError, ModelError};
use crate::event::Event;
use crate::message::ChatMessage;
use crate::model::{FunctionSpec, Model};

const DEFAULT_SERVER: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// OpenAI-compatible chat model client.
#[derive(Debug)]
pub struct OpenAiModel {
    model: String,
    temperature: f64,
    top_p: f64,
    presence_penalty: f64,
    frequency_penalty: f64,
    max_tokens: u32,
    server: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl OpenAiModel {
    /// Build a client from connection settings.
    ///
    /// # Errors
    ///
    /// Fails when neither `api_key` nor custom `headers` are provided, or
    /// the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self, BuildError> {
        let headers = match (&config.headers, &config.api_key) {
            (Some(headers), _) => headers.clone(),
            (None, Some(api_key)) => HashMap::from([
                ("Content-Type".to_owned(), "application/json".to_owned()),
                ("Authorization".to_owned(), format!("Bearer {api_key}")),
            ]),
            (None, None) => {
                return Err(BuildError::ModelConfiguration(
                    "either api_key or headers must be configured".to_owned(),
                ));
            }
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BuildError::ModelConfiguration(e.to_string()))?;
        Ok(Self {
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            temperature: config.temperature.unwrap_or(0.2),
            top_p: config.top_p.unwrap_or(0.8),
            presence_penalty: config.presence_penalty.unwrap_or(0.1),
            frequency_penalty: config.frequency_penalty.unwrap_or(0.1),
            max_tokens: config.max_tokens.unwrap_or(512),
            server: config.server.clone().unwrap_or_else(|| DEFAULT_SERVER.to_owned()),
            headers,
            client,
        })
    }

    fn request_body(&self, messages: &[ChatMessage], functions: &[FunctionSpec]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "presence_penalty": self.presence_penalty,
            "frequency_penalty": self.frequency_penalty,
            "max_tokens": self.max_tokens,
        });
        if !functions.is_empty() {
            let tools: Vec<Value> = functions
                .iter()
                .map(|f| json!({"type": "function", "function": f}))
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    fn parse_message(message: &Value, provider: Option<&str>) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(content) = message.get("content").and_then(Value::as_str) {
            events.push(Event::bot_utter_with(
                content,
                provider.map(str::to_owned),
                Some(message.clone()),
            ));
        }
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let Some(function) = call.get("function") else {
                    continue;
                };
                let Some(name) = function.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let args = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                    .unwrap_or_else(|| json!({}));
                let call_id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                events.push(Event::function_call(
                    name,
                    args,
                    call_id,
                    Some(message.clone()),
                ));
            }
        }
        events
    }
}

#[async_trait]
impl Model for OpenAiModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate_message(
        &self,
        messages: Vec<ChatMessage>,
        functions: &[FunctionSpec],
        provider: Option<&str>,
    ) -> Result<Vec<Event>, ModelError> {
        let body = self.request_body(&messages, functions);

        let mut request = self.client.post(&self.server).json(&body);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let status = response.status();
        debug!(%status, "chat completion response");
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(%status, body = %text, "chat completion request failed");
            return Err(ModelError::Transport(format!("status {status}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        let Some(message) = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
        else {
            return Err(ModelError::Malformed("response has no choices".to_owned()));
        };
        debug!(message = %message, "chat completion message");
        Ok(Self::parse_message(message, provider))
    }
}
