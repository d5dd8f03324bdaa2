//! Scripted mock model for testing.
//!
//! Returns queued responses in order and records every prompt it was asked
//! to answer, so tests can drive whole conversations without a network.

use std::sync::Mutex;
use std::collections::VecDeque;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::ModelError;
use crate::event::Event;
use crate::message::ChatMessage;
use crate::model::{FunctionSpec, Model};

/// A scripted mock model.
#[derive(Debug, Default)]
pub struct MockModel {
    responses: Mutex<VecDeque<Vec<Event>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockModel {
    /// Create a mock with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text assistant reply.
    #[must_use]
    pub fn push_text(self, text: impl Into<String>) -> Self {
        self.push_events(vec![Event::bot_utter_with(text, None, None)])
    }

    /// Queue a tool-call reply.
    #[must_use]
    pub fn push_function_call(self, name: impl Into<String>, args: Value) -> Self {
        self.push_events(vec![Event::function_call(name, args, Some("call_0".to_owned()), None)])
    }

    /// Queue an arbitrary event batch.
    #[must_use]
    pub fn push_events(self, events: Vec<Event>) -> Self {
        {
            let mut responses = self
                .responses
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            responses.push_back(events);
        }
        self
    }

    /// Prompts this mock has answered, in call order.
    #[must_use]
    pub fn recorded_calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of generation calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Model for MockModel {
    fn model_id(&self) -> &str {
        "mock-model"
    }

    async fn generate_message(
        &self,
        messages: Vec<ChatMessage>,
        _functions: &[FunctionSpec],
        provider: Option<&str>,
    ) -> Result<Vec<Event>, ModelError> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(messages);
        let next = self
            .responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        match next {
            Some(mut events) => {
                // attribute utterances to the requesting agent, as a real
                // provider would
                for event in &mut events {
                    if let Event::BotUtter {
                        provider: event_provider,
                        ..
                    } = event
                        && event_provider.is_none()
                    {
                        *event_provider = provider.map(str::to_owned);
                    }
                }
                Ok(events)
            }
            None => {
                warn!("mock model script exhausted; returning empty result");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn scripted_responses_pop_in_order() {
        let model = MockModel::new().push_text("first").push_text("second");

        let r1 = model
            .generate_message(vec![ChatMessage::user("a")], &[], Some("x"))
            .await
            .unwrap();
        assert!(matches!(
            &r1[0],
            Event::BotUtter { text, provider, .. } if text == "first" && provider.as_deref() == Some("x")
        ));

        let r2 = model.generate_message(vec![], &[], None).await.unwrap();
        assert!(matches!(&r2[0], Event::BotUtter { text, .. } if text == "second"));

        // exhaustion behaves like a transport failure: empty result
        let r3 = model.generate_message(vec![], &[], None).await.unwrap();
        assert!(r3.is_empty());
        assert_eq!(model.call_count(), 3);
    }
}
