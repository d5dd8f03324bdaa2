//! Fallback, exit, and entrypoint agents.

use async_trait::async_trait;
use tracing::info;

use crate::agents::{Agent, AgentKind, AgentOutput, RunContext};
use crate::error::Result;
use crate::event::Event;
use crate::model::generate_or_empty;
use crate::prompts;
use crate::steps::{Step, StepState};
use crate::tracker::Tracker;

/// Responds when no agent can handle the user's input.
///
/// With a canned policy text it answers directly; otherwise it asks the
/// model for an apology grounded in the conversation.
#[derive(Debug)]
pub struct FallbackAgent {
    name: String,
    canned: Option<String>,
}

impl FallbackAgent {
    /// A fallback that generates its response with the model.
    #[must_use]
    pub fn generated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            canned: None,
        }
    }

    /// A fallback that always answers with the given policy text.
    #[must_use]
    pub fn canned(name: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            canned: Some(policy.into()),
        }
    }
}

#[async_trait]
impl Agent for FallbackAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "This agent can generate a default fallback response."
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Fallback
    }

    async fn run(&self, tracker: &mut Tracker, ctx: &RunContext<'_>) -> Result<AgentOutput> {
        if let Some(policy) = &self.canned {
            return Ok(AgentOutput::end(vec![Event::bot_utter(
                policy, &self.name,
            )]));
        }
        let prompt = prompts::fallback_generation(&tracker.history_string());
        let reply = generate_or_empty(ctx.model, prompt, &[], Some(&self.name)).await;
        let events = reply
            .into_iter()
            .filter(|event| matches!(event, Event::BotUtter { .. }))
            .collect();
        Ok(AgentOutput::end(events))
    }
}

/// Closes the conversation when no work remains.
///
/// The original's timeout-based user monitoring is a collaborator concern;
/// the core contract is a single closing utterance.
#[derive(Debug)]
pub struct ExitAgent {
    name: String,
    exit_response: String,
}

impl ExitAgent {
    /// Default closing response.
    const DEFAULT_RESPONSE: &'static str = "Goodbye!";

    /// An exit agent with the default closing response.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exit_response: Self::DEFAULT_RESPONSE.to_owned(),
        }
    }

    /// An exit agent with a custom closing response.
    #[must_use]
    pub fn with_response(name: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exit_response: response.into(),
        }
    }
}

#[async_trait]
impl Agent for ExitAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "This agent can generate a default exit response."
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Exit
    }

    async fn run(&self, _tracker: &mut Tracker, _ctx: &RunContext<'_>) -> Result<AgentOutput> {
        info!(agent = %self.name, "closing the conversation");
        Ok(AgentOutput::end(vec![Event::bot_utter(
            &self.exit_response,
            &self.name,
        )]))
    }
}

/// The bot entrypoint: runs the declared `main` steps when the agent stack
/// is empty, conventionally pushing the root ensemble via a `call` step.
#[derive(Debug)]
pub struct Entrypoint {
    name: String,
    steps: Vec<Step>,
}

impl Entrypoint {
    /// Create the entrypoint over its parsed steps.
    #[must_use]
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            name: "main".to_owned(),
            steps,
        }
    }
}

#[async_trait]
impl Agent for Entrypoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Entrypoint
    }

    async fn run(&self, tracker: &mut Tracker, ctx: &RunContext<'_>) -> Result<AgentOutput> {
        let mut events = Vec::new();
        for step in &self.steps {
            let (state, step_events) = step.run(tracker, None, ctx, &self.name).await?;
            events.extend(step_events);
            debug_assert!(state != StepState::Do, "entrypoint steps cannot branch");
        }
        Ok(AgentOutput::run_on(events))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::providers::MockModel;
    use std::collections::HashMap;

    #[tokio::test]
    async fn canned_fallback_answers_directly() {
        let fallback = FallbackAgent::canned("fb", "Please rephrase.");
        let mut tracker = Tracker::new("u", "b", HashMap::new(), HashMap::new(), HashMap::new());
        let agents = HashMap::new();
        let model = MockModel::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let out = fallback.run(&mut tracker, &ctx).await.unwrap();
        assert!(out.is_end);
        assert!(matches!(
            out.events.first(),
            Some(Event::BotUtter { text, .. }) if text == "Please rephrase."
        ));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn generated_fallback_keeps_only_utterances() {
        let fallback = FallbackAgent::generated("fb");
        let mut tracker = Tracker::new("u", "b", HashMap::new(), HashMap::new(), HashMap::new());
        tracker.update(Event::user_input("??"));
        let agents = HashMap::new();
        let model = MockModel::new().push_text("I'm sorry, I didn't understand that.");
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let out = fallback.run(&mut tracker, &ctx).await.unwrap();
        assert_eq!(out.events.len(), 1);
    }

    #[tokio::test]
    async fn exit_agent_says_goodbye() {
        let exit = ExitAgent::new("bye");
        let mut tracker = Tracker::new("u", "b", HashMap::new(), HashMap::new(), HashMap::new());
        let agents = HashMap::new();
        let model = MockModel::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let out = exit.run(&mut tracker, &ctx).await.unwrap();
        assert!(matches!(
            out.events.first(),
            Some(Event::BotUtter { text, .. }) if text == "Goodbye!"
        ));
    }
}
