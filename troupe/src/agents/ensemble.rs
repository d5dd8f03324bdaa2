//! The ensemble agent: LLM-based routing among candidate agents.
//!
//! Holds the candidate set, optional declarative init steps for the first
//! turn, and optional fallback/exit sub-agents. Candidates that already
//! reported a terminal signal since the latest user input are excluded from
//! selection, which is what makes routing loops impossible.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::agents::{Agent, AgentKind, AgentOutput, RunContext};
use crate::error::Result;
use crate::event::Event;
use crate::model::generate_or_empty;
use crate::prompts::{self, RetrievalContext};
use crate::steps::{Step, StepState};
use crate::tracker::Tracker;

/// What the selection reply asked for.
enum Selection {
    /// Route to a candidate agent.
    Agent(String),
    /// Answer directly from the knowledge base.
    Answer(String),
    /// Run the configured fallback agent.
    Fallback,
    /// Run the configured exit agent.
    Exit,
    /// No routing needed.
    None,
}

/// A candidate router.
#[derive(Debug)]
pub struct EnsembleAgent {
    name: String,
    description: String,
    contains: Vec<String>,
    steps: Vec<Step>,
    args: Vec<String>,
    fallback: Option<String>,
    exit: Option<String>,
}

impl EnsembleAgent {
    /// Create an ensemble agent.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        contains: Vec<String>,
        steps: Vec<Step>,
        args: Vec<String>,
        fallback: Option<String>,
        exit: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            contains,
            steps,
            args,
            fallback,
            exit,
        }
    }

    /// The candidate agent names.
    #[must_use]
    pub fn contains(&self) -> &[String] {
        &self.contains
    }

    /// Run the declarative init steps (first turn only).
    async fn run_init_steps(
        &self,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
    ) -> Result<(bool, Vec<Event>)> {
        let mut is_end = true;
        let mut events = Vec::new();
        for step in &self.steps {
            let (state, step_events) = step.run(tracker, None, ctx, &self.name).await?;
            events.extend(step_events);
            if state == StepState::Await {
                is_end = false;
            }
        }
        Ok((is_end, events))
    }

    /// Run the knowledge-base agent first to obtain retrieval candidates.
    async fn retrieve(
        &self,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
    ) -> Result<Option<RetrievalContext>> {
        let Some(kb) = ctx
            .agents
            .values()
            .find(|agent| agent.kind() == AgentKind::Kb)
        else {
            return Ok(None);
        };
        let output = kb.run(tracker, ctx).await?;
        let metadata = output.events.into_iter().find_map(|event| match event {
            Event::AgentComplete { metadata, .. } => metadata,
            _ => None,
        });
        debug!(ensemble = %self.name, found = metadata.is_some(), "knowledge base pre-run");
        let Some(metadata) = metadata else {
            return Ok(None);
        };

        let matches = metadata
            .get("matches")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m.get("content").and_then(Value::as_str))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let answer = metadata
            .get("answer")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(Some(RetrievalContext { matches, answer }))
    }

    /// Select an agent from the remaining candidates; `None` when every
    /// candidate already reported a terminal signal this turn.
    async fn select_followup(
        &self,
        tracker: &Tracker,
        ctx: &RunContext<'_>,
        retrieval: Option<&RetrievalContext>,
    ) -> Selection {
        let finished = tracker.finished_since_user_input();
        let remaining: Vec<String> = self
            .contains
            .iter()
            .filter(|candidate| !finished.contains(&candidate.as_str()))
            .cloned()
            .collect();
        if remaining.is_empty() && retrieval.is_none() {
            return Selection::None;
        }

        let mut descriptions = HashMap::new();
        for name in &remaining {
            match ctx.agents.get(name) {
                Some(agent) if agent.kind() == AgentKind::Kb => {}
                Some(agent) => {
                    descriptions.insert(name.clone(), agent.description().to_owned());
                }
                None => {
                    error!(
                        ensemble = %self.name,
                        candidate = %name,
                        "candidate declared but not defined anywhere"
                    );
                }
            }
        }

        let prompt = prompts::ensemble_selection(
            tracker,
            &remaining,
            &descriptions,
            self.fallback.is_some(),
            self.exit.is_some(),
            retrieval,
        );
        let reply = generate_or_empty(ctx.model, prompt, &[], None).await;

        for event in reply {
            if let Event::BotUtter { text, .. } = event {
                let text = text.trim();
                debug!(ensemble = %self.name, reply = text, "selection reply");
                if text.contains("[FAQ]") {
                    if let Some(answer) = retrieval.and_then(|r| r.answer.clone()) {
                        return Selection::Answer(answer);
                    }
                    warn!(ensemble = %self.name, "selection chose [FAQ] with no answer");
                    return Selection::None;
                }
                if text.contains("[Fallback]") {
                    return Selection::Fallback;
                }
                if text.contains("[Exit]") {
                    return Selection::Exit;
                }
                if text.contains("None") {
                    return Selection::None;
                }
                // exact name first, then a reply merely containing one
                if let Some(name) = self.contains.iter().find(|c| *c == text) {
                    return Selection::Agent(name.clone());
                }
                if let Some(name) = self.contains.iter().find(|c| text.contains(c.as_str())) {
                    return Selection::Agent(name.clone());
                }
                return Selection::None;
            }
        }
        Selection::None
    }

    async fn run_named(
        &self,
        name: Option<&String>,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
    ) -> Result<Vec<Event>> {
        let Some(agent) = name.and_then(|n| ctx.agents.get(n)) else {
            return Ok(Vec::new());
        };
        Ok(agent.run(tracker, ctx).await?.events)
    }
}

#[async_trait]
impl Agent for EnsembleAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Ensemble
    }

    fn declared_args(&self) -> &[String] {
        &self.args
    }

    async fn run(&self, tracker: &mut Tracker, ctx: &RunContext<'_>) -> Result<AgentOutput> {
        let mut events = Vec::new();

        // declarative init steps, once, when the conversation starts
        if tracker.events.len() == 1
            && !self.steps.is_empty()
            && !matches!(self.steps[0].kind, crate::steps::StepKind::User)
        {
            let (init_end, init_events) = self.run_init_steps(tracker, ctx).await?;
            events.extend(init_events);
            if tracker.latest_text() == "/init" {
                if let Some(marker) = tracker.peek_agent().cloned() {
                    events.push(Event::current_agent(marker));
                }
                return Ok(AgentOutput {
                    is_end: init_end,
                    events,
                });
            }
        }
        if tracker.latest_text() == "/init" {
            if let Some(marker) = tracker.peek_agent().cloned() {
                events.push(Event::current_agent(marker));
            }
            return Ok(AgentOutput::end(events));
        }

        // retrieval candidates, only while nothing answered this turn yet
        let retrieval = if tracker.last_event_is_user_input() {
            self.retrieve(tracker, ctx).await?
        } else {
            None
        };

        match self.select_followup(tracker, ctx, retrieval.as_ref()).await {
            Selection::Agent(name) => {
                events.push(Event::follow_up(name, &self.name));
                return Ok(AgentOutput::run_on(events));
            }
            Selection::Answer(text) => {
                events.push(Event::bot_utter(text, &self.name));
                return Ok(AgentOutput::end(events));
            }
            Selection::Fallback => {
                let fallback_events = self.run_named(self.fallback.as_ref(), tracker, ctx).await?;
                events.extend(fallback_events);
                return Ok(AgentOutput::end(events));
            }
            Selection::Exit => {
                let exit_events = self.run_named(self.exit.as_ref(), tracker, ctx).await?;
                events.extend(exit_events);
                return Ok(AgentOutput::end(events));
            }
            Selection::None => {}
        }

        // nothing selected: if the user is still unanswered, apologize via
        // fallback; otherwise let a configured exit close the conversation
        if !tracker.has_bot_response_after_user_input() {
            let fallback_events = self.run_named(self.fallback.as_ref(), tracker, ctx).await?;
            events.extend(fallback_events);
            return Ok(AgentOutput::end(events));
        }
        if self.exit.is_some() && events.is_empty() {
            let exit_events = self.run_named(self.exit.as_ref(), tracker, ctx).await?;
            events.extend(exit_events);
        }
        Ok(AgentOutput::end(events))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::agents::LlmAgent;
    use crate::providers::MockModel;
    use std::sync::Arc;

    fn agents_with(names: &[&str]) -> HashMap<String, Arc<dyn Agent>> {
        let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        for name in names {
            agents.insert(
                (*name).to_owned(),
                Arc::new(LlmAgent::new(*name, format!("handles {name}"), "", vec![], vec![])),
            );
        }
        agents
    }

    fn tracker(text: &str) -> Tracker {
        let mut t = Tracker::new(
            "u1",
            "bot",
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        );
        t.update(Event::user_input(text));
        t
    }

    #[tokio::test]
    async fn selection_reply_routes_to_candidate() {
        let ensemble = EnsembleAgent::new(
            "meta",
            "",
            vec!["book".to_owned(), "weather".to_owned()],
            vec![],
            vec![],
            None,
            None,
        );
        let agents = agents_with(&["book", "weather"]);
        let model = MockModel::new().push_text("book");
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let mut t = tracker("book me a table");

        let out = ensemble.run(&mut t, &ctx).await.unwrap();
        assert!(!out.is_end);
        assert!(matches!(
            out.events.last(),
            Some(Event::FollowUpAgent { next_agent, .. }) if next_agent == "book"
        ));
    }

    #[tokio::test]
    async fn exhausted_candidates_skip_the_model() {
        let ensemble = EnsembleAgent::new(
            "meta",
            "",
            vec!["book".to_owned()],
            vec![],
            vec![],
            None,
            None,
        );
        let agents = agents_with(&["book"]);
        let model = MockModel::new(); // would warn if consulted
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let mut t = tracker("hello");
        t.update(Event::agent_fail("book"));

        let out = ensemble.run(&mut t, &ctx).await.unwrap();
        assert!(out.is_end);
        assert_eq!(model.call_count(), 0);
        assert!(out.events.is_empty());
    }

    #[tokio::test]
    async fn none_reply_with_unanswered_user_runs_fallback() {
        let ensemble = EnsembleAgent::new(
            "meta",
            "",
            vec!["book".to_owned()],
            vec![],
            vec![],
            Some("apologizer".to_owned()),
            None,
        );
        let mut agents = agents_with(&["book"]);
        agents.insert(
            "apologizer".to_owned(),
            Arc::new(crate::agents::FallbackAgent::canned(
                "apologizer",
                "Sorry, I did not get that.",
            )),
        );
        let model = MockModel::new().push_text("None");
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let mut t = tracker("gibberish");

        let out = ensemble.run(&mut t, &ctx).await.unwrap();
        assert!(out.is_end);
        assert!(matches!(
            out.events.last(),
            Some(Event::BotUtter { text, .. }) if text == "Sorry, I did not get that."
        ));
    }

    #[tokio::test]
    async fn substring_match_still_routes() {
        let ensemble = EnsembleAgent::new(
            "meta",
            "",
            vec!["weather".to_owned()],
            vec![],
            vec![],
            None,
            None,
        );
        let agents = agents_with(&["weather"]);
        let model = MockModel::new().push_text("I would pick the weather agent.");
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let mut t = tracker("rain?");

        let out = ensemble.run(&mut t, &ctx).await.unwrap();
        assert!(matches!(
            out.events.last(),
            Some(Event::FollowUpAgent { next_agent, .. }) if next_agent == "weather"
        ));
    }
}
