//! The prompt-driven LLM agent.
//!
//! Speaks through a fixed system template that pins down the wire contract
//! (`data` slot extraction, `bot` reply, `status` transitions) and keeps a
//! private per-agent history so it can resume after interruptions. Tool
//! calls loop through the sandboxed executor, bounded in depth.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::agents::{Agent, AgentKind, AgentOutput, RunContext};
use crate::error::Result;
use crate::event::Event;
use crate::message::ChatMessage;
use crate::model::{FunctionSpec, generate_or_empty, recover_json};
use crate::prompts;
use crate::tools::{ToolStatus, translate_result};
use crate::tracker::Tracker;
use crate::vars::ArgRef;

/// Upper bound on nested tool rounds within one scheduling slot.
const MAX_TOOL_ROUNDS: usize = 8;

/// A prompt-driven agent.
#[derive(Debug)]
pub struct LlmAgent {
    name: String,
    description: String,
    prompt: String,
    args: Vec<String>,
    uses: Vec<String>,
}

impl LlmAgent {
    /// Create an LLM agent.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
        args: Vec<String>,
        uses: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            prompt: prompt.into(),
            args,
            uses,
        }
    }

    /// Assemble the prompt: system template, private history, and (outside
    /// tool rounds) the latest user message.
    fn build_prompt(&self, tracker: &mut Tracker, is_tool: bool) -> Vec<ChatMessage> {
        let calling_flow = tracker
            .peek_agent()
            .and_then(|m| m.call_site.as_ref())
            .map(|site| site.flow.clone());
        let mut other_agents: Vec<String> = tracker
            .arg_agent_names()
            .into_iter()
            .filter(|agent| *agent != self.name)
            .filter(|agent| Some(*agent) != calling_flow.as_deref())
            .map(str::to_owned)
            .collect();
        other_agents.sort();

        let states = prompts::states_section(tracker, None);
        let history = tracker.history_string();
        let system = prompts::llm_system(&self.prompt, &states, &other_agents, &self.args, &history);

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(tracker.conv_history(&self.name).iter().cloned());
        if !is_tool {
            let content = if self.is_interrupted(tracker) {
                format!(
                    "(Asked something else before and have now returned here) {}",
                    tracker.latest_text()
                )
            } else {
                tracker.latest_text().to_owned()
            };
            let latest = ChatMessage::user(content);
            messages.push(latest.clone());
            tracker.push_conv_history(&self.name, latest);
        }
        messages
    }

    /// Whether the conversation moved on since this agent last spoke: the
    /// private history's last `bot` reply no longer matches the last public
    /// bot utterance.
    fn is_interrupted(&self, tracker: &Tracker) -> bool {
        let history = tracker.conv_history(&self.name);
        let Some(last) = history.last() else {
            return false;
        };
        let last_private: Option<String> = serde_json::from_str::<Value>(last.text())
            .ok()
            .and_then(|v| v.get("bot").and_then(Value::as_str).map(str::to_owned));
        let last_public = tracker
            .events
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::BotUtter { text, .. } => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_default();
        last_private.as_deref() != Some(last_public.as_str())
    }

    fn function_specs(&self, ctx: &RunContext<'_>) -> Vec<FunctionSpec> {
        let mut specs = Vec::new();
        for name in &self.uses {
            let Some(descriptor) = ctx.tools.and_then(|tools| tools.get(name)) else {
                error!(
                    agent = %self.name,
                    function = name,
                    "declared tool function was not loaded"
                );
                return specs;
            };
            specs.push(descriptor.function_spec());
        }
        specs
    }

    /// Execute one model-requested tool call; returns whether stdout was
    /// captured (which re-enters the generation loop).
    async fn handle_function_call(
        &self,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
        function_name: &str,
        args: Value,
        call_id: Option<String>,
        metadata: Option<Value>,
        out: &mut Vec<Event>,
    ) -> Result<Option<bool>> {
        if let Some(raw) = &metadata {
            tracker.push_conv_history(&self.name, assistant_from_raw(raw));
        }
        let Some(tools) = ctx.tools else {
            error!(agent = %self.name, "model requested a tool call but no executor is loaded");
            return Ok(None);
        };

        let kwargs: Map<String, Value> = args.as_object().cloned().unwrap_or_default();
        let outcome = tools.execute(function_name, kwargs).await;
        debug!(agent = %self.name, function = function_name, status = ?outcome.status, "executed function");
        if outcome.status == ToolStatus::Error {
            warn!(
                agent = %self.name,
                function = function_name,
                error = outcome.error.as_deref().unwrap_or_default(),
                "tool function failed"
            );
            return Ok(None);
        }

        if let Some(result) = &outcome.result {
            for event in translate_result(&self.name, result) {
                match event {
                    Event::SetSlot {
                        slot_name, value, ..
                    } => {
                        let slot_ref = ArgRef::parse(&slot_name);
                        let agent = slot_ref.agent_or(&self.name).to_owned();
                        tracker.set_arg(&agent, &slot_ref.arg, value);
                    }
                    other => out.push(other),
                }
            }
        }

        if outcome.stdout.is_empty() {
            Ok(Some(false))
        } else {
            tracker.push_conv_history(
                &self.name,
                ChatMessage::tool_response(
                    call_id.unwrap_or_default(),
                    function_name,
                    &outcome.stdout,
                ),
            );
            Ok(Some(true))
        }
    }

    /// Interpret one text reply against the JSON wire contract.
    fn handle_reply(
        &self,
        tracker: &mut Tracker,
        text: &str,
        record_history: bool,
        out: &mut Vec<Event>,
    ) -> bool {
        if record_history {
            tracker.push_conv_history(&self.name, ChatMessage::assistant(text));
        }
        let response = recover_json(text);

        if let Some(Value::Object(data)) = response.get("data") {
            for (arg, value) in data {
                tracker.set_arg(&self.name, arg, value.clone());
                out.push(Event::set_slot(arg, value.clone(), &self.name));
            }
        }
        let bot_reply = response
            .get("bot")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());

        match response.get("status").and_then(Value::as_str) {
            Some("quit") => {
                if let Some(reply) = bot_reply {
                    out.push(Event::bot_utter(reply, &self.name));
                }
                out.push(Event::agent_fail(&self.name));
                false
            }
            Some("complete") => {
                tracker.clear_conv_history(&self.name);
                if let Some(reply) = bot_reply {
                    out.push(Event::bot_utter(reply, &self.name));
                }
                out.push(Event::agent_complete(&self.name));
                false
            }
            _ => {
                if let Some(reply) = bot_reply {
                    out.push(Event::bot_utter(reply, &self.name));
                }
                true
            }
        }
    }
}

fn assistant_from_raw(raw: &Value) -> ChatMessage {
    let mut message = match raw.get("content").and_then(Value::as_str) {
        Some(content) => ChatMessage::assistant(content),
        None => ChatMessage::assistant_with_tool_calls(Value::Null),
    };
    message.tool_calls = raw.get("tool_calls").cloned();
    message
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Llm
    }

    fn declared_args(&self) -> &[String] {
        &self.args
    }

    async fn run(&self, tracker: &mut Tracker, ctx: &RunContext<'_>) -> Result<AgentOutput> {
        let mut is_end = true;
        let mut out: Vec<Event> = Vec::new();
        let mut is_tool = false;
        let mut rounds = 0usize;

        loop {
            let messages = self.build_prompt(tracker, is_tool);
            let functions = self.function_specs(ctx);
            let result =
                generate_or_empty(ctx.model, messages, &functions, Some(&self.name)).await;
            let single_reply = result.len() == 1;

            let mut continue_tool = false;
            for event in result {
                match event {
                    Event::FunctionCall {
                        function_name,
                        args,
                        call_id,
                        metadata,
                        ..
                    } => {
                        match self
                            .handle_function_call(
                                tracker,
                                ctx,
                                &function_name,
                                args,
                                call_id,
                                metadata,
                                &mut out,
                            )
                            .await?
                        {
                            // executor trouble: give the turn back quietly
                            None => return Ok(AgentOutput::end(Vec::new())),
                            Some(reenter) => continue_tool = continue_tool || reenter,
                        }
                    }
                    Event::SetSlot {
                        slot_name, value, ..
                    } => {
                        tracker.set_arg(&self.name, &slot_name, value);
                    }
                    Event::AgentFail { .. } => {
                        is_end = false;
                        out.push(event);
                    }
                    Event::BotUtter { text, .. } => {
                        if !self.handle_reply(tracker, &text, single_reply, &mut out) {
                            is_end = false;
                        }
                    }
                    _ => {}
                }
            }

            if continue_tool {
                rounds += 1;
                if rounds >= MAX_TOOL_ROUNDS {
                    warn!(agent = %self.name, rounds, "tool-use recursion bound exceeded");
                    out.push(Event::agent_fail(&self.name));
                    is_end = false;
                    break;
                }
                is_tool = true;
                continue;
            }
            break;
        }

        Ok(AgentOutput {
            is_end,
            events: out,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::providers::MockModel;
    use crate::tools::{InProcessExecutor, ToolDescriptor, ToolOutcome};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn tracker_for(agent: &str, args: &[&str], text: &str) -> Tracker {
        let mut template: HashMap<String, HashMap<String, Value>> = HashMap::new();
        template.insert(
            agent.to_owned(),
            args.iter()
                .map(|a| ((*a).to_owned(), Value::Null))
                .collect(),
        );
        let mut tracker = Tracker::new("u1", "bot", template, HashMap::new(), HashMap::new());
        tracker.update(Event::user_input(text));
        tracker
    }

    #[tokio::test]
    async fn plain_reply_extracts_data_and_speaks() {
        let agent = LlmAgent::new("book", "", "Book tables.", vec!["date".to_owned()], vec![]);
        let mut tracker = tracker_for("book", &["date"], "tomorrow please");
        let model = MockModel::new().push_text(
            r#"{"data": {"date": "tomorrow"}, "bot": "Noted, tomorrow.", "status": "running"}"#,
        );
        let agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };

        let out = agent.run(&mut tracker, &ctx).await.unwrap();
        assert!(out.is_end);
        assert_eq!(tracker.get_arg("book", "date"), Some(json!("tomorrow")));
        assert!(out.events.iter().any(|e| matches!(
            e,
            Event::BotUtter { text, .. } if text == "Noted, tomorrow."
        )));
        // the reply went into the private history
        assert!(!tracker.conv_history("book").is_empty());
    }

    #[tokio::test]
    async fn quit_status_fails_and_keeps_turn_open() {
        let agent = LlmAgent::new("book", "", "Book tables.", vec![], vec![]);
        let mut tracker = tracker_for("book", &[], "what is the weather");
        let model = MockModel::new().push_text(r#"{"bot": "", "status": "quit"}"#);
        let agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };

        let out = agent.run(&mut tracker, &ctx).await.unwrap();
        assert!(!out.is_end);
        assert!(matches!(out.events.last(), Some(Event::AgentFail { .. })));
        // the empty bot reply must not surface
        assert!(!out.events.iter().any(|e| matches!(e, Event::BotUtter { .. })));
    }

    #[tokio::test]
    async fn complete_status_clears_private_history() {
        let agent = LlmAgent::new("book", "", "Book tables.", vec![], vec![]);
        let mut tracker = tracker_for("book", &[], "done");
        let model = MockModel::new().push_text(r#"{"bot": "All set!", "status": "complete"}"#);
        let agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };

        let out = agent.run(&mut tracker, &ctx).await.unwrap();
        assert!(!out.is_end);
        assert!(matches!(out.events.last(), Some(Event::AgentComplete { .. })));
        assert!(tracker.conv_history("book").is_empty());
    }

    #[tokio::test]
    async fn tool_round_trip_writes_slot_and_speaks() {
        let agent = LlmAgent::new(
            "weather",
            "",
            "Report the weather.",
            vec!["temp".to_owned()],
            vec!["check_weather".to_owned()],
        );
        let mut tracker = tracker_for("weather", &["temp"], "weather?");
        let model = MockModel::new().push_function_call("check_weather", json!({"city": "here"}));
        let tools = InProcessExecutor::new().with_function(
            ToolDescriptor::new("check_weather", "Look up the weather"),
            |_| {
                ToolOutcome::success(json!([
                    {"arg": "temp", "value": 72},
                    {"bot": "It is 72°F"}
                ]))
            },
        );
        let agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let ctx = RunContext {
            agents: &agents,
            tools: Some(&tools),
            model: &model,
        };

        let out = agent.run(&mut tracker, &ctx).await.unwrap();
        assert_eq!(tracker.get_arg("weather", "temp"), Some(json!(72)));
        assert!(out.events.iter().any(|e| matches!(
            e,
            Event::BotUtter { text, .. } if text == "It is 72°F"
        )));
    }

    #[tokio::test]
    async fn stdout_feeds_back_into_generation() {
        let agent = LlmAgent::new(
            "calc",
            "",
            "Calculate.",
            vec![],
            vec!["add".to_owned()],
        );
        let mut tracker = tracker_for("calc", &[], "2+2?");
        let model = MockModel::new()
            .push_function_call("add", json!({"a": 2, "b": 2}))
            .push_text(r#"{"bot": "The answer is 4.", "status": "running"}"#);
        let tools = InProcessExecutor::new().with_function(
            ToolDescriptor::new("add", "Add numbers"),
            |_| ToolOutcome::success(json!([])).with_stdout("4"),
        );
        let agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let ctx = RunContext {
            agents: &agents,
            tools: Some(&tools),
            model: &model,
        };

        let out = agent.run(&mut tracker, &ctx).await.unwrap();
        assert_eq!(model.call_count(), 2);
        assert!(out.events.iter().any(|e| matches!(
            e,
            Event::BotUtter { text, .. } if text == "The answer is 4."
        )));
        // the tool observation was threaded into the private history
        assert!(tracker
            .conv_history("calc")
            .iter()
            .any(|m| m.text() == "4"));
    }

    #[tokio::test]
    async fn tool_recursion_is_bounded() {
        let agent = LlmAgent::new("loopy", "", "Loop.", vec![], vec!["spin".to_owned()]);
        let mut tracker = tracker_for("loopy", &[], "go");
        let mut model = MockModel::new();
        for _ in 0..10 {
            model = model.push_function_call("spin", json!({}));
        }
        let tools = InProcessExecutor::new().with_function(
            ToolDescriptor::new("spin", "Spin forever"),
            |_| ToolOutcome::success(json!([])).with_stdout("again"),
        );
        let agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let ctx = RunContext {
            agents: &agents,
            tools: Some(&tools),
            model: &model,
        };

        let out = agent.run(&mut tracker, &ctx).await.unwrap();
        assert!(!out.is_end);
        assert!(matches!(out.events.last(), Some(Event::AgentFail { .. })));
        assert!(model.call_count() <= MAX_TOOL_ROUNDS);
    }

    #[tokio::test]
    async fn interruption_prefixes_latest_message() {
        let agent = LlmAgent::new("book", "", "Book tables.", vec![], vec![]);
        let mut tracker = tracker_for("book", &[], "first");
        // the agent spoke before, then another agent answered in between
        tracker.push_conv_history(
            "book",
            ChatMessage::assistant(r#"{"bot": "Which day?", "status": "running"}"#),
        );
        tracker.update(Event::bot_utter("It is sunny", "weather"));
        tracker.update(Event::user_input("back to booking"));

        let model = MockModel::new().push_text(r#"{"bot": "Welcome back", "status": "running"}"#);
        let agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        agent.run(&mut tracker, &ctx).await.unwrap();

        let calls = model.recorded_calls();
        let sent = &calls[0];
        let last_user = sent
            .iter()
            .rev()
            .find(|m| m.role == crate::message::MessageRole::User)
            .unwrap();
        assert!(last_user.text().starts_with("(Asked something else before"));
    }
}
