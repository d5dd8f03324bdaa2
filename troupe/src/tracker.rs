//! Per-session conversation state.
//!
//! A [`Tracker`] owns everything mutable about one session: the append-only
//! event log, the variable store with its cross-agent bindings, the agent
//! stack, per-flow runtime state and each agent's private conversation
//! history. One tracker has exactly one logical owner per turn; the store
//! hands out a per-session lock around it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::event::{AgentMarker, Event, StepId, now_ts};
use crate::message::ChatMessage;

/// Binding of a called agent's local arg to an ensemble's arg.
///
/// Authored inside an ensemble's `contains` block; `ref `-prefixed sources
/// become [`ArgBinding::Ref`], everything else a one-shot [`ArgBinding::Value`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArgBinding {
    /// Copy semantics: resolves through only while the local slot is unset.
    Value {
        /// The ensemble agent owning the source slot.
        agent: String,
        /// The source slot name.
        arg: String,
    },
    /// Reference semantics: reads and writes reflect through.
    Ref {
        /// The ensemble agent owning the shared slot.
        agent: String,
        /// The shared slot name.
        arg: String,
    },
}

impl ArgBinding {
    /// Parse an authoring-side binding source (`"ref x"` or `"x"`).
    #[must_use]
    pub fn parse(ensemble: &str, source: &str) -> Self {
        match source.strip_prefix("ref ") {
            Some(target) => Self::Ref {
                agent: ensemble.to_owned(),
                arg: target.trim().to_owned(),
            },
            None => Self::Value {
                agent: ensemble.to_owned(),
                arg: source.trim().to_owned(),
            },
        }
    }
}

/// One execution path on a flow's runtime stack.
///
/// Identifies a step by descent into conditional branches: the named subflow
/// root followed by step ids. Paths are value records; the interpreter pops
/// and pushes, never mutates one in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecPath {
    /// The subflow this path descends from.
    pub subflow: String,
    /// Step ids from the subflow root down to the addressed step.
    pub steps: Vec<StepId>,
}

impl ExecPath {
    /// A path addressing a top-level step of `subflow`.
    #[must_use]
    pub fn new(subflow: impl Into<String>, step: StepId) -> Self {
        Self {
            subflow: subflow.into(),
            steps: vec![step],
        }
    }

    /// This path extended one level down.
    #[must_use]
    pub fn child(&self, step: StepId) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step);
        Self {
            subflow: self.subflow.clone(),
            steps,
        }
    }

    /// This path with the last step replaced by a sibling.
    #[must_use]
    pub fn sibling(&self, step: StepId) -> Self {
        let mut steps = self.steps.clone();
        steps.pop();
        steps.push(step);
        Self {
            subflow: self.subflow.clone(),
            steps,
        }
    }
}

/// Result of a `call` step, delivered back by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    /// The called agent completed.
    Complete,
    /// The called agent failed or quit.
    Failed,
}

/// Runtime state of one active flow-agent instance in a session.
#[derive(Debug, Clone, Default)]
pub struct FlowInfo {
    /// The stack of execution paths; top = next step to resume.
    pub runtime_stack: Vec<ExecPath>,
    /// Latched true by a user-wait step; consumed by the scheduler to end
    /// the turn.
    pub is_listen: bool,
    call_results: HashMap<StepId, CallResult>,
    counter: HashMap<StepId, u32>,
    last_extract: Option<f64>,
}

impl FlowInfo {
    /// Push an execution path.
    pub fn push(&mut self, path: ExecPath) {
        self.runtime_stack.push(path);
    }

    /// Pop the top execution path.
    pub fn pop(&mut self) -> Option<ExecPath> {
        self.runtime_stack.pop()
    }

    /// Peek the top execution path.
    #[must_use]
    pub fn peek(&self) -> Option<&ExecPath> {
        self.runtime_stack.last()
    }

    /// Whether the runtime stack is empty.
    #[must_use]
    pub fn is_stack_empty(&self) -> bool {
        self.runtime_stack.is_empty()
    }

    /// Drop every pending path (used by label jumps).
    pub fn clear(&mut self) {
        self.runtime_stack.clear();
    }

    /// Record one more visit of `step`.
    pub fn count(&mut self, step: StepId) {
        *self.counter.entry(step).or_insert(0) += 1;
    }

    /// Number of recorded visits of `step`.
    #[must_use]
    pub fn visits(&self, step: StepId) -> u32 {
        self.counter.get(&step).copied().unwrap_or(0)
    }

    /// Record the result of a `call` step.
    pub fn set_call_result(&mut self, step: StepId, result: CallResult) {
        self.call_results.insert(step, result);
    }

    /// Consume the recorded result of a `call` step, if any.
    ///
    /// Taking (rather than reading) keeps a later revisit of the same call
    /// step from finishing on a stale result.
    pub fn take_call_result(&mut self, step: StepId) -> Option<CallResult> {
        self.call_results.remove(&step)
    }

    /// Whether argument extraction should run for the user message stamped
    /// `latest_ts`. The first query for a given message answers yes;
    /// subsequent queries within the same turn answer no.
    pub fn needs_extraction(&mut self, latest_ts: f64) -> bool {
        let needed = match self.last_extract {
            None => true,
            Some(last) => last < latest_ts,
        };
        self.last_extract = Some(now_ts());
        needed
    }
}

/// Per-session conversation state, keyed by user id.
#[derive(Debug, Clone)]
pub struct Tracker {
    /// The session/user id.
    pub user_id: String,
    /// Name of the owning bot.
    pub bot_name: String,
    /// Append-only ordered event log.
    pub events: Vec<Event>,
    latest_message: Option<usize>,
    args: HashMap<String, HashMap<String, Value>>,
    func_args: HashMap<String, HashMap<String, Value>>,
    mapping: HashMap<String, HashMap<String, ArgBinding>>,
    agent_stack: Vec<AgentMarker>,
    flow_info: HashMap<String, FlowInfo>,
    conv_history: HashMap<String, Vec<ChatMessage>>,
}

impl Tracker {
    /// Create a fresh tracker seeded with the bot's declared argument slots
    /// and cross-agent bindings.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        bot_name: impl Into<String>,
        args: HashMap<String, HashMap<String, Value>>,
        func_args: HashMap<String, HashMap<String, Value>>,
        mapping: HashMap<String, HashMap<String, ArgBinding>>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            bot_name: bot_name.into(),
            events: Vec::new(),
            latest_message: None,
            args,
            func_args,
            mapping,
            agent_stack: Vec::new(),
            flow_info: HashMap::new(),
            conv_history: HashMap::new(),
        }
    }

    // ========================================================================
    // Event log
    // ========================================================================

    /// Append an event; a user input also becomes the latest message.
    pub fn update(&mut self, event: Event) {
        if matches!(event, Event::UserInput { .. }) {
            self.latest_message = Some(self.events.len());
        }
        self.events.push(event);
    }

    /// The most recent user input, if any.
    #[must_use]
    pub fn latest_message(&self) -> Option<&Event> {
        self.latest_message.and_then(|i| self.events.get(i))
    }

    /// Text of the most recent user input ("" before the first message).
    #[must_use]
    pub fn latest_text(&self) -> &str {
        match self.latest_message() {
            Some(Event::UserInput { text, .. }) => text,
            _ => "",
        }
    }

    /// Timestamp of the most recent user input.
    #[must_use]
    pub fn latest_timestamp(&self) -> f64 {
        self.latest_message().map(Event::timestamp).unwrap_or(0.0)
    }

    /// Whether the latest user input is still the last event (nothing has
    /// been emitted since).
    #[must_use]
    pub fn last_event_is_user_input(&self) -> bool {
        match self.latest_message {
            Some(i) => i + 1 == self.events.len(),
            None => false,
        }
    }

    /// Whether a bot utterance was recorded after the latest user input.
    #[must_use]
    pub fn has_bot_response_after_user_input(&self) -> bool {
        let from = self.latest_message.map_or(0, |i| i + 1);
        self.events[from..]
            .iter()
            .any(|e| matches!(e, Event::BotUtter { .. }))
    }

    /// Render the public conversation as prompt-ready text.
    ///
    /// The reserved `/init` text never appears; failed agents leave a
    /// visible trace so selection prompts can route around them.
    #[must_use]
    pub fn history_string(&self) -> String {
        let mut out = String::new();
        for event in &self.events {
            match event {
                Event::UserInput { text, .. } if text != "/init" => {
                    out.push_str("User: ");
                    out.push_str(text);
                    out.push('\n');
                }
                Event::BotUtter { text, provider, .. } => {
                    out.push_str(provider.as_deref().unwrap_or("Bot"));
                    out.push_str(": ");
                    out.push_str(text);
                    out.push('\n');
                }
                Event::AgentFail { provider, .. } => {
                    let name = provider.as_deref().unwrap_or_default();
                    out.push_str(&format!("<agent '{name}' failed to respond.>\n"));
                }
                _ => {}
            }
        }
        out
    }

    /// Providers of terminal agent signals recorded since the latest user
    /// input, newest first.
    #[must_use]
    pub fn finished_since_user_input(&self) -> Vec<&str> {
        let from = self.latest_message.map_or(0, |i| i + 1);
        self.events[from..]
            .iter()
            .rev()
            .filter(|e| e.is_terminal())
            .filter_map(Event::provider)
            .collect()
    }

    // ========================================================================
    // Agent stack
    // ========================================================================

    /// Whether no agent is scheduled.
    #[must_use]
    pub fn is_agent_stack_empty(&self) -> bool {
        self.agent_stack.is_empty()
    }

    /// Push a marker; an equal marker moves to the top instead of stacking
    /// twice.
    pub fn push_agent(&mut self, marker: AgentMarker) {
        if let Some(pos) = self.agent_stack.iter().position(|m| *m == marker) {
            let existing = self.agent_stack.remove(pos);
            self.agent_stack.push(existing);
        } else {
            self.agent_stack.push(marker);
        }
        debug!(stack = ?self.stack_names(), "agent stack after push");
    }

    /// Pop the most recently scheduled marker.
    pub fn pop_agent(&mut self) -> Option<AgentMarker> {
        self.agent_stack.pop()
    }

    /// Peek the most recently scheduled marker.
    #[must_use]
    pub fn peek_agent(&self) -> Option<&AgentMarker> {
        self.agent_stack.last()
    }

    /// Agent names on the stack, bottom first.
    #[must_use]
    pub fn stack_names(&self) -> Vec<&str> {
        self.agent_stack.iter().map(|m| m.agent.as_str()).collect()
    }

    // ========================================================================
    // Flow runtime state
    // ========================================================================

    /// Remove and return the flow state, creating a fresh one if absent.
    ///
    /// The flow agent takes its state for the duration of a `run` and puts
    /// it back unless the flow completed.
    #[must_use]
    pub fn take_flow_info(&mut self, flow: &str) -> FlowInfo {
        self.flow_info.remove(flow).unwrap_or_default()
    }

    /// Store the flow state back.
    pub fn put_flow_info(&mut self, flow: impl Into<String>, info: FlowInfo) {
        self.flow_info.insert(flow.into(), info);
    }

    /// Mutable access to a flow's state, creating it if absent.
    pub fn flow_info_mut(&mut self, flow: &str) -> &mut FlowInfo {
        self.flow_info.entry(flow.to_owned()).or_default()
    }

    /// Read access to a flow's state.
    #[must_use]
    pub fn flow_info(&self, flow: &str) -> Option<&FlowInfo> {
        self.flow_info.get(flow)
    }

    /// Drop a completed flow's state so the flow can be entered again.
    pub fn remove_flow_info(&mut self, flow: &str) {
        self.flow_info.remove(flow);
    }

    // ========================================================================
    // Variable store
    // ========================================================================

    /// Write `agent.arg`, reflecting through a `ref` binding when present.
    ///
    /// Writes to an unknown agent or undeclared (non-underscore) arg log an
    /// error and become a no-op.
    pub fn set_arg(&mut self, agent: &str, arg: &str, value: Value) -> bool {
        let internal = arg.starts_with('_');
        if !internal && !self.args.contains_key(agent) && !self.func_args.contains_key(agent) {
            error!(agent, arg, "cannot find agent when setting argument");
            return false;
        }
        if !internal
            && let Some(slots) = self.args.get(agent)
            && !slots.contains_key(arg)
        {
            error!(agent, arg, "argument not declared on agent");
            return false;
        }

        if let Some(slots) = self.func_args.get_mut(agent) {
            slots.insert(arg.to_owned(), value);
            return true;
        }

        info!(agent, arg, value = %value, "set argument");
        self.args
            .entry(agent.to_owned())
            .or_default()
            .insert(arg.to_owned(), value.clone());

        if let Some(ArgBinding::Ref {
            agent: shared_agent,
            arg: shared_arg,
        }) = self.binding(agent, arg).cloned()
        {
            self.args
                .entry(shared_agent.clone())
                .or_default()
                .insert(shared_arg.clone(), value);
            debug!(agent = %shared_agent, arg = %shared_arg, "synchronized referenced slot");
        }
        true
    }

    /// Read `agent.arg`, resolving through the binding table.
    ///
    /// Returns `None` when the agent or arg is unknown; `Some(Null)` when the
    /// slot exists but holds no value. `ref` bindings always resolve through;
    /// value bindings resolve through only while the local slot is null. The
    /// reserved `_user_input` arg always yields the latest user text.
    #[must_use]
    pub fn get_arg(&self, agent: &str, arg: &str) -> Option<Value> {
        if arg == "_user_input" {
            return Some(Value::String(self.latest_text().to_owned()));
        }
        if !self.args.contains_key(agent) && !self.func_args.contains_key(agent) {
            error!(agent, "cannot find agent when reading argument");
            return None;
        }
        if let Some(slots) = self.func_args.get(agent) {
            return Some(slots.get(arg).cloned().unwrap_or(Value::Null));
        }

        let slots = self.args.get(agent)?;
        if !slots.contains_key(arg) {
            error!(agent, arg, "cannot find argument");
            return None;
        }

        match self.binding(agent, arg) {
            Some(ArgBinding::Ref {
                agent: shared_agent,
                arg: shared_arg,
            }) => Some(self.shared_value(shared_agent, shared_arg)),
            Some(ArgBinding::Value {
                agent: shared_agent,
                arg: shared_arg,
            }) if slots.get(arg) == Some(&Value::Null) => {
                Some(self.shared_value(shared_agent, shared_arg))
            }
            _ => Some(slots.get(arg).cloned().unwrap_or(Value::Null)),
        }
    }

    fn binding(&self, agent: &str, arg: &str) -> Option<&ArgBinding> {
        self.mapping.get(agent).and_then(|m| m.get(arg))
    }

    fn shared_value(&self, agent: &str, arg: &str) -> Value {
        self.args
            .get(agent)
            .and_then(|slots| slots.get(arg))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Iterate declared agent argument maps (for prompt state sections).
    pub fn iter_args(&self) -> impl Iterator<Item = (&str, &HashMap<String, Value>)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All agent names with declared argument slots.
    #[must_use]
    pub fn arg_agent_names(&self) -> Vec<&str> {
        self.args.keys().map(String::as_str).collect()
    }

    // ========================================================================
    // Per-agent private conversation history
    // ========================================================================

    /// The agent's private message log (empty slice when absent).
    #[must_use]
    pub fn conv_history(&self, agent: &str) -> &[ChatMessage] {
        self.conv_history.get(agent).map_or(&[], Vec::as_slice)
    }

    /// Append to the agent's private message log.
    pub fn push_conv_history(&mut self, agent: &str, message: ChatMessage) {
        self.conv_history
            .entry(agent.to_owned())
            .or_default()
            .push(message);
    }

    /// Clear the agent's private message log.
    pub fn clear_conv_history(&mut self, agent: &str) {
        self.conv_history.remove(agent);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    fn template(entries: &[(&str, &[&str])]) -> HashMap<String, HashMap<String, Value>> {
        entries
            .iter()
            .map(|(agent, slots)| {
                (
                    (*agent).to_owned(),
                    slots
                        .iter()
                        .map(|s| ((*s).to_owned(), Value::Null))
                        .collect(),
                )
            })
            .collect()
    }

    fn tracker_with_ref_mapping() -> Tracker {
        let args = template(&[("meta", &["date_from_main"]), ("book", &["date"])]);
        let mut mapping = HashMap::new();
        mapping.insert(
            "book".to_owned(),
            [(
                "date".to_owned(),
                ArgBinding::parse("meta", "ref date_from_main"),
            )]
            .into_iter()
            .collect::<HashMap<_, _>>(),
        );
        Tracker::new("u1", "bot", args, HashMap::new(), mapping)
    }

    #[test]
    fn latest_message_tracks_last_user_input() {
        let mut t = Tracker::new("u1", "bot", HashMap::new(), HashMap::new(), HashMap::new());
        t.update(Event::user_input("hello"));
        t.update(Event::bot_utter("hi", "greeter"));
        t.update(Event::user_input("again"));
        assert_eq!(t.latest_text(), "again");
        assert!(t.last_event_is_user_input());
        t.update(Event::bot_utter("yes", "greeter"));
        assert!(!t.last_event_is_user_input());
        assert!(t.has_bot_response_after_user_input());
    }

    #[test]
    fn set_then_get_round_trips_typed_values() {
        let mut t = Tracker::new(
            "u1",
            "bot",
            template(&[("flow", &["count", "name"])]),
            HashMap::new(),
            HashMap::new(),
        );
        assert!(t.set_arg("flow", "count", json!(3)));
        assert!(t.set_arg("flow", "name", json!("ada")));
        assert_eq!(t.get_arg("flow", "count"), Some(json!(3)));
        assert_eq!(t.get_arg("flow", "name"), Some(json!("ada")));
    }

    #[test]
    fn unknown_writes_are_logged_noops() {
        let mut t = Tracker::new(
            "u1",
            "bot",
            template(&[("flow", &["x"])]),
            HashMap::new(),
            HashMap::new(),
        );
        assert!(!t.set_arg("ghost", "x", json!(1)));
        assert!(!t.set_arg("flow", "undeclared", json!(1)));
        assert_eq!(t.get_arg("ghost", "x"), None);
        assert_eq!(t.get_arg("flow", "undeclared"), None);
        // underscore-prefixed slots are internal and write freely
        assert!(t.set_arg("flow", "_retry", json!(2)));
        assert_eq!(t.get_arg("flow", "_retry"), Some(json!(2)));
    }

    #[test]
    fn ref_binding_reflects_both_ways() {
        let mut t = tracker_with_ref_mapping();
        assert!(t.set_arg("book", "date", json!("tomorrow")));
        assert_eq!(t.get_arg("meta", "date_from_main"), Some(json!("tomorrow")));

        assert!(t.set_arg("meta", "date_from_main", json!("friday")));
        assert_eq!(t.get_arg("book", "date"), Some(json!("friday")));
    }

    #[test]
    fn value_binding_fills_null_slots_only() {
        let args = template(&[("meta", &["city"]), ("book", &["city"])]);
        let mut mapping = HashMap::new();
        mapping.insert(
            "book".to_owned(),
            [(
                "city".to_owned(),
                ArgBinding::parse("meta", "city"),
            )]
            .into_iter()
            .collect::<HashMap<_, _>>(),
        );
        let mut t = Tracker::new("u1", "bot", args, HashMap::new(), mapping);
        t.set_arg("meta", "city", json!("berlin"));
        // unset local slot resolves through
        assert_eq!(t.get_arg("book", "city"), Some(json!("berlin")));
        // a local write shadows the source, and does not write back
        t.set_arg("book", "city", json!("paris"));
        assert_eq!(t.get_arg("book", "city"), Some(json!("paris")));
        assert_eq!(t.get_arg("meta", "city"), Some(json!("berlin")));
    }

    #[test]
    fn user_input_pseudo_arg() {
        let mut t = Tracker::new("u1", "bot", HashMap::new(), HashMap::new(), HashMap::new());
        t.update(Event::user_input("book a table"));
        assert_eq!(
            t.get_arg("anything", "_user_input"),
            Some(json!("book a table"))
        );
    }

    #[test]
    fn stack_moves_duplicates_to_top() {
        let mut t = Tracker::new("u1", "bot", HashMap::new(), HashMap::new(), HashMap::new());
        t.push_agent(AgentMarker::new("meta"));
        t.push_agent(AgentMarker::new("book"));
        t.push_agent(AgentMarker::new("meta"));
        assert_eq!(t.stack_names(), vec!["book", "meta"]);
        assert_eq!(t.pop_agent().unwrap().agent, "meta");
    }

    #[test]
    fn history_skips_init_and_marks_failures() {
        let mut t = Tracker::new("u1", "bot", HashMap::new(), HashMap::new(), HashMap::new());
        t.update(Event::user_input("/init"));
        t.update(Event::bot_utter("welcome", "meta"));
        t.update(Event::user_input("hi"));
        t.update(Event::agent_fail("book"));
        let h = t.history_string();
        assert!(!h.contains("/init"));
        assert!(h.contains("meta: welcome"));
        assert!(h.contains("User: hi"));
        assert!(h.contains("<agent 'book' failed to respond.>"));
    }

    #[test]
    fn finished_since_user_input_scopes_to_turn() {
        let mut t = Tracker::new("u1", "bot", HashMap::new(), HashMap::new(), HashMap::new());
        t.update(Event::user_input("a"));
        t.update(Event::agent_complete("old"));
        t.update(Event::user_input("b"));
        t.update(Event::agent_fail("book"));
        assert_eq!(t.finished_since_user_input(), vec!["book"]);
    }

    #[test]
    fn flow_info_counters_and_call_results() {
        let mut info = FlowInfo::default();
        info.count(7);
        info.count(7);
        assert_eq!(info.visits(7), 2);
        assert_eq!(info.visits(9), 0);

        info.set_call_result(7, CallResult::Failed);
        assert_eq!(info.take_call_result(7), Some(CallResult::Failed));
        assert_eq!(info.take_call_result(7), None);
    }

    #[test]
    fn extraction_gate_fires_once_per_message() {
        let mut info = FlowInfo::default();
        let ts = now_ts();
        assert!(info.needs_extraction(ts));
        assert!(!info.needs_extraction(ts));
        // a newer message re-arms the gate
        assert!(info.needs_extraction(now_ts() + 1.0));
    }
}
