//! The flow agent: a step-program interpreter.
//!
//! Owns named subflows and walks them one step per scheduling slot, guided
//! by the state tag each step returns. The runtime stack of execution paths
//! lives in the session's [`FlowInfo`], so a flow suspends across calls and
//! user turns and resumes exactly where it left off.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::agents::{Agent, AgentKind, AgentOutput, RunContext};
use crate::error::{BuildError, Result};
use crate::event::Event;
use crate::model::generate_or_empty;
use crate::prompts;
use crate::steps::{FlowProgram, Step, StepKind, StepState};
use crate::tracker::{ExecPath, FlowInfo, Tracker};

/// A step-program agent.
#[derive(Debug)]
pub struct FlowAgent {
    name: String,
    description: String,
    program: FlowProgram,
    labels: std::collections::HashMap<String, ExecPath>,
    args: Vec<String>,
    fallback: Option<String>,
    called_agents: Vec<String>,
    collects_input: bool,
}

/// What became of the flow after advancing past the executed step.
enum Outcome {
    /// A next step is scheduled; the flow stays alive.
    Continue,
    /// The flow terminated; optionally with a completion event to emit.
    Complete(Option<Event>),
}

impl FlowAgent {
    /// Build a flow agent over a parsed program.
    ///
    /// # Errors
    ///
    /// Fails when a `next` step targets a label that exists nowhere in the
    /// program.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        program: FlowProgram,
        args: Vec<String>,
        fallback: Option<String>,
    ) -> std::result::Result<Self, BuildError> {
        let name = name.into();
        let labels = find_all_labels(&program);
        let called_agents = collect_call_targets(&program);
        let collects_input = contains_user_step(&program);

        for subflow in program.subflows.values() {
            validate_jump_targets(&name, subflow, &labels)?;
        }

        Ok(Self {
            name,
            description: description.into(),
            program,
            labels,
            args,
            fallback,
            called_agents,
            collects_input,
        })
    }

    /// Locate the sibling list and index a path points at.
    fn locate(&self, path: &ExecPath) -> Option<(&[Step], usize)> {
        let mut siblings: &[Step] = self.program.subflows.get(&path.subflow)?;
        for (depth, id) in path.steps.iter().enumerate() {
            let idx = siblings.iter().position(|s| s.id == *id)?;
            if depth + 1 == path.steps.len() {
                return Some((siblings, idx));
            }
            siblings = siblings[idx].then()?;
        }
        None
    }

    fn step_at(&self, path: &ExecPath) -> Option<&Step> {
        self.locate(path).map(|(siblings, idx)| &siblings[idx])
    }

    /// Advance past the step the top path addresses, given its state tag.
    ///
    /// Returns the completion event once the whole program is exhausted;
    /// `None` means a next step was scheduled.
    fn advance(&self, info: &mut FlowInfo, mut state: StepState) -> Option<Event> {
        debug!(flow = %self.name, stack = ?info.runtime_stack, "advancing");
        let mut next_path: Option<ExecPath> = None;

        while next_path.is_none() {
            let Some(path) = info.pop() else {
                break;
            };
            let Some((siblings, idx)) = self.locate(&path) else {
                error!(flow = %self.name, ?path, "execution path no longer resolves");
                state = StepState::Finished;
                continue;
            };
            let step = &siblings[idx];

            match (&step.kind, state) {
                // a held condition descends into its branch, keeping the
                // conditional's own path underneath as the return frame
                (
                    StepKind::If { then, .. }
                    | StepKind::ElseIf { then, .. }
                    | StepKind::Else { then, .. },
                    StepState::Do,
                ) => {
                    if let Some(first) = then.first() {
                        let child = path.child(first.id);
                        info.push(path);
                        next_path = Some(child);
                    } else {
                        state = StepState::Finished;
                        // re-examine the same frame as a finished sibling
                        info.push(path);
                    }
                }

                // a jump clears the whole stack and restarts at the label
                (StepKind::Next { label, .. }, StepState::Do) => {
                    if let Some(target) = self.labels.get(label) {
                        info.clear();
                        next_path = Some(target.clone());
                    } else {
                        error!(flow = %self.name, label, "jump target vanished");
                        state = StepState::Finished;
                        info.push(path);
                    }
                }

                // an awaiting call resumes at the very same step
                (StepKind::Call { .. }, StepState::Await) => {
                    next_path = Some(path);
                }

                // everything else advances to the next sibling; a satisfied
                // if/else-if skips the rest of its conditional chain
                _ => {
                    let skip_chained = state == StepState::Finished
                        && matches!(step.kind, StepKind::If { .. } | StepKind::ElseIf { .. });
                    let next = siblings[idx + 1..]
                        .iter()
                        .find(|s| !(skip_chained && s.is_chained_conditional()));
                    match next {
                        Some(sibling) => next_path = Some(path.sibling(sibling.id)),
                        None => state = StepState::Finished,
                    }
                }
            }
        }

        match next_path {
            Some(path) => {
                info.push(path);
                None
            }
            None => {
                info.is_listen = false;
                Some(Event::agent_complete(&self.name))
            }
        }
    }

    /// The once-per-turn extraction pre-step.
    ///
    /// Asks the model whether the latest message transfers intent away from
    /// this flow (or quits) and extracts declared args it mentions. Returns
    /// the failure events when the flow should give up the turn.
    async fn extract_message_args(
        &self,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
    ) -> Option<Vec<Event>> {
        let mut other_agents: Vec<String> = tracker
            .arg_agent_names()
            .into_iter()
            .filter(|agent| *agent != self.name)
            .filter(|agent| !self.called_agents.iter().any(|c| c == agent))
            .map(str::to_owned)
            .collect();
        other_agents.sort();

        let prompt = prompts::flow_extraction(
            &self.name,
            &self.description,
            &other_agents,
            &self.args,
            self.collects_input,
            tracker.latest_text(),
        );
        let result = generate_or_empty(ctx.model, prompt, &[], None).await;

        if result.iter().any(Event::is_terminal) {
            return Some(result);
        }
        for event in &result {
            if let Event::BotUtter { text, .. } = event {
                let Ok(Value::Object(response)) = serde_json::from_str::<Value>(text) else {
                    warn!(flow = %self.name, text = %text, "extraction reply is not JSON");
                    continue;
                };
                if let Some(Value::Object(data)) = response.get("data") {
                    for (arg, value) in data {
                        tracker.set_arg(&self.name, arg, value.clone());
                    }
                }
                if response.get("status").and_then(Value::as_str) == Some("quit") {
                    return Some(vec![Event::agent_fail(&self.name)]);
                }
            }
        }
        None
    }

    /// Run the fallback agent after a mid-flow quit, re-attributing its
    /// utterances to this flow.
    async fn run_fallback(
        &self,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
    ) -> Result<Vec<Event>> {
        let Some(fallback) = self.fallback.as_ref().and_then(|f| ctx.agents.get(f)) else {
            return Ok(Vec::new());
        };
        let output = fallback.run(tracker, ctx).await?;
        Ok(output
            .events
            .into_iter()
            .map(|event| match event {
                Event::BotUtter {
                    text,
                    additional,
                    timestamp,
                    ..
                } => Event::BotUtter {
                    text,
                    provider: Some(self.name.clone()),
                    additional,
                    timestamp,
                },
                other => other,
            })
            .collect())
    }

    fn initial_path(&self) -> Option<ExecPath> {
        let steps = self.program.subflows.get(&self.program.main)?;
        let first = match steps.first() {
            Some(step) if matches!(step.kind, StepKind::User) && steps.len() > 1 => &steps[1],
            Some(step) => step,
            None => return None,
        };
        Some(ExecPath::new(&self.program.main, first.id))
    }
}

#[async_trait]
impl Agent for FlowAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Flow
    }

    fn declared_args(&self) -> &[String] {
        &self.args
    }

    async fn run(&self, tracker: &mut Tracker, ctx: &RunContext<'_>) -> Result<AgentOutput> {
        let mut info = tracker.take_flow_info(&self.name);

        // intent-transfer and argument extraction, once per user message;
        // the reserved /init text carries nothing worth extracting
        if info.needs_extraction(tracker.latest_timestamp()) && tracker.latest_text() != "/init" {
            if let Some(mut fail_events) = self.extract_message_args(tracker, ctx).await {
                let fallback_events = self.run_fallback(tracker, ctx).await?;
                fail_events.extend(fallback_events);
                tracker.put_flow_info(&self.name, info);
                return Ok(AgentOutput::run_on(fail_events));
            }
        }

        if info.is_stack_empty() {
            match self.initial_path() {
                Some(path) => info.push(path),
                None => {
                    error!(flow = %self.name, "flow has no executable steps");
                    return Ok(AgentOutput::run_on(vec![Event::agent_fail(&self.name)]));
                }
            }
        }

        let Some(path) = info.peek().cloned() else {
            return Ok(AgentOutput::run_on(vec![Event::agent_fail(&self.name)]));
        };
        let Some(step) = self.step_at(&path) else {
            error!(flow = %self.name, ?path, "current path resolves to no step");
            tracker.remove_flow_info(&self.name);
            return Ok(AgentOutput::run_on(vec![Event::agent_fail(&self.name)]));
        };
        debug!(flow = %self.name, step = ?step.kind, "executing step");

        let is_return = matches!(step.kind, StepKind::Return { .. });
        let (state, mut events) = step.run(tracker, Some(&mut info), ctx, &self.name).await?;

        let outcome = if is_return {
            Outcome::Complete(None)
        } else {
            match self.advance(&mut info, state) {
                Some(completion) => Outcome::Complete(Some(completion)),
                None => Outcome::Continue,
            }
        };

        let is_end = info.is_listen;
        match outcome {
            Outcome::Continue => tracker.put_flow_info(&self.name, info),
            Outcome::Complete(extra) => {
                events.extend(extra);
                tracker.remove_flow_info(&self.name);
            }
        }
        Ok(AgentOutput { is_end, events })
    }
}

/// Map every label name and subflow name to its execution path.
fn find_all_labels(program: &FlowProgram) -> std::collections::HashMap<String, ExecPath> {
    fn recurse(
        steps: &[Step],
        prefix: &ExecPath,
        out: &mut std::collections::HashMap<String, ExecPath>,
    ) {
        for step in steps {
            let path = prefix.child(step.id);
            if let StepKind::Label { name } = &step.kind {
                out.insert(name.clone(), path.clone());
            }
            if let Some(branch) = step.then() {
                recurse(branch, &path, out);
            }
        }
    }

    let mut labels = std::collections::HashMap::new();
    for (subflow_name, steps) in &program.subflows {
        let Some(first) = steps.first() else { continue };
        labels.insert(subflow_name.clone(), ExecPath::new(subflow_name, first.id));
        let root = ExecPath {
            subflow: subflow_name.clone(),
            steps: Vec::new(),
        };
        recurse(steps, &root, &mut labels);
    }
    labels
}

fn collect_call_targets(program: &FlowProgram) -> Vec<String> {
    fn recurse(steps: &[Step], out: &mut Vec<String>) {
        for step in steps {
            if let StepKind::Call { name, .. } = &step.kind
                && !out.contains(name)
            {
                out.push(name.clone());
            }
            if let Some(branch) = step.then() {
                recurse(branch, out);
            }
        }
    }
    let mut out = Vec::new();
    for steps in program.subflows.values() {
        recurse(steps, &mut out);
    }
    out
}

fn contains_user_step(program: &FlowProgram) -> bool {
    fn recurse(steps: &[Step]) -> bool {
        steps.iter().any(|step| {
            matches!(step.kind, StepKind::User) || step.then().is_some_and(recurse)
        })
    }
    program.subflows.values().any(|steps| recurse(steps))
}

fn validate_jump_targets(
    flow: &str,
    steps: &[Step],
    labels: &std::collections::HashMap<String, ExecPath>,
) -> std::result::Result<(), BuildError> {
    for step in steps {
        if let StepKind::Next { label, .. } = &step.kind
            && !labels.contains_key(label)
        {
            return Err(BuildError::MissingReference {
                agent: flow.to_owned(),
                target: label.clone(),
            });
        }
        if let Some(branch) = step.then() {
            validate_jump_targets(flow, branch, labels)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::providers::MockModel;
    use crate::steps::{StepIdGen, parse_flow_program};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn flow_from(steps: Vec<Value>) -> FlowAgent {
        let mut ids = StepIdGen::new();
        let program = parse_flow_program(&steps, &mut ids, "order").unwrap();
        FlowAgent::new("order", "take orders", program, vec![], None).unwrap()
    }

    fn tracker_for(flow: &FlowAgent, text: &str) -> Tracker {
        let mut template: HashMap<String, HashMap<String, Value>> = HashMap::new();
        template.insert(flow.name().to_owned(), HashMap::new());
        let mut tracker = Tracker::new("u1", "bot", template, HashMap::new(), HashMap::new());
        tracker.update(Event::user_input(text));
        tracker
    }

    /// Drive the flow like the scheduler would, collecting utterances,
    /// until it listens or completes.
    async fn drive(flow: &FlowAgent, tracker: &mut Tracker) -> (Vec<String>, bool) {
        let agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let model = MockModel::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let mut texts = Vec::new();
        loop {
            let out = flow.run(tracker, &ctx).await.unwrap();
            let mut completed = false;
            for event in out.events {
                match event {
                    Event::BotUtter { text, .. } => {
                        tracker.update(Event::bot_utter(text.clone(), flow.name()));
                        texts.push(text);
                    }
                    e @ (Event::AgentComplete { .. } | Event::AgentFail { .. }) => {
                        tracker.update(e);
                        completed = true;
                    }
                    _ => {}
                }
            }
            if completed {
                return (texts, true);
            }
            if out.is_end {
                return (texts, false);
            }
        }
    }

    #[tokio::test]
    async fn speak_and_wait_then_finish() {
        let flow = flow_from(vec![json!({"bot": "hi"}), json!("user"), json!({"bot": "bye"})]);

        let mut tracker = tracker_for(&flow, "/init");
        let (texts, completed) = drive(&flow, &mut tracker).await;
        assert_eq!(texts, vec!["hi"]);
        assert!(!completed);
        assert!(tracker.flow_info("order").is_some());

        tracker.update(Event::user_input("anything"));
        let (texts, completed) = drive(&flow, &mut tracker).await;
        assert_eq!(texts, vec!["bye"]);
        assert!(completed);
        assert!(tracker.flow_info("order").is_none());
    }

    #[tokio::test]
    async fn condition_picks_then_branch_and_skips_chain() {
        let flow = flow_from(vec![
            json!({"set": {"x": 5}}),
            json!({"if": "x == 5", "then": [{"bot": "yes"}]}),
            json!({"else": [{"bot": "no"}]}),
            json!({"bot": "after"}),
        ]);
        let mut template: HashMap<String, HashMap<String, Value>> = HashMap::new();
        template.insert(
            "order".to_owned(),
            [("x".to_owned(), Value::Null)].into_iter().collect(),
        );
        let mut tracker = Tracker::new("u1", "bot", template, HashMap::new(), HashMap::new());
        tracker.update(Event::user_input("go"));

        let (texts, completed) = drive(&flow, &mut tracker).await;
        assert_eq!(texts, vec!["yes", "after"]);
        assert!(completed);
    }

    #[tokio::test]
    async fn else_branch_taken_when_condition_fails() {
        let flow = flow_from(vec![
            json!({"if": "x == 5", "then": [{"bot": "yes"}]}),
            json!({"else": [{"bot": "no"}]}),
        ]);
        let mut template: HashMap<String, HashMap<String, Value>> = HashMap::new();
        template.insert(
            "order".to_owned(),
            [("x".to_owned(), Value::Null)].into_iter().collect(),
        );
        let mut tracker = Tracker::new("u1", "bot", template, HashMap::new(), HashMap::new());
        tracker.update(Event::user_input("go"));

        let (texts, _) = drive(&flow, &mut tracker).await;
        assert_eq!(texts, vec!["no"]);
    }

    #[tokio::test]
    async fn tries_limit_forces_skip() {
        // loops back to the label twice, then the jump is exhausted
        let flow = flow_from(vec![
            json!({"label": "top"}),
            json!({"bot": "ping"}),
            json!({"next": "top", "tries": 2}),
            json!({"bot": "done"}),
        ]);
        let mut tracker = tracker_for(&flow, "go");
        let (texts, completed) = drive(&flow, &mut tracker).await;
        assert_eq!(texts, vec!["ping", "ping", "ping", "done"]);
        assert!(completed);
    }

    #[tokio::test]
    async fn leading_user_step_is_skipped_on_entry() {
        let flow = flow_from(vec![json!("user"), json!({"bot": "heard you"})]);
        let mut tracker = tracker_for(&flow, "hello");
        let (texts, completed) = drive(&flow, &mut tracker).await;
        assert_eq!(texts, vec!["heard you"]);
        assert!(completed);
    }

    #[test]
    fn unknown_jump_target_fails_at_build() {
        let mut ids = StepIdGen::new();
        let program =
            parse_flow_program(&[json!({"next": "nowhere"})], &mut ids, "order").unwrap();
        let err = FlowAgent::new("order", "", program, vec![], None).unwrap_err();
        assert!(matches!(err, BuildError::MissingReference { .. }));
    }

    #[test]
    fn labels_cover_subflows_and_nested_labels() {
        let mut ids = StepIdGen::new();
        let program = parse_flow_program(
            &[
                json!({"bot": "a"}),
                json!({"if": "x == 1", "then": [{"label": "inner"}, {"bot": "b"}]}),
                json!("end"),
                json!({"begin": "other"}),
                json!({"bot": "c"}),
                json!("end"),
            ],
            &mut ids,
            "order",
        )
        .unwrap();
        let flow = FlowAgent::new("order", "", program, vec![], None).unwrap();
        assert!(flow.labels.contains_key("inner"));
        assert!(flow.labels.contains_key("other"));
        let inner = &flow.labels["inner"];
        assert_eq!(inner.steps.len(), 2);
    }
}
