//! Steps of a flow program.
//!
//! A flow agent owns named subflows, each a linear list of steps. The
//! interpreter evaluates one step per scheduling slot and advances by the
//! state tag the step returns. Steps are a tagged variant; ids are assigned
//! once at bot-build time and identify steps inside execution paths.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::agents::RunContext;
use crate::error::{BuildError, Result};
use crate::event::{AgentMarker, Event, StepId};
use crate::expr::Expr;
use crate::model::generate_or_empty;
use crate::prompts;
use crate::tools::{ToolStatus, translate_result};
use crate::tracker::{CallResult, FlowInfo, Tracker};
use crate::vars::{ArgRef, interpolate};

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(.*?)""#).expect("quoted-string regex is valid"));

/// State tag a step reports back to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// The step ran; advance to the next sibling.
    Finished,
    /// The step declined to run; advance to the next sibling.
    Skip,
    /// A condition held; descend into the branch (or jump, for `next`).
    Do,
    /// A `call` pushed an agent; resume at this step when it returns.
    Await,
    /// A `call`'s agent failed; advance past the call.
    Failed,
}

/// A guard on an `if` / `else if` step.
#[derive(Debug, Clone)]
pub enum Statement {
    /// Natural-language form: `the user claims "..." or "..."`, decided by
    /// an LLM yes/no classifier.
    Claim {
        /// The quoted example utterances.
        examples: Vec<String>,
    },
    /// Button form: `the user clicks "NAME"`, decided by string match.
    Click {
        /// The quoted button names.
        buttons: Vec<String>,
    },
    /// Expression form, evaluated over the variable store.
    Expr(Expr),
}

impl Statement {
    /// Classify and parse a raw guard.
    ///
    /// # Errors
    ///
    /// Fails when the expression form does not parse.
    pub fn parse(raw: &str) -> std::result::Result<Self, BuildError> {
        if raw.contains("the user claims") {
            return Ok(Self::Claim {
                examples: quoted_strings(raw),
            });
        }
        if raw.contains("the user clicks") {
            return Ok(Self::Click {
                buttons: quoted_strings(raw),
            });
        }
        Ok(Self::Expr(Expr::parse(raw)?))
    }

    async fn holds(&self, tracker: &Tracker, ctx: &RunContext<'_>, owner: &str) -> bool {
        match self {
            Self::Claim { examples } => {
                let prompt = prompts::claim_classifier(examples, tracker.latest_text());
                let reply = generate_or_empty(ctx.model, prompt, &[], None).await;
                reply.iter().any(|event| {
                    matches!(event, Event::BotUtter { text, .. } if text.contains("True"))
                })
            }
            Self::Click { buttons } => click_matches(buttons, tracker.latest_text()),
            Self::Expr(expr) => expr.eval(tracker, owner),
        }
    }
}

/// Whether the user's text presses one of the quoted buttons.
///
/// Accepts the `/click: NAME` surrogate or the bare button name.
fn click_matches(buttons: &[String], user_text: &str) -> bool {
    let text = user_text.trim();
    let name = text
        .strip_prefix("/click:")
        .map_or(text, str::trim);
    buttons.iter().any(|b| b == name)
}

fn quoted_strings(raw: &str) -> Vec<String> {
    QUOTED
        .captures_iter(raw)
        .map(|c| c[1].to_owned())
        .collect()
}

/// One executable unit in a subflow.
#[derive(Debug, Clone)]
pub struct Step {
    /// Stable identifier, unique within a bot.
    pub id: StepId,
    /// What the step does.
    pub kind: StepKind,
}

/// The step variants.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StepKind {
    /// Speak an interpolated utterance.
    Bot {
        /// The authored text, possibly with `${...}` placeholders.
        text: String,
    },
    /// Wait for the next user input.
    User,
    /// Assign values or copies of other slots.
    Set {
        /// `(target, source)` pairs; a string source is tried as a
        /// reference first and falls back to a literal.
        assignments: Vec<(String, Value)>,
    },
    /// Conditional branch.
    If {
        /// The guard.
        statement: Statement,
        /// Steps taken while the guard holds.
        then: Vec<Step>,
        /// Visit budget; exhausted visits skip.
        tries: Option<u32>,
    },
    /// Chained conditional branch.
    ElseIf {
        /// The guard.
        statement: Statement,
        /// Steps taken while the guard holds.
        then: Vec<Step>,
        /// Visit budget.
        tries: Option<u32>,
    },
    /// Unconditional trailing branch.
    Else {
        /// Steps taken.
        then: Vec<Step>,
        /// Visit budget.
        tries: Option<u32>,
    },
    /// Jump target marker.
    Label {
        /// The label name.
        name: String,
    },
    /// Jump to a label or subflow.
    Next {
        /// Target label or subflow name.
        label: String,
        /// Visit budget.
        tries: Option<u32>,
    },
    /// Invoke a tool function or another agent.
    Call {
        /// Function or agent name.
        name: String,
        /// `(target arg, source ref)` pairs copied into the callee.
        args: Vec<(String, ArgRef)>,
    },
    /// Terminate the flow.
    Return {
        /// `true` for success.
        success: bool,
        /// Message carried on the terminal event.
        msg: String,
    },
}

impl Step {
    /// The nested branch of a conditional step, if any.
    #[must_use]
    pub fn then(&self) -> Option<&[Step]> {
        match &self.kind {
            StepKind::If { then, .. }
            | StepKind::ElseIf { then, .. }
            | StepKind::Else { then, .. } => Some(then),
            _ => None,
        }
    }

    /// Whether this step is a chained conditional (`else if` / `else`).
    #[must_use]
    pub const fn is_chained_conditional(&self) -> bool {
        matches!(self.kind, StepKind::ElseIf { .. } | StepKind::Else { .. })
    }

    /// Execute this step.
    ///
    /// `owner` is the agent the step belongs to; `info` is present when the
    /// step runs inside a flow (init steps of an ensemble run without one).
    pub async fn run(
        &self,
        tracker: &mut Tracker,
        mut info: Option<&mut FlowInfo>,
        ctx: &RunContext<'_>,
        owner: &str,
    ) -> Result<(StepState, Vec<Event>)> {
        match &self.kind {
            StepKind::Bot { text } => {
                if let Some(info) = info.as_deref_mut() {
                    info.is_listen = false;
                }
                let rendered = interpolate(text, owner, tracker);
                info!(agent = owner, text = %rendered, "bot step");
                Ok((StepState::Finished, vec![Event::bot_utter(rendered, owner)]))
            }

            StepKind::User => {
                if tracker.has_bot_response_after_user_input()
                    && let Some(info) = info.as_deref_mut()
                {
                    info.is_listen = true;
                }
                info!(agent = owner, "waiting for user input");
                Ok((StepState::Finished, Vec::new()))
            }

            StepKind::Set { assignments } => {
                if let Some(info) = info.as_deref_mut() {
                    info.is_listen = false;
                }
                for (target, source) in assignments {
                    let target_ref = ArgRef::parse(target);
                    let value = match source {
                        Value::String(raw) => {
                            let source_ref = ArgRef::parse(raw);
                            source_ref
                                .lookup(tracker, owner)
                                .unwrap_or_else(|| Value::String(raw.clone()))
                        }
                        other => other.clone(),
                    };
                    let agent = target_ref.agent_or(owner).to_owned();
                    tracker.set_arg(&agent, &target_ref.arg, value);
                }
                info!(agent = owner, "set step applied");
                Ok((StepState::Finished, Vec::new()))
            }

            StepKind::If {
                statement, tries, ..
            }
            | StepKind::ElseIf {
                statement, tries, ..
            } => {
                let Some(info) = info.as_deref_mut() else {
                    return Ok((StepState::Skip, Vec::new()));
                };
                info.is_listen = false;
                if exhausted(info, self.id, *tries) {
                    return Ok((StepState::Skip, Vec::new()));
                }
                info.count(self.id);
                let state = if statement.holds(tracker, ctx, owner).await {
                    StepState::Do
                } else {
                    StepState::Skip
                };
                Ok((state, Vec::new()))
            }

            StepKind::Else { tries, .. } => {
                let Some(info) = info.as_deref_mut() else {
                    return Ok((StepState::Skip, Vec::new()));
                };
                info.is_listen = false;
                if exhausted(info, self.id, *tries) {
                    return Ok((StepState::Skip, Vec::new()));
                }
                info.count(self.id);
                Ok((StepState::Do, Vec::new()))
            }

            StepKind::Label { .. } => {
                if let Some(info) = info.as_deref_mut() {
                    info.is_listen = false;
                }
                Ok((StepState::Finished, Vec::new()))
            }

            StepKind::Next { label, tries } => {
                let Some(info) = info.as_deref_mut() else {
                    return Ok((StepState::Skip, Vec::new()));
                };
                info.is_listen = false;
                if exhausted(info, self.id, *tries) {
                    return Ok((StepState::Skip, Vec::new()));
                }
                info.count(self.id);
                info!(agent = owner, label, "next step jumps");
                Ok((StepState::Do, Vec::new()))
            }

            StepKind::Call { name, args } => {
                if let Some(info) = info.as_deref_mut() {
                    info.is_listen = false;
                }
                if ctx.agents.contains_key(name) {
                    self.call_agent(tracker, info, name, args, owner)
                } else {
                    self.call_tool(tracker, ctx, name, args, owner).await
                }
            }

            StepKind::Return { success, msg } => {
                let event = if *success {
                    Event::agent_complete_with(owner, Value::String(msg.clone()))
                } else {
                    Event::agent_fail_with(owner, Value::String(msg.clone()))
                };
                Ok((StepState::Finished, vec![event]))
            }
        }
    }

    /// Push the called agent with a call-site back-reference, copying bound
    /// arguments over; resume from the recorded result on revisits.
    fn call_agent(
        &self,
        tracker: &mut Tracker,
        info: Option<&mut FlowInfo>,
        name: &str,
        args: &[(String, ArgRef)],
        owner: &str,
    ) -> Result<(StepState, Vec<Event>)> {
        if let Some(info) = info {
            match info.take_call_result(self.id) {
                Some(CallResult::Failed) => return Ok((StepState::Failed, Vec::new())),
                Some(CallResult::Complete) => return Ok((StepState::Finished, Vec::new())),
                None => {}
            }
        }
        info!(agent = owner, callee = name, "call step pushes agent");
        tracker.push_agent(AgentMarker::called_from(name, owner, self.id));
        for (target, source) in args {
            let value = source.lookup(tracker, owner).unwrap_or(Value::Null);
            tracker.set_arg(name, target, value);
        }
        Ok((StepState::Await, Vec::new()))
    }

    /// Execute a tool function synchronously and translate its result.
    async fn call_tool(
        &self,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
        name: &str,
        args: &[(String, ArgRef)],
        owner: &str,
    ) -> Result<(StepState, Vec<Event>)> {
        let Some(tools) = ctx.tools else {
            error!(agent = owner, callee = name, "no tool executor loaded");
            return Ok((StepState::Failed, Vec::new()));
        };

        let mut kwargs = Map::new();
        for (target, source) in args {
            let value = source.lookup(tracker, owner).unwrap_or(Value::Null);
            kwargs.insert(target.clone(), value);
        }
        let outcome = tools.execute(name, kwargs).await;
        info!(agent = owner, function = name, status = ?outcome.status, "executed function");
        if outcome.status == ToolStatus::Error {
            warn!(
                agent = owner,
                function = name,
                error = outcome.error.as_deref().unwrap_or_default(),
                "tool function failed"
            );
            return Ok((StepState::Failed, Vec::new()));
        }

        let mut events = Vec::new();
        if let Some(result) = &outcome.result {
            for event in translate_result(name, result) {
                match event {
                    Event::SetSlot {
                        slot_name, value, ..
                    } => {
                        let slot_ref = ArgRef::parse(&slot_name);
                        let agent = slot_ref.agent_or(name).to_owned();
                        tracker.set_arg(&agent, &slot_ref.arg, value);
                    }
                    Event::BotUtter { text, .. } => {
                        let rendered = interpolate(&text, name, tracker);
                        events.push(Event::bot_utter(rendered, name));
                    }
                    other => events.push(other),
                }
            }
        }
        Ok((StepState::Finished, events))
    }
}

fn exhausted(info: &FlowInfo, id: StepId, tries: Option<u32>) -> bool {
    tries.is_some_and(|limit| info.visits(id) >= limit)
}

// ============================================================================
// Loader
// ============================================================================

/// Allocates bot-unique step ids during assembly.
#[derive(Debug, Default)]
pub struct StepIdGen {
    next: StepId,
}

impl StepIdGen {
    /// Create a generator starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next_id(&mut self) -> StepId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// A flow agent's parsed step program.
#[derive(Debug, Clone)]
pub struct FlowProgram {
    /// Named subflows.
    pub subflows: HashMap<String, Vec<Step>>,
    /// Name of the subflow a fresh flow enters.
    pub main: String,
}

/// Parse one declared step.
///
/// Bare strings are sugar: `"user"` for a user-wait step, anything else for
/// a `next` jump.
pub fn parse_step(
    raw: &Value,
    ids: &mut StepIdGen,
    agent: &str,
) -> std::result::Result<Step, BuildError> {
    let invalid = |message: String| BuildError::InvalidStep {
        agent: agent.to_owned(),
        message,
    };
    let id = ids.next_id();

    if let Some(text) = raw.as_str() {
        let kind = if text == "user" {
            StepKind::User
        } else {
            StepKind::Next {
                label: text.to_owned(),
                tries: None,
            }
        };
        return Ok(Step { id, kind });
    }

    let Some(map) = raw.as_object() else {
        return Err(invalid(format!("step must be a string or object: {raw}")));
    };
    let tries = map.get("tries").and_then(Value::as_u64).map(|t| t as u32);

    let kind = if let Some(text) = map.get("bot").and_then(Value::as_str) {
        StepKind::Bot {
            text: text.to_owned(),
        }
    } else if let Some(data) = map.get("set") {
        let Some(data) = data.as_object() else {
            return Err(invalid("'set' takes a mapping".to_owned()));
        };
        StepKind::Set {
            assignments: data
                .iter()
                .map(|(target, source)| (target.clone(), source.clone()))
                .collect(),
        }
    } else if let Some(statement) = map.get("if") {
        let statement = statement
            .as_str()
            .ok_or_else(|| invalid("'if' condition must be a string".to_owned()))?;
        StepKind::If {
            statement: Statement::parse(statement)?,
            then: parse_branch(map.get("then"), ids, agent)?,
            tries,
        }
    } else if let Some(statement) = map.get("else if") {
        let statement = statement
            .as_str()
            .ok_or_else(|| invalid("'else if' condition must be a string".to_owned()))?;
        StepKind::ElseIf {
            statement: Statement::parse(statement)?,
            then: parse_branch(map.get("then"), ids, agent)?,
            tries,
        }
    } else if let Some(branch) = map.get("else") {
        StepKind::Else {
            then: parse_branch(Some(branch), ids, agent)?,
            tries,
        }
    } else if let Some(name) = map.get("label").and_then(Value::as_str) {
        StepKind::Label {
            name: name.to_owned(),
        }
    } else if let Some(label) = map.get("next").and_then(Value::as_str) {
        StepKind::Next {
            label: label.to_owned(),
            tries,
        }
    } else if let Some(name) = map.get("call").and_then(Value::as_str) {
        let mut args = Vec::new();
        if let Some(declared) = map.get("args") {
            let Some(declared) = declared.as_object() else {
                return Err(invalid("'args' takes a mapping".to_owned()));
            };
            for (target, source) in declared {
                let Some(source) = source.as_str() else {
                    return Err(invalid(format!("call arg '{target}' must reference a slot")));
                };
                args.push((target.clone(), ArgRef::parse(source)));
            }
        }
        StepKind::Call {
            name: name.to_owned(),
            args,
        }
    } else if let Some(spec) = map.get("return").and_then(Value::as_str) {
        let (status, msg) = match spec.split_once(',') {
            Some((status, msg)) => (status.trim(), msg.trim()),
            None => (spec.trim(), ""),
        };
        StepKind::Return {
            success: status == "success",
            msg: msg.to_owned(),
        }
    } else {
        return Err(invalid(format!("unrecognized step: {raw}")));
    };

    Ok(Step { id, kind })
}

fn parse_branch(
    raw: Option<&Value>,
    ids: &mut StepIdGen,
    agent: &str,
) -> std::result::Result<Vec<Step>, BuildError> {
    match raw {
        Some(Value::Array(items)) => parse_step_list(items, ids, agent),
        // a bare string branch is a single step
        Some(single @ Value::String(_)) => Ok(vec![parse_step(single, ids, agent)?]),
        Some(single @ Value::Object(_)) => Ok(vec![parse_step(single, ids, agent)?]),
        _ => Err(BuildError::InvalidStep {
            agent: agent.to_owned(),
            message: "conditional branch must list its steps".to_owned(),
        }),
    }
}

/// Parse a list of declared steps.
pub fn parse_step_list(
    raw: &[Value],
    ids: &mut StepIdGen,
    agent: &str,
) -> std::result::Result<Vec<Step>, BuildError> {
    raw.iter().map(|step| parse_step(step, ids, agent)).collect()
}

/// Parse a flow agent's flat step list into named subflows.
///
/// The string `"end"` closes a subflow, `{begin: name}` opens a named one;
/// unnamed subflows get a generated name. The first subflow is the one a
/// fresh flow enters.
pub fn parse_flow_program(
    raw: &[Value],
    ids: &mut StepIdGen,
    agent: &str,
) -> std::result::Result<FlowProgram, BuildError> {
    let mut subflows: HashMap<String, Vec<Step>> = HashMap::new();
    let mut main: Option<String> = None;
    let mut current_name: Option<String> = None;
    let mut buffer: Vec<Value> = Vec::new();

    let mut close = |name: Option<String>,
                     buffer: &mut Vec<Value>,
                     subflows: &mut HashMap<String, Vec<Step>>,
                     main: &mut Option<String>,
                     ids: &mut StepIdGen|
     -> std::result::Result<(), BuildError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let name = name.unwrap_or_else(generated_name);
        if subflows.contains_key(&name) {
            return Err(BuildError::InvalidStep {
                agent: agent.to_owned(),
                message: format!("duplicate subflow name '{name}'"),
            });
        }
        let steps = parse_step_list(buffer, ids, agent)?;
        buffer.clear();
        if main.is_none() {
            *main = Some(name.clone());
        }
        subflows.insert(name, steps);
        Ok(())
    };

    for item in raw {
        if item.as_str() == Some("end") {
            close(current_name.take(), &mut buffer, &mut subflows, &mut main, ids)?;
            continue;
        }
        if let Some(name) = item.get("begin").and_then(Value::as_str) {
            close(current_name.take(), &mut buffer, &mut subflows, &mut main, ids)?;
            current_name = Some(name.to_owned());
            continue;
        }
        buffer.push(item.clone());
    }
    close(current_name, &mut buffer, &mut subflows, &mut main, ids)?;

    let main = main.ok_or_else(|| BuildError::InvalidStep {
        agent: agent.to_owned(),
        message: "flow agent has no steps".to_owned(),
    })?;
    Ok(FlowProgram { subflows, main })
}

fn generated_name() -> String {
    let mut name = uuid::Uuid::new_v4().simple().to_string();
    name.truncate(8);
    name
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn parse_sugar_forms() {
        let mut ids = StepIdGen::new();
        let user = parse_step(&json!("user"), &mut ids, "f").unwrap();
        assert!(matches!(user.kind, StepKind::User));

        let jump = parse_step(&json!("checkout"), &mut ids, "f").unwrap();
        assert!(matches!(jump.kind, StepKind::Next { ref label, .. } if label == "checkout"));
    }

    #[test]
    fn parse_conditionals_with_string_branch() {
        let mut ids = StepIdGen::new();
        let step = parse_step(
            &json!({"if": "x == 5", "then": [{"bot": "yes"}], "tries": 2}),
            &mut ids,
            "f",
        )
        .unwrap();
        match &step.kind {
            StepKind::If { then, tries, .. } => {
                assert_eq!(then.len(), 1);
                assert_eq!(*tries, Some(2));
            }
            other => panic!("unexpected kind: {other:?}"),
        }

        let chained = parse_step(&json!({"else": {"bot": "no"}}), &mut ids, "f").unwrap();
        assert!(chained.is_chained_conditional());
    }

    #[test]
    fn parse_rejects_bad_guards() {
        let mut ids = StepIdGen::new();
        assert!(parse_step(&json!({"if": "x ==", "then": ["user"]}), &mut ids, "f").is_err());
        assert!(parse_step(&json!({"weird": 1}), &mut ids, "f").is_err());
    }

    #[test]
    fn flow_program_splits_on_end_and_begin() {
        let mut ids = StepIdGen::new();
        let raw = vec![
            json!({"begin": "greet"}),
            json!({"bot": "hi"}),
            json!("end"),
            json!({"begin": "bye"}),
            json!({"bot": "bye"}),
            json!("end"),
        ];
        let program = parse_flow_program(&raw, &mut ids, "f").unwrap();
        assert_eq!(program.main, "greet");
        assert_eq!(program.subflows.len(), 2);
        assert!(program.subflows.contains_key("bye"));
    }

    #[test]
    fn flow_program_without_markers_is_one_subflow() {
        let mut ids = StepIdGen::new();
        let raw = vec![json!({"bot": "hi"}), json!("user"), json!({"bot": "bye"})];
        let program = parse_flow_program(&raw, &mut ids, "f").unwrap();
        assert_eq!(program.subflows.len(), 1);
        assert_eq!(program.subflows[&program.main].len(), 3);
    }

    #[test]
    fn click_matcher_accepts_surrogate_and_bare_name() {
        let buttons = vec!["Yes".to_owned(), "No".to_owned()];
        assert!(click_matches(&buttons, "/click: Yes"));
        assert!(click_matches(&buttons, "Yes"));
        assert!(!click_matches(&buttons, "/click: Maybe"));
        assert!(!click_matches(&buttons, "sure thing"));
    }

    #[test]
    fn quoted_extraction() {
        assert_eq!(
            quoted_strings(r#"the user claims "I want tea" or "give me tea""#),
            vec!["I want tea", "give me tea"]
        );
    }
}
