//! Bot assembly and the session API.
//!
//! A [`Bot`] is built once from a parsed package and is immutable
//! afterwards: the agent graph, prompts, parsed step programs and tool
//! descriptors are shared across every session without locking. All mutable
//! state lives in per-session trackers behind the [`TrackerStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agents::{
    Agent, EnsembleAgent, Entrypoint, ExitAgent, FallbackAgent, FaqRetriever, FlowAgent, KbAgent,
    LlmAgent, Retriever, RunContext,
};
use crate::config::{AgentDecl, BotPackage, LlmConfig, arg_names};
use crate::error::BuildError;
use crate::event::Event;
use crate::model::Model;
use crate::providers::OpenAiModel;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::steps::{StepIdGen, parse_flow_program, parse_step_list};
use crate::store::TrackerStore;
use crate::tools::ToolExecutor;
use crate::tracker::{ArgBinding, Tracker};

/// Everything injected into assembly besides the package itself.
pub struct BotOptions {
    /// The model adapter shared by every agent.
    pub model: Arc<dyn Model>,
    /// The tool-function executor, when a tool script was loaded.
    pub tools: Option<Arc<dyn ToolExecutor>>,
    /// Retriever override for knowledge-base agents; without one, FAQ
    /// entries are indexed in-process and file/web sources are skipped.
    pub retriever: Option<Arc<dyn Retriever>>,
    /// Scheduler tuning.
    pub scheduler: SchedulerConfig,
}

impl std::fmt::Debug for BotOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotOptions")
            .field("model", &self.model.model_id())
            .field("has_tools", &self.tools.is_some())
            .field("has_retriever", &self.retriever.is_some())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl BotOptions {
    /// Options around a model, with everything else at defaults.
    #[must_use]
    pub fn with_model(model: Arc<dyn Model>) -> Self {
        Self {
            model,
            tools: None,
            retriever: None,
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Attach a tool executor.
    #[must_use]
    pub fn tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Attach a retriever for knowledge-base agents.
    #[must_use]
    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Override scheduler tuning.
    #[must_use]
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

/// One assembled bot.
pub struct Bot {
    name: String,
    agents: HashMap<String, Arc<dyn Agent>>,
    entrypoint: Arc<dyn Agent>,
    model: Arc<dyn Model>,
    tools: Option<Arc<dyn ToolExecutor>>,
    scheduler: Scheduler,
    store: TrackerStore,
    args_template: HashMap<String, HashMap<String, Value>>,
    func_args_template: HashMap<String, HashMap<String, Value>>,
    mapping: HashMap<String, HashMap<String, ArgBinding>>,
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("name", &self.name)
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("sessions", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl Bot {
    /// Assemble a bot from a parsed package and injected collaborators.
    ///
    /// # Errors
    ///
    /// Fails fast on any structural problem: unknown agent types, missing
    /// references, malformed steps or guards, unsupported schedules.
    pub fn assemble(
        name: impl Into<String>,
        data: &Value,
        options: BotOptions,
    ) -> std::result::Result<Self, BuildError> {
        let name = name.into();
        let package = BotPackage::from_value(data)?;
        if package.main.schedule() != "priority" {
            return Err(BuildError::UnsupportedSchedule(
                package.main.schedule().to_owned(),
            ));
        }

        let mut ids = StepIdGen::new();
        let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let mut mapping: HashMap<String, HashMap<String, ArgBinding>> = HashMap::new();

        for (agent_name, decl) in &package.agents {
            let agent = build_agent(agent_name, decl, &mut ids, &options, &mut mapping)?;
            agents.insert(agent_name.clone(), agent);
        }

        // fallback/exit declarations may register derived agents
        for (agent_name, decl) in &package.agents {
            resolve_sub_agent(agent_name, decl.fallback.as_ref(), "Fallback", &mut agents)?;
            resolve_sub_agent(agent_name, decl.exit.as_ref(), "Exit", &mut agents)?;
        }

        validate_references(&package, &agents)?;

        let entrypoint_steps = parse_step_list(&package.main.steps, &mut ids, "main")?;
        for step in &entrypoint_steps {
            if let crate::steps::StepKind::Call { name: target, .. } = &step.kind
                && !agents.contains_key(target)
            {
                return Err(BuildError::MissingReference {
                    agent: "main".to_owned(),
                    target: target.clone(),
                });
            }
        }
        let entrypoint: Arc<dyn Agent> = Arc::new(Entrypoint::new(entrypoint_steps));

        let args_template = build_args_template(&agents);
        let func_args_template = options
            .tools
            .as_deref()
            .map(build_func_args_template)
            .unwrap_or_default();

        info!(bot = %name, agents = agents.len(), "bot assembled");
        Ok(Self {
            name,
            agents,
            entrypoint,
            model: options.model,
            tools: options.tools,
            scheduler: Scheduler::new(options.scheduler),
            store: TrackerStore::new(),
            args_template,
            func_args_template,
            mapping,
        })
    }

    /// Assemble with the OpenAI-compatible provider from `llm_config`.
    ///
    /// # Errors
    ///
    /// Fails on model configuration problems or any assembly error.
    pub fn from_config(
        name: impl Into<String>,
        data: &Value,
        llm_config: Option<&LlmConfig>,
        tools: Option<Arc<dyn ToolExecutor>>,
    ) -> std::result::Result<Self, BuildError> {
        let config = llm_config.cloned().unwrap_or_default();
        let model: Arc<dyn Model> = Arc::new(OpenAiModel::new(&config)?);
        let mut options = BotOptions::with_model(model);
        if let Some(tools) = tools {
            options = options.tools(tools);
        }
        Self::assemble(name, data, options)
    }

    /// The bot's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The named agents.
    #[must_use]
    pub fn agents(&self) -> &HashMap<String, Arc<dyn Agent>> {
        &self.agents
    }

    /// The session store (for diagnostics snapshots).
    #[must_use]
    pub fn store(&self) -> &TrackerStore {
        &self.store
    }

    fn run_context(&self) -> RunContext<'_> {
        RunContext {
            agents: &self.agents,
            tools: self.tools.as_deref(),
            model: self.model.as_ref(),
        }
    }

    /// Handle one inbound message for a session and return the bot's
    /// ordered text responses.
    ///
    /// Turns for one session fully serialize on the session lock; separate
    /// sessions progress in parallel.
    pub async fn handle_message(&self, user_id: &str, text: &str) -> Vec<String> {
        let shared = self.store.get_or_create(user_id, |user_id| {
            Tracker::new(
                user_id,
                &self.name,
                self.args_template.clone(),
                self.func_args_template.clone(),
                self.mapping.clone(),
            )
        });
        let mut tracker = shared.lock().await;
        tracker.update(Event::user_input(text));

        let started = Instant::now();
        let responses = self
            .scheduler
            .predict_next_action(&mut tracker, &self.entrypoint, &self.run_context())
            .await;
        debug!(
            user = user_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            responses = responses.len(),
            "turn finished"
        );
        responses
    }
}

/// Owns named bots and routes messages to them.
#[derive(Debug, Default)]
pub struct Manager {
    bots: Mutex<HashMap<String, Arc<Bot>>>,
}

impl Manager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a bot built from a parsed package.
    ///
    /// # Errors
    ///
    /// Propagates assembly failures; the previous bot of the same name, if
    /// any, stays installed in that case.
    pub fn load(
        &self,
        name: &str,
        data: &Value,
        llm_config: Option<&LlmConfig>,
        tools: Option<Arc<dyn ToolExecutor>>,
    ) -> std::result::Result<(), BuildError> {
        let bot = Bot::from_config(name, data, llm_config, tools)?;
        self.insert(bot);
        Ok(())
    }

    /// Install an already-assembled bot.
    pub fn insert(&self, bot: Bot) {
        let mut bots = self.bots.lock().unwrap_or_else(PoisonError::into_inner);
        bots.insert(bot.name().to_owned(), Arc::new(bot));
    }

    /// Fetch an installed bot.
    #[must_use]
    pub fn get_bot(&self, name: &str) -> Option<Arc<Bot>> {
        let bots = self.bots.lock().unwrap_or_else(PoisonError::into_inner);
        bots.get(name).map(Arc::clone)
    }

    /// Names of all installed bots.
    #[must_use]
    pub fn bots(&self) -> Vec<String> {
        let bots = self.bots.lock().unwrap_or_else(PoisonError::into_inner);
        bots.keys().cloned().collect()
    }

    /// Route one message to a named bot.
    pub async fn chat(&self, bot_name: &str, user_id: &str, text: &str) -> Vec<String> {
        match self.get_bot(bot_name) {
            Some(bot) => bot.handle_message(user_id, text).await,
            None => {
                warn!(bot = bot_name, "message for unknown bot");
                Vec::new()
            }
        }
    }
}

// ============================================================================
// Assembly helpers
// ============================================================================

fn build_agent(
    name: &str,
    decl: &AgentDecl,
    ids: &mut StepIdGen,
    options: &BotOptions,
    mapping: &mut HashMap<String, HashMap<String, ArgBinding>>,
) -> std::result::Result<Arc<dyn Agent>, BuildError> {
    let description = decl.description.clone().unwrap_or_default();
    let args = arg_names(decl.args.as_ref());

    match decl.kind.as_str() {
        "flow agent" => {
            let steps = decl.steps.as_deref().ok_or_else(|| BuildError::InvalidStep {
                agent: name.to_owned(),
                message: "flow agent requires steps".to_owned(),
            })?;
            let program = parse_flow_program(steps, ids, name)?;
            let fallback = sub_agent_name(name, decl.fallback.as_ref(), "Fallback");
            Ok(Arc::new(FlowAgent::new(
                name,
                description,
                program,
                args,
                fallback,
            )?))
        }

        "llm agent" => {
            let prompt = decl.prompt.clone().ok_or_else(|| {
                BuildError::InvalidPackage(format!("llm agent '{name}' requires a prompt"))
            })?;
            Ok(Arc::new(LlmAgent::new(
                name,
                description,
                prompt,
                args,
                decl.uses.clone().unwrap_or_default(),
            )))
        }

        "ensemble agent" => {
            let (contains, bindings) = unwrap_contains(name, decl.contains.as_ref())?;
            for (candidate, candidate_bindings) in bindings {
                mapping.entry(candidate).or_default().extend(candidate_bindings);
            }
            let steps = match &decl.steps {
                Some(raw) => parse_step_list(raw, ids, name)?,
                None => Vec::new(),
            };
            let fallback = sub_agent_name(name, decl.fallback.as_ref(), "Fallback");
            let exit = sub_agent_name(name, decl.exit.as_ref(), "Exit");
            Ok(Arc::new(EnsembleAgent::new(
                name,
                description,
                contains,
                steps,
                args,
                fallback,
                exit,
            )))
        }

        "kb agent" => {
            let retriever: Arc<dyn Retriever> = match &options.retriever {
                Some(retriever) => Arc::clone(retriever),
                None => {
                    if decl.file.is_some() || decl.web.is_some() || decl.sources.is_some() {
                        warn!(
                            agent = name,
                            "file/web sources need an injected retriever; indexing faq only"
                        );
                    }
                    Arc::new(FaqRetriever::new(decl.faq.clone().unwrap_or_default()))
                }
            };
            Ok(Arc::new(KbAgent::new(
                name,
                description,
                retriever,
                decl.top_k.unwrap_or(3),
                decl.similarity_threshold.unwrap_or(0.0),
            )))
        }

        other => Err(BuildError::UnknownAgentType {
            agent: name.to_owned(),
            kind: other.to_owned(),
        }),
    }
}

/// Split ensemble `contains` entries into candidate names and arg bindings.
///
/// An entry is either a bare name or `{name: {args: {local: "ref shared"}}}`.
#[allow(clippy::type_complexity)]
fn unwrap_contains(
    ensemble: &str,
    contains: Option<&Vec<Value>>,
) -> std::result::Result<(Vec<String>, Vec<(String, HashMap<String, ArgBinding>)>), BuildError> {
    let mut names = Vec::new();
    let mut bindings = Vec::new();
    let Some(contains) = contains else {
        return Ok((names, bindings));
    };
    for entry in contains {
        match entry {
            Value::String(name) => names.push(name.clone()),
            Value::Object(map) => {
                let Some((name, detail)) = map.iter().next() else {
                    continue;
                };
                names.push(name.clone());
                if let Some(Value::Object(args)) = detail.get("args") {
                    let mut candidate_bindings = HashMap::new();
                    for (local, source) in args {
                        let Some(source) = source.as_str() else {
                            return Err(BuildError::InvalidPackage(format!(
                                "ensemble '{ensemble}': binding for '{name}.{local}' must be a string"
                            )));
                        };
                        candidate_bindings
                            .insert(local.clone(), ArgBinding::parse(ensemble, source));
                    }
                    bindings.push((name.clone(), candidate_bindings));
                }
            }
            other => {
                return Err(BuildError::InvalidPackage(format!(
                    "ensemble '{ensemble}': invalid contains entry {other}"
                )));
            }
        }
    }
    Ok((names, bindings))
}

/// The runtime name a declared fallback/exit resolves to.
fn sub_agent_name(owner: &str, decl: Option<&Value>, role: &str) -> Option<String> {
    match decl {
        None => None,
        Some(Value::String(name)) if name == "default" => {
            Some(format!("Default{role}Agent_{owner}"))
        }
        Some(Value::String(name)) => Some(name.clone()),
        Some(Value::Object(_)) => Some(format!("{role}Agent_{owner}")),
        Some(_) => None,
    }
}

/// Register derived fallback/exit agents for `"default"` and policy-object
/// declarations; named references are validated later.
fn resolve_sub_agent(
    owner: &str,
    decl: Option<&Value>,
    role: &str,
    agents: &mut HashMap<String, Arc<dyn Agent>>,
) -> std::result::Result<(), BuildError> {
    let Some(runtime_name) = sub_agent_name(owner, decl, role) else {
        return Ok(());
    };
    if agents.contains_key(&runtime_name) {
        return Ok(());
    }
    let policy = decl
        .and_then(|d| d.get("policy"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let is_derived = matches!(decl, Some(Value::String(s)) if s == "default")
        || matches!(decl, Some(Value::Object(_)));
    if !is_derived {
        // a plain name referencing another declared agent
        return match agents.contains_key(&runtime_name) {
            true => Ok(()),
            false => Err(BuildError::MissingReference {
                agent: owner.to_owned(),
                target: runtime_name,
            }),
        };
    }

    let agent: Arc<dyn Agent> = match role {
        "Exit" => match policy {
            Some(policy) => Arc::new(ExitAgent::with_response(runtime_name.clone(), policy)),
            None => Arc::new(ExitAgent::new(runtime_name.clone())),
        },
        _ => match policy {
            Some(policy) => Arc::new(FallbackAgent::canned(runtime_name.clone(), policy)),
            None => Arc::new(FallbackAgent::generated(runtime_name.clone())),
        },
    };
    agents.insert(runtime_name, agent);
    Ok(())
}

/// Every cross-agent reference must resolve before the first message.
fn validate_references(
    package: &BotPackage,
    agents: &HashMap<String, Arc<dyn Agent>>,
) -> std::result::Result<(), BuildError> {
    for (name, decl) in &package.agents {
        if decl.kind == "ensemble agent"
            && let Some(contains) = &decl.contains
        {
            for entry in contains {
                let candidate = match entry {
                    Value::String(candidate) => Some(candidate.clone()),
                    Value::Object(map) => map.keys().next().cloned(),
                    _ => None,
                };
                if let Some(candidate) = candidate
                    && !agents.contains_key(&candidate)
                {
                    return Err(BuildError::MissingReference {
                        agent: name.clone(),
                        target: candidate,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Null-initialized slots for every agent's declared args.
fn build_args_template(
    agents: &HashMap<String, Arc<dyn Agent>>,
) -> HashMap<String, HashMap<String, Value>> {
    agents
        .iter()
        .map(|(name, agent)| {
            let slots = agent
                .declared_args()
                .iter()
                .map(|arg| (arg.clone(), Value::Null))
                .collect();
            (name.clone(), slots)
        })
        .collect()
}

/// Null-initialized slots for every loaded tool function's parameters.
fn build_func_args_template(
    tools: &dyn ToolExecutor,
) -> HashMap<String, HashMap<String, Value>> {
    tools
        .names()
        .into_iter()
        .filter_map(|name| tools.get(&name))
        .map(|descriptor| {
            let slots = descriptor
                .arg_names()
                .into_iter()
                .map(|arg| (arg, Value::Null))
                .collect();
            (descriptor.name, slots)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::providers::MockModel;
    use serde_json::json;

    fn options() -> BotOptions {
        BotOptions::with_model(Arc::new(MockModel::new()))
    }

    #[test]
    fn assemble_validates_agent_types_and_references() {
        let bad_type = json!({
            "main": {"steps": [{"call": "meta"}]},
            "meta": {"type": "mystery agent"},
        });
        assert!(matches!(
            Bot::assemble("b", &bad_type, options()).unwrap_err(),
            BuildError::UnknownAgentType { .. }
        ));

        let missing_candidate = json!({
            "main": {"steps": [{"call": "meta"}]},
            "meta": {"type": "ensemble agent", "contains": ["ghost"]},
        });
        assert!(matches!(
            Bot::assemble("b", &missing_candidate, options()).unwrap_err(),
            BuildError::MissingReference { .. }
        ));

        let missing_entrypoint = json!({
            "main": {"steps": [{"call": "ghost"}]},
            "meta": {"type": "ensemble agent", "contains": []},
        });
        assert!(matches!(
            Bot::assemble("b", &missing_entrypoint, options()).unwrap_err(),
            BuildError::MissingReference { .. }
        ));
    }

    #[test]
    fn assemble_rejects_unsupported_schedule() {
        let data = json!({
            "main": {"steps": [{"call": "meta", "schedule": "dispatcher"}]},
            "meta": {"type": "ensemble agent", "contains": []},
        });
        assert!(matches!(
            Bot::assemble("b", &data, options()).unwrap_err(),
            BuildError::UnsupportedSchedule(_)
        ));
    }

    #[test]
    fn contains_bindings_build_the_mapping() {
        let data = json!({
            "main": {"steps": [{"call": "meta"}]},
            "meta": {
                "type": "ensemble agent",
                "args": ["date_from_main"],
                "contains": [
                    {"book": {"args": {"date": "ref date_from_main"}}}
                ],
            },
            "book": {"type": "llm agent", "prompt": "Book.", "args": ["date"]},
        });
        let bot = Bot::assemble("b", &data, options()).unwrap();
        let binding = bot.mapping["book"]["date"].clone();
        assert_eq!(
            binding,
            ArgBinding::Ref {
                agent: "meta".to_owned(),
                arg: "date_from_main".to_owned()
            }
        );
    }

    #[test]
    fn default_fallback_and_exit_agents_are_registered() {
        let data = json!({
            "main": {"steps": [{"call": "meta"}]},
            "meta": {
                "type": "ensemble agent",
                "contains": ["book"],
                "fallback": "default",
                "exit": {"policy": "See you soon!"},
            },
            "book": {"type": "llm agent", "prompt": "Book."},
        });
        let bot = Bot::assemble("b", &data, options()).unwrap();
        assert!(bot.agents.contains_key("DefaultFallbackAgent_meta"));
        assert!(bot.agents.contains_key("ExitAgent_meta"));
    }

    #[test]
    fn manager_roundtrip() {
        let data = json!({
            "main": {"steps": [{"call": "meta"}]},
            "meta": {"type": "ensemble agent", "contains": []},
        });
        let manager = Manager::new();
        let bot = Bot::assemble("demo", &data, options()).unwrap();
        manager.insert(bot);
        assert!(manager.get_bot("demo").is_some());
        assert_eq!(manager.bots(), vec!["demo"]);
    }
}
