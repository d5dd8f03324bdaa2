//! Agent variants and the single-turn `run` contract.
//!
//! Every agent — flow, LLM, ensemble, knowledge-base, fallback, exit and the
//! entrypoint — exposes the same contract: given the session tracker and the
//! immutable bot graph, produce `(is_end, events)` for one scheduling slot.

mod default;
mod ensemble;
mod flow;
mod kb;
mod llm;

pub use default::{Entrypoint, ExitAgent, FallbackAgent};
pub use ensemble::EnsembleAgent;
pub use flow::FlowAgent;
pub use kb::{FaqRetriever, KbAgent, Retriever, ScoredDoc};
pub use llm::LlmAgent;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;
use crate::model::Model;
use crate::tools::ToolExecutor;
use crate::tracker::Tracker;

/// Which variant an agent is; used for routing decisions that depend on the
/// kind (e.g. the ensemble's knowledge-base pre-run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AgentKind {
    /// Step-program agent.
    Flow,
    /// Prompt-driven agent.
    Llm,
    /// Candidate router.
    Ensemble,
    /// Retrieval agent.
    Kb,
    /// Out-of-scope responder.
    Fallback,
    /// End-of-conversation responder.
    Exit,
    /// The bot entrypoint.
    Entrypoint,
}

/// What one `run` produced.
#[derive(Debug)]
pub struct AgentOutput {
    /// Whether the agent considers the turn finished from its side.
    pub is_end: bool,
    /// Events in emission order.
    pub events: Vec<Event>,
}

impl AgentOutput {
    /// An output ending the turn with the given events.
    #[must_use]
    pub fn end(events: Vec<Event>) -> Self {
        Self {
            is_end: true,
            events,
        }
    }

    /// An output keeping the turn going with the given events.
    #[must_use]
    pub fn run_on(events: Vec<Event>) -> Self {
        Self {
            is_end: false,
            events,
        }
    }
}

/// The immutable bot graph handed to every `run`.
///
/// Safe to share across sessions; nothing here is mutated after assembly.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    /// All named agents of the bot.
    pub agents: &'a HashMap<String, Arc<dyn Agent>>,
    /// The tool-function executor, when a tool script was loaded.
    pub tools: Option<&'a dyn ToolExecutor>,
    /// The shared model adapter.
    pub model: &'a dyn Model,
}

impl std::fmt::Debug for RunContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("has_tools", &self.tools.is_some())
            .field("model", &self.model.model_id())
            .finish()
    }
}

/// A named behavior unit driven by the scheduler.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The agent's unique name.
    fn name(&self) -> &str;

    /// One-line description used by selection prompts.
    fn description(&self) -> &str {
        ""
    }

    /// Which variant this is.
    fn kind(&self) -> AgentKind;

    /// Argument slots this agent declares.
    fn declared_args(&self) -> &[String] {
        &[]
    }

    /// Drive the agent for one scheduling slot.
    ///
    /// # Errors
    ///
    /// Implementations degrade recoverable trouble (transport, parse) into
    /// events; an `Err` is reserved for genuinely broken invariants and is
    /// converted to an agent failure by the scheduler.
    async fn run(&self, tracker: &mut Tracker, ctx: &RunContext<'_>) -> Result<AgentOutput>;
}
