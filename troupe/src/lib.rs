//! Troupe is a multi-agent conversational runtime: a declarative bot
//! description (named agents, their types and inter-relations) plus an
//! inbound user message is driven to turn completion, returning the bot's
//! ordered text responses.
//!
//! The core is the per-session agent stack, the flow interpreter, the
//! priority scheduler and the variable store with cross-agent bindings.
//! Language models, tool sandboxes and knowledge-base retrieval plug in
//! behind the [`model::Model`], [`tools::ToolExecutor`] and
//! [`agents::Retriever`] traits.

// Core data structures
pub mod error;
pub mod event;
pub mod message;
pub mod tracker;

// Variable store and expressions
pub mod expr;
pub mod vars;

// Agents and the step interpreter
pub mod agents;
pub mod steps;

// Scheduling and sessions
pub mod bot;
pub mod scheduler;
pub mod store;

// Collaborator contracts
pub mod config;
pub mod model;
pub mod prompts;
pub mod providers;
pub mod tools;

// Re-export commonly used types
pub use agents::{Agent, AgentKind, AgentOutput, RunContext};
pub use bot::{Bot, BotOptions, Manager};
pub use config::LlmConfig;
pub use error::{BuildError, Error, ModelError, Result};
pub use event::{AgentMarker, CallSite, Event, StepId};
pub use message::{ChatMessage, MessageRole};
pub use model::{FunctionSpec, Model, ModelStream};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::TrackerStore;
pub use tools::{InProcessExecutor, ToolDescriptor, ToolExecutor, ToolOutcome, ToolStatus};
pub use tracker::{ArgBinding, ExecPath, FlowInfo, Tracker};
