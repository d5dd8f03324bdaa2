//! Error types for the troupe runtime.
//!
//! Configuration problems surface as [`BuildError`] before the first message
//! is handled; everything that can go wrong inside a turn degrades to a
//! logged no-op so a turn always terminates with a response list.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The bot package failed to assemble.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The model adapter failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised while assembling a bot from its declaration.
///
/// These fail fast, before the bot accepts its first message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The package structure is not usable at all.
    #[error("invalid bot package: {0}")]
    InvalidPackage(String),

    /// An agent declared an unsupported `type`.
    #[error("agent '{agent}' has unknown type '{kind}'")]
    UnknownAgentType {
        /// Name of the offending agent.
        agent: String,
        /// The declared type string.
        kind: String,
    },

    /// An agent referenced another agent that does not exist.
    #[error("agent '{agent}' references missing agent '{target}'")]
    MissingReference {
        /// Name of the referencing agent.
        agent: String,
        /// Name of the missing target.
        target: String,
    },

    /// A step inside a flow or init block could not be understood.
    #[error("invalid step in '{agent}': {message}")]
    InvalidStep {
        /// Agent owning the step list.
        agent: String,
        /// What went wrong.
        message: String,
    },

    /// A conditional guard failed to parse.
    #[error("invalid expression '{expression}': {message}")]
    InvalidExpression {
        /// The raw guard text.
        expression: String,
        /// Parser diagnostics.
        message: String,
    },

    /// The requested scheduling policy is not implemented.
    #[error("unsupported schedule '{0}'")]
    UnsupportedSchedule(String),

    /// A model provider could not be constructed.
    #[error("model configuration error: {0}")]
    ModelConfiguration(String),
}

/// Errors from the model adapter.
///
/// Transport failures are usually absorbed at the call site (they become an
/// empty event list); this type exists so adapters can still report them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// HTTP/network failure talking to the provider.
    #[error("model transport error: {0}")]
    Transport(String),

    /// The provider answered with something unparseable.
    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
