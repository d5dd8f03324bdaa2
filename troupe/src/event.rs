//! Conversation events exchanged between agents and the scheduler.
//!
//! Events describe everything that occurs in a conversation and tell the
//! [`Tracker`](crate::tracker::Tracker) how to update its state. Every
//! variant carries a unix timestamp; most carry the name of the agent that
//! produced it (`provider`) and an optional opaque metadata payload.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier of a step, assigned once at bot-build time.
pub type StepId = u32;

/// Current unix time in fractional seconds.
#[must_use]
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The call site a pushed agent reports its result back to.
///
/// Recorded on the agent-stack marker when a flow's `call` step pushes
/// another agent; the scheduler delivers the terminal event of that agent to
/// `flow`'s [`FlowInfo`](crate::tracker::FlowInfo) under `step`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Name of the calling flow agent.
    pub flow: String,
    /// Id of the `call` step waiting for the result.
    pub step: StepId,
}

/// A marker on the per-session agent stack naming the active agent.
///
/// Markers compare by agent name and call site; pushing an equal marker
/// moves the existing one to the top instead of stacking it twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMarker {
    /// Name of the agent this marker schedules.
    pub agent: String,
    /// Present when the agent was pushed by a flow's `call` step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_site: Option<CallSite>,
}

impl AgentMarker {
    /// Create a marker with no call-site back-reference.
    #[must_use]
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            call_site: None,
        }
    }

    /// Create a marker that reports its result back to `flow`/`step`.
    #[must_use]
    pub fn called_from(agent: impl Into<String>, flow: impl Into<String>, step: StepId) -> Self {
        Self {
            agent: agent.into(),
            call_site: Some(CallSite {
                flow: flow.into(),
                step,
            }),
        }
    }
}

/// One conversation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Event {
    /// One inbound user message.
    UserInput {
        /// The raw user text.
        text: String,
        /// Event time.
        timestamp: f64,
        /// Opaque channel metadata.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// One outbound bot message attributed to an agent.
    BotUtter {
        /// The rendered reply text.
        text: String,
        /// Name of the emitting agent.
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        /// Raw provider payload this utterance was derived from.
        #[serde(skip_serializing_if = "Option::is_none")]
        additional: Option<Value>,
        /// Event time.
        timestamp: f64,
    },

    /// Assignment into the variable store.
    SetSlot {
        /// Target slot, possibly qualified as `agent.arg`.
        slot_name: String,
        /// The assigned value.
        value: Value,
        /// Name of the writing agent.
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        /// Event time.
        timestamp: f64,
    },

    /// Terminal success signal from an agent.
    AgentComplete {
        /// Name of the completing agent.
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        /// Completion payload (e.g. a return message).
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        /// Event time.
        timestamp: f64,
    },

    /// Terminal failure signal from an agent.
    AgentFail {
        /// Name of the failing agent.
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        /// Failure payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        /// Event time.
        timestamp: f64,
    },

    /// Request to push another agent onto the stack.
    FollowUpAgent {
        /// Name of the agent to schedule next.
        next_agent: String,
        /// Name of the requesting agent.
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        /// Event time.
        timestamp: f64,
    },

    /// Scheduler-internal marker naming the currently active agent.
    CurrentAgent {
        /// The stack marker payload.
        marker: AgentMarker,
        /// Event time.
        timestamp: f64,
    },

    /// An LLM-requested tool invocation.
    FunctionCall {
        /// Name of the tool function.
        function_name: String,
        /// Keyword arguments as a JSON object.
        args: Value,
        /// Provider-assigned call id, echoed back on the tool response.
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        /// Raw assistant message that carried the call.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        /// Event time.
        timestamp: f64,
    },
}

impl Event {
    /// Create a user-input event stamped with the current time.
    #[must_use]
    pub fn user_input(text: impl Into<String>) -> Self {
        Self::UserInput {
            text: text.into(),
            timestamp: now_ts(),
            metadata: None,
        }
    }

    /// Create a bot utterance attributed to `provider`.
    #[must_use]
    pub fn bot_utter(text: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::BotUtter {
            text: text.into(),
            provider: Some(provider.into()),
            additional: None,
            timestamp: now_ts(),
        }
    }

    /// Create a bot utterance carrying the raw provider payload.
    #[must_use]
    pub fn bot_utter_with(
        text: impl Into<String>,
        provider: Option<String>,
        additional: Option<Value>,
    ) -> Self {
        Self::BotUtter {
            text: text.into(),
            provider,
            additional,
            timestamp: now_ts(),
        }
    }

    /// Create a slot-write event.
    #[must_use]
    pub fn set_slot(slot_name: impl Into<String>, value: Value, provider: impl Into<String>) -> Self {
        Self::SetSlot {
            slot_name: slot_name.into(),
            value,
            provider: Some(provider.into()),
            timestamp: now_ts(),
        }
    }

    /// Create an agent-complete event.
    #[must_use]
    pub fn agent_complete(provider: impl Into<String>) -> Self {
        Self::AgentComplete {
            provider: Some(provider.into()),
            metadata: None,
            timestamp: now_ts(),
        }
    }

    /// Create an agent-complete event with a payload.
    #[must_use]
    pub fn agent_complete_with(provider: impl Into<String>, metadata: Value) -> Self {
        Self::AgentComplete {
            provider: Some(provider.into()),
            metadata: Some(metadata),
            timestamp: now_ts(),
        }
    }

    /// Create an agent-fail event.
    #[must_use]
    pub fn agent_fail(provider: impl Into<String>) -> Self {
        Self::AgentFail {
            provider: Some(provider.into()),
            metadata: None,
            timestamp: now_ts(),
        }
    }

    /// Create an agent-fail event with a payload.
    #[must_use]
    pub fn agent_fail_with(provider: impl Into<String>, metadata: Value) -> Self {
        Self::AgentFail {
            provider: Some(provider.into()),
            metadata: Some(metadata),
            timestamp: now_ts(),
        }
    }

    /// Create a follow-up request naming the next agent.
    #[must_use]
    pub fn follow_up(next_agent: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::FollowUpAgent {
            next_agent: next_agent.into(),
            provider: Some(provider.into()),
            timestamp: now_ts(),
        }
    }

    /// Create a current-agent marker event.
    #[must_use]
    pub fn current_agent(marker: AgentMarker) -> Self {
        Self::CurrentAgent {
            marker,
            timestamp: now_ts(),
        }
    }

    /// Create a function-call event.
    #[must_use]
    pub fn function_call(
        function_name: impl Into<String>,
        args: Value,
        call_id: Option<String>,
        metadata: Option<Value>,
    ) -> Self {
        Self::FunctionCall {
            function_name: function_name.into(),
            args,
            call_id,
            metadata,
            timestamp: now_ts(),
        }
    }

    /// Event time in unix seconds.
    #[must_use]
    pub const fn timestamp(&self) -> f64 {
        match self {
            Self::UserInput { timestamp, .. }
            | Self::BotUtter { timestamp, .. }
            | Self::SetSlot { timestamp, .. }
            | Self::AgentComplete { timestamp, .. }
            | Self::AgentFail { timestamp, .. }
            | Self::FollowUpAgent { timestamp, .. }
            | Self::CurrentAgent { timestamp, .. }
            | Self::FunctionCall { timestamp, .. } => *timestamp,
        }
    }

    /// Name of the agent that produced this event, when attributed.
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::BotUtter { provider, .. }
            | Self::SetSlot { provider, .. }
            | Self::AgentComplete { provider, .. }
            | Self::AgentFail { provider, .. }
            | Self::FollowUpAgent { provider, .. } => provider.as_deref(),
            _ => None,
        }
    }

    /// Whether this is a terminal agent signal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentComplete { .. } | Self::AgentFail { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_equality_ignores_nothing_but_payload() {
        let a = AgentMarker::new("book");
        let b = AgentMarker::new("book");
        let c = AgentMarker::called_from("book", "main", 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn event_provider_attribution() {
        let e = Event::bot_utter("hi", "greeter");
        assert_eq!(e.provider(), Some("greeter"));
        assert!(!e.is_terminal());
        assert!(Event::agent_fail("greeter").is_terminal());
    }

    #[test]
    fn events_serialize_tagged() {
        let e = Event::user_input("hello");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["event"], "user_input");
        assert_eq!(v["text"], "hello");
    }
}
