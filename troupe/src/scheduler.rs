//! The priority scheduler.
//!
//! Drives the top of the session's agent stack until the turn either awaits
//! user input or completes, routing every emitted event in emission order:
//! utterances into the tracker and response list, follow-ups onto the
//! stack, terminal signals back to their call sites.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::agents::{Agent, AgentOutput, RunContext};
use crate::event::{AgentMarker, Event};
use crate::tracker::{CallResult, Tracker};
use crate::vars::interpolate;

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Hard per-turn budget; on expiry the running agent is abandoned at
    /// its next suspension point, an `AgentFail` is recorded, and whatever
    /// responses accumulated are returned.
    pub turn_timeout: Option<Duration>,
}

/// The priority scheduling policy.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Drive one turn to completion and return the ordered text responses.
    pub async fn predict_next_action(
        &self,
        tracker: &mut Tracker,
        entrypoint: &Arc<dyn Agent>,
        ctx: &RunContext<'_>,
    ) -> Vec<String> {
        info!(user = %tracker.user_id, text = %tracker.latest_text(), "received user message");
        let deadline = self.config.turn_timeout.map(|t| Instant::now() + t);
        let mut responses = Vec::new();

        if tracker.is_agent_stack_empty() {
            match self
                .run_with_deadline(entrypoint.as_ref(), tracker, ctx, deadline)
                .await
            {
                Some(output) => {
                    self.process_events(tracker, ctx, entrypoint.name(), None, output.events, &mut responses);
                }
                None => return responses,
            }
        }

        let mut is_end = false;
        while !is_end {
            let Some(marker) = tracker.peek_agent().cloned() else {
                break;
            };
            debug!(stack = ?tracker.stack_names(), "agent stack before run");
            let Some(current) = ctx.agents.get(&marker.agent).map(Arc::clone) else {
                error!(agent = %marker.agent, "scheduled agent does not exist; dropping it");
                tracker.pop_agent();
                continue;
            };

            let output = match self
                .run_with_deadline(current.as_ref(), tracker, ctx, deadline)
                .await
            {
                Some(output) => output,
                None => {
                    tracker.update(Event::agent_fail(&marker.agent));
                    break;
                }
            };

            is_end = output.is_end;
            let resumed = self.process_events(
                tracker,
                ctx,
                &marker.agent,
                Some(&marker),
                output.events,
                &mut responses,
            );
            if resumed {
                is_end = false;
            }
            debug!(stack = ?tracker.stack_names(), "agent stack after run");
        }
        responses
    }

    /// Run one agent under the remaining turn budget. `None` means the
    /// budget expired (already logged).
    async fn run_with_deadline(
        &self,
        agent: &dyn Agent,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
        deadline: Option<Instant>,
    ) -> Option<AgentOutput> {
        let result = match deadline {
            Some(deadline) => match timeout_at(deadline, agent.run(tracker, ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(agent = agent.name(), "turn deadline expired");
                    return None;
                }
            },
            None => agent.run(tracker, ctx).await,
        };
        match result {
            Ok(output) => Some(output),
            Err(e) => {
                error!(agent = agent.name(), error = %e, "agent run failed");
                Some(AgentOutput::end(vec![Event::agent_fail(agent.name())]))
            }
        }
    }

    /// Route a batch of emitted events, strictly in emission order.
    ///
    /// Returns true when a terminal signal was delivered to a calling
    /// flow's call site, which forces the turn to keep going so the caller
    /// resumes.
    fn process_events(
        &self,
        tracker: &mut Tracker,
        ctx: &RunContext<'_>,
        current_agent: &str,
        current_marker: Option<&AgentMarker>,
        events: Vec<Event>,
        responses: &mut Vec<String>,
    ) -> bool {
        let mut resumed = false;
        for event in events {
            match event {
                Event::BotUtter { ref text, .. } => {
                    let rendered = interpolate(text, current_agent, tracker);
                    tracker.update(event.clone());
                    responses.push(rendered);
                }
                Event::FollowUpAgent { ref next_agent, .. } => {
                    if ctx.agents.contains_key(next_agent) {
                        tracker.push_agent(AgentMarker::new(next_agent));
                    } else {
                        error!(agent = %next_agent, "follow-up names an unknown agent");
                    }
                }
                Event::AgentComplete { .. } | Event::AgentFail { .. } => {
                    let failed = matches!(event, Event::AgentFail { .. });
                    tracker.update(event);
                    tracker.pop_agent();
                    if let Some(site) = current_marker.and_then(|m| m.call_site.as_ref()) {
                        let result = if failed {
                            CallResult::Failed
                        } else {
                            CallResult::Complete
                        };
                        tracker
                            .flow_info_mut(&site.flow)
                            .set_call_result(site.step, result);
                        resumed = true;
                    }
                }
                Event::CurrentAgent { marker, .. } => {
                    tracker.pop_agent();
                    tracker.push_agent(marker);
                }
                // slot writes already happened at the agent; tool calls are
                // an agent-internal concern
                _ => {}
            }
        }
        resumed
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::agents::{AgentKind, AgentOutput};
    use crate::providers::MockModel;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// An agent that sleeps forever, for deadline tests.
    #[derive(Debug)]
    struct StuckAgent;

    #[async_trait]
    impl Agent for StuckAgent {
        fn name(&self) -> &str {
            "stuck"
        }

        fn kind(&self) -> AgentKind {
            AgentKind::Llm
        }

        async fn run(
            &self,
            _tracker: &mut Tracker,
            _ctx: &RunContext<'_>,
        ) -> crate::error::Result<AgentOutput> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AgentOutput::end(Vec::new()))
        }
    }

    #[tokio::test]
    async fn deadline_aborts_and_records_failure() {
        let scheduler = Scheduler::new(SchedulerConfig {
            turn_timeout: Some(Duration::from_millis(50)),
        });
        let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        agents.insert("stuck".to_owned(), Arc::new(StuckAgent));
        let model = MockModel::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let entrypoint: Arc<dyn Agent> = Arc::new(StuckAgent);

        let mut tracker = Tracker::new("u", "b", HashMap::new(), HashMap::new(), HashMap::new());
        tracker.update(Event::user_input("hi"));
        tracker.push_agent(AgentMarker::new("stuck"));

        let responses = scheduler
            .predict_next_action(&mut tracker, &entrypoint, &ctx)
            .await;
        assert!(responses.is_empty());
        assert!(matches!(
            tracker.events.last(),
            Some(Event::AgentFail { provider, .. }) if provider.as_deref() == Some("stuck")
        ));
    }
}
