//! Agent execution harness.
//!
//! For one inbound envelope: resolve subscribers, run them in batches of the
//! configured concurrency with a per-agent deadline, and aggregate results.
//! Derived envelopes are defensively rewritten (tenant, correlation,
//! causation) before they leave the runtime. The runtime never touches the
//! broker; the consumer publishes what comes back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use warebus_events::EventEnvelope;

use crate::contract::{Agent, AgentContext, AgentError, AgentResult};
use crate::registry::AgentRegistry;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Batch size for parallel agent execution.
    pub concurrency: usize,
    /// Per-agent deadline; an elapsed deadline is an infrastructure failure.
    pub agent_timeout: Duration,
    /// When false, a failure short-circuits the remaining batches.
    pub continue_on_error: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            agent_timeout: Duration::from_secs(30),
            continue_on_error: true,
        }
    }
}

/// Per-agent aggregation entry, in completion order.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub agent: String,
    pub success: bool,
    pub message: String,
    pub errors: Vec<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub agent: String,
    pub error: AgentError,
}

/// Aggregated result of running all subscribers for one envelope.
#[derive(Debug, Default, Clone)]
pub struct DispatchOutcome {
    pub duration: Duration,
    pub succeeded: usize,
    pub failed: usize,
    /// Derived envelopes in agent-completion order, chain-rewritten.
    pub envelopes: Vec<EventEnvelope>,
    pub outcomes: Vec<AgentOutcome>,
    /// Failures the consumer must treat as retriable (store/broker
    /// transients, timeouts) rather than capture-and-ack.
    pub infrastructure_failures: Vec<AgentFailure>,
}

impl DispatchOutcome {
    pub fn has_infrastructure_failures(&self) -> bool {
        !self.infrastructure_failures.is_empty()
    }
}

pub struct AgentRuntime {
    registry: Arc<AgentRegistry>,
    config: RuntimeConfig,
}

impl AgentRuntime {
    pub fn new(registry: Arc<AgentRegistry>, config: RuntimeConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Run every subscriber of `envelope.event_type` and aggregate.
    ///
    /// Agents within a batch run in parallel; agents in later batches start
    /// only after the current batch drains. `continue_on_error = false`
    /// stops scheduling further batches after the first observed failure.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> DispatchOutcome {
        let started = Instant::now();
        let agents = self.registry.agents_for(envelope.event_type().as_str());
        let ctx = AgentContext::for_envelope(envelope);

        let mut outcome = DispatchOutcome::default();

        debug!(
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            agents = agents.len(),
            "dispatching envelope to agents"
        );

        'batches: for batch in agents.chunks(self.config.concurrency.max(1)) {
            let mut running: FuturesUnordered<_> = batch
                .iter()
                .map(|agent| self.run_one(Arc::clone(agent), envelope, &ctx))
                .collect();

            let mut batch_had_failure = false;
            while let Some((name, duration, result)) = running.next().await {
                match result {
                    Ok(agent_result) => {
                        if agent_result.success {
                            outcome.succeeded += 1;
                        } else {
                            outcome.failed += 1;
                            batch_had_failure = true;
                            warn!(
                                agent = %name,
                                event_id = %envelope.event_id(),
                                errors = ?agent_result.errors,
                                "agent reported failure"
                            );
                        }
                        outcome.envelopes.extend(
                            agent_result
                                .envelopes
                                .into_iter()
                                .map(|derived| derived.chained_to(envelope)),
                        );
                        outcome.outcomes.push(AgentOutcome {
                            agent: name,
                            success: agent_result.success,
                            message: agent_result.message,
                            errors: agent_result.errors,
                            duration,
                        });
                    }
                    Err(error) => {
                        outcome.failed += 1;
                        batch_had_failure = true;
                        warn!(
                            agent = %name,
                            event_id = %envelope.event_id(),
                            error = %error,
                            "agent failed with infrastructure error"
                        );
                        outcome.outcomes.push(AgentOutcome {
                            agent: name.clone(),
                            success: false,
                            message: error.to_string(),
                            errors: vec![error.to_string()],
                            duration,
                        });
                        outcome.infrastructure_failures.push(AgentFailure { agent: name, error });
                    }
                }
            }

            if batch_had_failure && !self.config.continue_on_error {
                break 'batches;
            }
        }

        outcome.duration = started.elapsed();
        outcome
    }

    async fn run_one(
        &self,
        agent: Arc<dyn Agent>,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> (String, Duration, Result<AgentResult, AgentError>) {
        let name = agent.name().to_string();
        let started = Instant::now();

        let result = match tokio::time::timeout(self.config.agent_timeout, agent.handle(envelope, ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                agent: name.clone(),
                timeout_ms: self.config.agent_timeout.as_millis() as u64,
            }),
        };

        (name, started.elapsed(), result)
    }
}
