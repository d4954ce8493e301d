//! Catch-all audit trail.

use async_trait::async_trait;
use tracing::info;

use warebus_events::EventEnvelope;

use crate::contract::{Agent, AgentContext, AgentError, AgentResult, CATCH_ALL};

/// Logs one structured line per envelope that flows through the bus.
///
/// Pure observation: reads nothing, mutates nothing, returns no envelopes,
/// and is therefore trivially idempotent.
#[derive(Debug, Default)]
pub struct AuditTrailAgent;

impl AuditTrailAgent {
    pub const NAME: &'static str = "audit-trail";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for AuditTrailAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Writes a structured audit line for every event"
    }

    fn subscriptions(&self) -> &[&str] {
        &[CATCH_ALL]
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        _ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        info!(
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            tenant_id = %envelope.tenant_id(),
            correlation_id = %envelope.correlation_id(),
            causation_id = ?envelope.causation_id(),
            actor = %envelope.actor().id,
            "audit"
        );
        Ok(AgentResult::ok("audited"))
    }
}
