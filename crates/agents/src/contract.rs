//! The contract every reaction agent implements.
//!
//! Agents subscribe to event types, receive one inbound envelope at a time,
//! and return a result carrying zero or more derived envelopes. They never
//! touch the broker: the consumer persists and publishes what they return
//! through the outbox. Agents must tolerate redelivery — run twice on the
//! same inbound envelope, they guard on the event id or a natural unique key
//! and re-emit the same outcome.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use warebus_core::{CorrelationId, DomainError, TenantId, WarehouseId};
use warebus_events::EventEnvelope;
use warebus_inventory::StoreError;

/// Subscription wildcard matching every event type.
pub const CATCH_ALL: &str = "*";

/// Per-invocation execution context.
///
/// Correlation flows through tracing spans; the fields here are what agents
/// need to scope their reads and derive envelopes.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub tenant_id: TenantId,
    pub warehouse_id: Option<WarehouseId>,
    pub correlation_id: CorrelationId,
}

impl AgentContext {
    pub fn for_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            tenant_id: envelope.tenant_id(),
            warehouse_id: envelope.warehouse_id(),
            correlation_id: envelope.correlation_id(),
        }
    }
}

/// Outcome of one agent invocation.
///
/// Domain failures are captured here (`success = false`, `errors`) — the
/// inbound envelope is still acked. Infrastructure failures are returned as
/// [`AgentError`] instead and drive the consumer's retry path.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub message: String,
    pub data: Option<JsonValue>,
    pub envelopes: Vec<EventEnvelope>,
    pub errors: Vec<String>,
}

impl AgentResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            envelopes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            envelopes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_envelope(mut self, envelope: EventEnvelope) -> Self {
        self.envelopes.push(envelope);
        self
    }

    pub fn with_envelopes(mut self, envelopes: impl IntoIterator<Item = EventEnvelope>) -> Self {
        self.envelopes.extend(envelopes);
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }
}

/// Infrastructure-level agent failure; handled by the consumer state machine
/// (retry up to the cap, then dead-letter).
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("agent '{agent}' timed out after {timeout_ms} ms")]
    Timeout { agent: String, timeout_ms: u64 },
}

/// Split a store error into a capturable domain failure or an
/// infrastructure error that must abort the invocation.
pub fn domain_or_infra(error: StoreError) -> Result<DomainError, AgentError> {
    match error {
        StoreError::Domain(e) => Ok(e),
        StoreError::Storage(msg) => Err(AgentError::Infrastructure(msg)),
    }
}

/// A reaction handler.
///
/// Implementations are registered once at composition root and are read-only
/// configuration afterwards: `name` is unique, `subscriptions` lists event
/// types (or [`CATCH_ALL`]) and never changes at runtime.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn subscriptions(&self) -> &[&str];

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_are_capturable() {
        let err = StoreError::Domain(DomainError::insufficient_stock("3 short"));
        let domain = domain_or_infra(err).unwrap();
        assert_eq!(domain.code(), warebus_core::ErrorCode::InsufficientStock);
    }

    #[test]
    fn storage_errors_abort_the_invocation() {
        let err = StoreError::Storage("connection reset".into());
        assert!(domain_or_infra(err).is_err());
    }

    #[test]
    fn result_builders_accumulate() {
        let result = AgentResult::failed("partial")
            .with_error("INSUFFICIENT_STOCK: line 2")
            .with_data(serde_json::json!({"shortfall": 4}));
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.data.is_some());
    }
}
