//! Append-only event log port (read side).
//!
//! The log records every envelope that committed with its business
//! transaction, keyed uniquely by `event_id`. Appends happen through a state
//! transaction (`StateTx::append_event`); this trait exposes the queries
//! replay, audit, and the consumer's idempotency guard need.

use async_trait::async_trait;
use thiserror::Error;

use warebus_core::{CorrelationId, EventId, TenantId};

use crate::envelope::EventEnvelope;

#[derive(Debug, Clone, Error)]
pub enum EventLogError {
    #[error("event log storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Fetch an envelope by its globally unique id.
    async fn get(&self, event_id: EventId) -> Result<Option<EventEnvelope>, EventLogError>;

    /// All envelopes along one correlation path, ordered by occurrence.
    async fn by_correlation(
        &self,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
    ) -> Result<Vec<EventEnvelope>, EventLogError>;

    /// Whether an envelope with this id has been recorded.
    async fn contains(&self, event_id: EventId) -> Result<bool, EventLogError> {
        Ok(self.get(event_id).await?.is_some())
    }
}
