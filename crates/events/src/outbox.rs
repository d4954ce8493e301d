//! Transactional outbox entry and store port.
//!
//! An outbox row owns exactly one envelope awaiting broker publication. Rows
//! are inserted inside the business transaction that produced the envelope
//! (see `StateTx::enqueue_outbox` in `warebus-inventory`); this module owns
//! the status machine and the dispatcher-facing store operations.
//!
//! Delivery contract: at-least-once publish. A crash between broker ack and
//! `mark_published` republishes the same envelope, so consumers must be
//! idempotent on `event_id`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use warebus_core::{EventId, TenantId};

use crate::envelope::EventEnvelope;

/// Default cap on publish attempts before a row is parked as `FAILED`.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Outbox row status (string-valued on the wire and in storage).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl core::str::FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(OutboxError::Storage(format!("unknown outbox status '{other}'"))),
        }
    }
}

/// One envelope queued for publication.
///
/// Rows are unique on the envelope's `event_id`. Transitions:
/// `PENDING → PUBLISHED` (terminal), `PENDING → PENDING` (retry with
/// exponential backoff), `PENDING → FAILED` once the retry budget is spent.
/// `FAILED` rows are retained for operator inspection; `PUBLISHED` rows are
/// garbage-collected after a configurable age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub routing_key: String,
    pub envelope: EventEnvelope,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Build a fresh `PENDING` row for an envelope, due immediately.
    pub fn pending(envelope: EventEnvelope, routing_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: envelope.event_id(),
            tenant_id: envelope.tenant_id(),
            routing_key: routing_key.into(),
            envelope,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            scheduled_at: now,
            created_at: now,
            published_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.scheduled_at <= now
    }

    /// Terminal success: broker acked the publish.
    pub fn mark_published(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
    }

    /// Record a failed publish attempt.
    ///
    /// Stays `PENDING` with `scheduled_at = now + 2^retry_count` seconds
    /// while attempts remain; becomes terminal `FAILED` once the retry count
    /// reaches the maximum.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());

        if self.retry_count < self.max_retries {
            let backoff = Duration::seconds(1i64 << self.retry_count.min(30));
            self.scheduled_at = now + backoff;
        } else {
            self.status = OutboxStatus::Failed;
        }
    }

    /// Operator action: reset the retry budget and make the row due now.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
        self.scheduled_at = now;
        self.published_at = None;
    }
}

#[derive(Debug, Clone, Error)]
pub enum OutboxError {
    #[error("outbox entry not found: {0}")]
    NotFound(EventId),

    #[error("outbox storage error: {0}")]
    Storage(String),
}

/// Dispatcher-facing outbox operations.
///
/// `enqueue` is deliberately absent here: rows are inserted through a state
/// transaction so they commit (or abort) together with the business rows
/// that produced the envelope.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due `PENDING` rows, oldest first.
    ///
    /// Implementations backing multiple dispatcher replicas must claim with
    /// row-level locking (`FOR UPDATE SKIP LOCKED` or equivalent) so a row
    /// is owned by one dispatcher attempt at a time.
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError>;

    /// Fetch one row by id (operator inspection and tenant checks).
    async fn find(&self, id: EventId) -> Result<Option<OutboxEntry>, OutboxError>;

    async fn mark_published(&self, id: EventId) -> Result<(), OutboxError>;

    async fn mark_failed(&self, id: EventId, error: &str) -> Result<(), OutboxError>;

    /// Operator requeue of a `FAILED` (or stuck) row.
    async fn requeue(&self, id: EventId) -> Result<(), OutboxError>;

    /// Delete `PUBLISHED` rows older than the cutoff. Returns rows removed.
    async fn gc(&self, published_before: DateTime<Utc>) -> Result<u64, OutboxError>;

    /// Number of rows still `PENDING` (the `outbox_queue_size` gauge).
    async fn queue_size(&self) -> Result<u64, OutboxError>;
}
