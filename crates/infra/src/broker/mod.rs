//! Topic-broker abstraction.
//!
//! The backbone needs a durable topic exchange with per-queue
//! dead-lettering. This module defines the port plus the standard topology
//! names; `InMemoryBroker` serves tests and single-process development and
//! `RedisStreamsBroker` is the durable binding.
//!
//! Delivery contract: `publish` resolves only once the broker has accepted
//! the message (confirm semantics — the dispatcher marks outbox rows
//! published strictly after this returns). Consumers receive [`Delivery`]
//! values and must terminate each with exactly one of `ack`,
//! `nack_requeue` (durable delayed redelivery), or `dead_letter`.

mod in_memory;
mod redis_streams;

pub use in_memory::InMemoryBroker;
pub use redis_streams::RedisStreamsBroker;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use warebus_events::{encode, CodecError, EventEnvelope, OutboxEntry};

/// Durable topic exchange carrying every domain event.
pub const EVENTS_EXCHANGE: &str = "events";
/// Fan-in queue the agent consumer reads, bound with pattern `#`.
pub const AGENT_QUEUE: &str = "agent-processor";
/// Dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE: &str = "events.dlx";
/// Dead-letter queue, bound to the DLX on `dead-letter`.
pub const DEAD_LETTER_QUEUE: &str = "events.dlq";
/// Routing key used when dead-lettering.
pub const DEAD_LETTER_KEY: &str = "dead-letter";
/// Match-all binding pattern.
pub const MATCH_ALL: &str = "#";

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("message encoding error: {0}")]
    Encoding(String),
}

impl From<CodecError> for BrokerError {
    fn from(value: CodecError) -> Self {
        BrokerError::Encoding(value.to_string())
    }
}

/// Message headers carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub tenant_id: Option<String>,
    pub event_type: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub retry_count: u32,
}

impl MessageHeaders {
    pub fn for_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            tenant_id: Some(envelope.tenant_id().to_string()),
            event_type: Some(envelope.event_type().to_string()),
            correlation_id: Some(envelope.correlation_id().to_string()),
            causation_id: envelope.causation_id().map(|id| id.to_string()),
            retry_count: 0,
        }
    }
}

/// An outbound message: persistent, JSON body, `message_id = event_id`.
#[derive(Debug, Clone)]
pub struct Publication {
    pub routing_key: String,
    pub message_id: String,
    pub headers: MessageHeaders,
    pub body: Vec<u8>,
}

impl Publication {
    /// Build the broker publication for an outbox row.
    pub fn for_outbox_entry(entry: &OutboxEntry) -> Result<Self, BrokerError> {
        Ok(Self {
            routing_key: entry.routing_key.clone(),
            message_id: entry.envelope.event_id().to_string(),
            headers: MessageHeaders::for_envelope(&entry.envelope),
            body: encode(&entry.envelope)?,
        })
    }
}

/// One message handed to a consumer, with its settlement handle.
pub struct Delivery {
    pub message_id: String,
    pub routing_key: String,
    pub headers: MessageHeaders,
    pub body: Vec<u8>,
    pub(crate) acker: Box<dyn Acker>,
}

impl Delivery {
    /// Number of prior delivery attempts (`x-retry-count`).
    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Requeue after a durable delay, with the retry counter incremented.
    pub async fn nack_requeue(self, delay: Duration) -> Result<(), BrokerError> {
        self.acker.nack_requeue(delay).await
    }

    /// Hand the message to the dead-letter queue.
    pub async fn dead_letter(self) -> Result<(), BrokerError> {
        self.acker.dead_letter().await
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("routing_key", &self.routing_key)
            .field("retry_count", &self.headers.retry_count)
            .finish()
    }
}

#[async_trait]
pub(crate) trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
    async fn nack_requeue(self: Box<Self>, delay: Duration) -> Result<(), BrokerError>;
    async fn dead_letter(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Stream of deliveries for one queue.
pub struct Consumer {
    pub(crate) receiver: mpsc::Receiver<Delivery>,
}

impl Consumer {
    /// Next delivery; `None` once the broker shuts the queue down.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare exchanges, queues, and bindings. Idempotent.
    async fn declare_topology(&self) -> Result<(), BrokerError>;

    /// Publish with confirm semantics: resolves after the broker accepts.
    async fn publish(&self, publication: Publication) -> Result<(), BrokerError>;

    /// Consume a declared queue.
    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError>;
}

/// AMQP-style topic match: `.`-separated words, `*` matches exactly one
/// word, `#` matches zero or more.
pub fn routing_key_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((head, key_rest))) if word == head => matches(rest, key_rest),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
