//! `warebus-events` — envelope, codec, and event-backbone ports.
//!
//! This crate defines mechanics, not business logic: the canonical envelope
//! and its wire codec, the event-type grammar and routing keys, the outbox
//! entry/status machine, and the read port of the append-only event log.
//! Storage implementations live in `warebus-infra`.

pub mod codec;
pub mod envelope;
pub mod event_type;
pub mod log;
pub mod outbox;

pub use codec::{decode, encode, CodecError};
pub use envelope::{Actor, ActorType, EnvelopeContext, EventEnvelope, SchemaVersion};
pub use event_type::{catalog, EventType};
pub use log::{EventLog, EventLogError};
pub use outbox::{OutboxEntry, OutboxError, OutboxStatus, OutboxStore, DEFAULT_MAX_RETRIES};
