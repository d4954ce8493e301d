//! Envelope for a domain event, carrying identity, causation, and actor
//! metadata.
//!
//! An `EventEnvelope` is the unit of persistence and transport: what the
//! event store records, the outbox queues, and the broker carries. Envelopes
//! are value-typed and immutable; a derivation never edits an existing
//! envelope, it mints a new one whose `causation_id` names the source.
//!
//! Multi-tenancy is enforced at the envelope level: `tenant_id` never changes
//! along a derivation path, and `correlation_id` is preserved end to end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use warebus_core::{CorrelationId, DomainError, EventId, TenantId, WarehouseId};

use crate::event_type::EventType;

/// Who caused an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    User,
    System,
    Agent,
    Integration,
}

/// Actor identity attached to every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

impl Actor {
    pub fn user(id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            actor_type: ActorType::User,
            id: id.into(),
            roles: Some(roles),
        }
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::System,
            id: id.into(),
            roles: None,
        }
    }

    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Agent,
            id: name.into(),
            roles: None,
        }
    }

    pub fn integration(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Integration,
            id: id.into(),
            roles: None,
        }
    }
}

/// Payload schema version, serialized as `"major.minor"`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaVersion {
    pub major: u16,
    pub minor: u16,
}

impl SchemaVersion {
    pub const V1: SchemaVersion = SchemaVersion { major: 1, minor: 0 };
}

impl core::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (major, minor) = value.split_once('.').ok_or_else(|| {
            DomainError::validation(format!("schema version '{value}' is not major.minor"))
        })?;
        let parse = |part: &str| {
            part.parse::<u16>()
                .map_err(|e| DomainError::validation(format!("schema version '{value}': {e}")))
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

impl From<SchemaVersion> for String {
    fn from(value: SchemaVersion) -> Self {
        value.to_string()
    }
}

/// Context a command or scheduler tick supplies when minting envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeContext {
    pub tenant_id: TenantId,
    pub warehouse_id: Option<WarehouseId>,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub actor: Actor,
}

impl EnvelopeContext {
    /// Root context for a fresh user interaction.
    pub fn root(tenant_id: TenantId, warehouse_id: Option<WarehouseId>, actor: Actor) -> Self {
        Self {
            tenant_id,
            warehouse_id,
            correlation_id: CorrelationId::new(),
            causation_id: None,
            actor,
        }
    }
}

/// A domain event packaged for the bus.
///
/// Fields are private; downstream code reads through accessors and derives
/// new envelopes instead of mutating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: EventType,
    occurred_at: DateTime<Utc>,
    schema_version: SchemaVersion,
    correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    causation_id: Option<EventId>,
    actor: Actor,
    tenant_id: TenantId,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse_id: Option<WarehouseId>,
    payload: JsonValue,
}

impl EventEnvelope {
    /// Mint a new envelope with a fresh event id and the current timestamp.
    pub fn record(event_type: EventType, payload: JsonValue, ctx: &EnvelopeContext) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            occurred_at: Utc::now(),
            schema_version: SchemaVersion::V1,
            correlation_id: ctx.correlation_id,
            causation_id: ctx.causation_id,
            actor: ctx.actor.clone(),
            tenant_id: ctx.tenant_id,
            warehouse_id: ctx.warehouse_id,
            payload,
        }
    }

    /// Mint a derivation of this envelope.
    ///
    /// The derived envelope gets a fresh event id, `causation_id` set to this
    /// envelope's event id, and inherits correlation, tenant, and warehouse.
    pub fn derive(&self, event_type: EventType, payload: JsonValue, actor: Actor) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            occurred_at: Utc::now(),
            schema_version: SchemaVersion::V1,
            correlation_id: self.correlation_id,
            causation_id: Some(self.event_id),
            actor,
            tenant_id: self.tenant_id,
            warehouse_id: self.warehouse_id,
            payload,
        }
    }

    /// Force tenancy, correlation, and causation to match an inbound
    /// envelope.
    ///
    /// The agent runtime applies this to every envelope an agent returns, so
    /// a buggy handler cannot leak events across tenants or break the
    /// causation chain.
    pub fn chained_to(mut self, inbound: &EventEnvelope) -> Self {
        self.tenant_id = inbound.tenant_id;
        self.correlation_id = inbound.correlation_id;
        self.causation_id = Some(inbound.event_id);
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<EventId> {
        self.causation_id
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Routing key for broker publication, derived from the event type.
    pub fn routing_key(&self) -> String {
        self.event_type.routing_key()
    }
}
