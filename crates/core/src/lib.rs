//! `warebus-core` — identifiers and domain errors shared by every crate.
//!
//! This crate defines no behavior beyond parsing/formatting; business logic
//! lives in the domain crates and infrastructure in `warebus-infra`.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, ErrorCode};
pub use id::{
    CorrelationId, EventId, LocationId, LotId, OrderId, ProductId, ReservationId, StockLevelId,
    TenantId, VariantId, WarehouseId,
};
