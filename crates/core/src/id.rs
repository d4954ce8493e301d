//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! impl_uuid_newtype {
    ($t:ident, $name:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Mint a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(TenantId, "TenantId", "Identifier of a tenant (multi-tenant boundary).");
impl_uuid_newtype!(WarehouseId, "WarehouseId", "Identifier of a warehouse within a tenant.");
impl_uuid_newtype!(ProductId, "ProductId", "Identifier of a product.");
impl_uuid_newtype!(VariantId, "VariantId", "Identifier of a product variant.");
impl_uuid_newtype!(LocationId, "LocationId", "Identifier of a storage location.");
impl_uuid_newtype!(LotId, "LotId", "Identifier of a lot batch.");
impl_uuid_newtype!(StockLevelId, "StockLevelId", "Identifier of a stock-level row.");
impl_uuid_newtype!(ReservationId, "ReservationId", "Identifier of a reservation.");
impl_uuid_newtype!(OrderId, "OrderId", "Identifier of a sales order.");
impl_uuid_newtype!(EventId, "EventId", "Identifier of an event envelope (globally unique).");
impl_uuid_newtype!(
    CorrelationId,
    "CorrelationId",
    "Correlation identifier shared along a derivation path."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_str() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn malformed_id_is_rejected() {
        let err = "not-a-uuid".parse::<TenantId>().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ValidationFailed);
    }

    #[test]
    fn minted_ids_are_time_ordered() {
        let a = EventId::new();
        let b = EventId::new();
        assert!(a <= b);
    }
}
