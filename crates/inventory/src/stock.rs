//! Stock levels and the row-versioned quantity arithmetic behind the
//! optimistic mutator.
//!
//! A stock level exists per (tenant, warehouse, product, optional variant,
//! location, optional lot). Every mutation increments `row_version`; the
//! store's `adjust` compares that version first and loses with a retriable
//! `OPTIMISTIC_LOCK_CONFLICT` when stale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warebus_core::{
    DomainError, DomainResult, LocationId, LotId, ProductId, StockLevelId, TenantId, VariantId,
    WarehouseId,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Receipt,
    Ship,
    Adjust,
    Transfer,
}

/// Signed changes to the quantity columns.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDeltas {
    pub on_hand: i64,
    pub reserved: i64,
    pub quarantined: i64,
    pub inbound: i64,
    pub outbound: i64,
}

impl StockDeltas {
    pub fn on_hand(delta: i64) -> Self {
        Self {
            on_hand: delta,
            ..Self::default()
        }
    }

    pub fn reserved(delta: i64) -> Self {
        Self {
            reserved: delta,
            ..Self::default()
        }
    }

    /// Move `quantity` out of on-hand into the quarantine bucket (used when
    /// a lot expires or is placed on hold).
    pub fn quarantine(quantity: i64) -> Self {
        Self {
            on_hand: -quantity,
            quarantined: quantity,
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub id: StockLevelId,
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    pub lot_id: Option<LotId>,
    pub on_hand: i64,
    pub reserved: i64,
    /// Stock parked out of circulation (expired or held lots). Never part
    /// of `available`.
    pub quarantined: i64,
    pub available: i64,
    pub inbound: i64,
    pub outbound: i64,
    /// Monotone counter backing optimistic concurrency.
    pub row_version: u64,
    pub last_movement_at: DateTime<Utc>,
}

impl StockLevel {
    /// Fresh row at version 1, as created by the mutator's `upsert` on first
    /// receipt into a (product, location, lot).
    pub fn new(
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        location_id: LocationId,
        lot_id: Option<LotId>,
    ) -> Self {
        Self {
            id: StockLevelId::new(),
            tenant_id,
            warehouse_id,
            product_id,
            variant_id,
            location_id,
            lot_id,
            on_hand: 0,
            reserved: 0,
            quarantined: 0,
            available: 0,
            inbound: 0,
            outbound: 0,
            row_version: 1,
            last_movement_at: Utc::now(),
        }
    }

    /// Apply deltas, recompute `available`, and bump the row version.
    ///
    /// Without `allow_negative`, a resulting negative on-hand fails with
    /// `NEGATIVE_STOCK_BLOCKED` and `available` clamps at zero; with the
    /// override both carry the signed values.
    pub fn apply(&mut self, deltas: StockDeltas, allow_negative: bool) -> DomainResult<()> {
        let on_hand = self.on_hand + deltas.on_hand;
        let reserved = self.reserved + deltas.reserved;
        let quarantined = self.quarantined + deltas.quarantined;

        if on_hand < 0 && !allow_negative {
            return Err(DomainError::negative_stock(format!(
                "on-hand would become {on_hand} for stock level {}",
                self.id
            )));
        }
        if reserved < 0 {
            return Err(DomainError::validation(format!(
                "reserved would become {reserved} for stock level {}",
                self.id
            )));
        }
        if quarantined < 0 {
            return Err(DomainError::validation(format!(
                "quarantined would become {quarantined} for stock level {}",
                self.id
            )));
        }

        self.on_hand = on_hand;
        self.reserved = reserved;
        self.quarantined = quarantined;
        self.inbound += deltas.inbound;
        self.outbound += deltas.outbound;
        self.available = if allow_negative {
            on_hand - reserved
        } else {
            (on_hand - reserved).max(0)
        };
        self.row_version += 1;
        self.last_movement_at = Utc::now();
        Ok(())
    }
}
