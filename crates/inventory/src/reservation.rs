//! Reservations held against stock levels for order lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warebus_core::{
    DomainError, DomainResult, LotId, ProductId, ReservationId, StockLevelId, TenantId, VariantId,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Fulfilled,
    Cancelled,
    Expired,
}

/// What a reservation is held for, e.g. a sales order line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationReference {
    pub ref_type: String,
    pub ref_id: String,
    pub line: u32,
}

impl ReservationReference {
    pub fn sales_order_line(order_id: impl core::fmt::Display, line: u32) -> Self {
        Self {
            ref_type: "SALES_ORDER".to_string(),
            ref_id: order_id.to_string(),
            line,
        }
    }
}

/// While `ACTIVE`, a reservation contributes its remaining quantity to the
/// covering stock level's reserved total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub stock_level_id: StockLevelId,
    pub lot_id: Option<LotId>,
    pub quantity: i64,
    pub quantity_fulfilled: i64,
    pub reference: ReservationReference,
    pub status: ReservationStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn active(
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        stock_level_id: StockLevelId,
        lot_id: Option<LotId>,
        quantity: i64,
        reference: ReservationReference,
    ) -> DomainResult<Self> {
        if quantity <= 0 {
            return Err(DomainError::validation("reservation quantity must be positive"));
        }
        Ok(Self {
            id: ReservationId::new(),
            tenant_id,
            product_id,
            variant_id,
            stock_level_id,
            lot_id,
            quantity,
            quantity_fulfilled: 0,
            reference,
            status: ReservationStatus::Active,
            expires_at: None,
            created_at: Utc::now(),
        })
    }

    /// Quantity still held against the stock level.
    pub fn remaining(&self) -> i64 {
        match self.status {
            ReservationStatus::Active => self.quantity - self.quantity_fulfilled,
            _ => 0,
        }
    }

    /// Record picked quantity. Moves to `FULFILLED` once fulfilled equals
    /// quantity; over-fulfillment is a validation error.
    pub fn fulfill(&mut self, quantity: i64) -> DomainResult<()> {
        if self.status != ReservationStatus::Active {
            return Err(DomainError::validation(format!(
                "reservation {} is {:?}, not ACTIVE",
                self.id, self.status
            )));
        }
        if quantity <= 0 {
            return Err(DomainError::validation("fulfillment quantity must be positive"));
        }
        let fulfilled = self.quantity_fulfilled + quantity;
        if fulfilled > self.quantity {
            return Err(DomainError::validation(format!(
                "fulfilled {fulfilled} would exceed reserved {}",
                self.quantity
            )));
        }
        self.quantity_fulfilled = fulfilled;
        if fulfilled == self.quantity {
            self.status = ReservationStatus::Fulfilled;
        }
        Ok(())
    }

    pub fn cancel(&mut self) -> DomainResult<()> {
        if self.status != ReservationStatus::Active {
            return Err(DomainError::validation(format!(
                "reservation {} is {:?}, not ACTIVE",
                self.id, self.status
            )));
        }
        self.status = ReservationStatus::Cancelled;
        Ok(())
    }
}
