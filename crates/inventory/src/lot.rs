//! Lot batches and pickability rules.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use warebus_core::{LotId, ProductId, TenantId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Available,
    Released,
    Quarantine,
    Hold,
    Expired,
}

impl LotStatus {
    /// Statuses from which stock may be picked at all.
    pub fn is_pickable_status(&self) -> bool {
        matches!(self, LotStatus::Available | LotStatus::Released)
    }
}

/// A lot batch per (tenant, product, lot number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotBatch {
    pub id: LotId,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub lot_number: String,
    pub expiration_date: Option<NaiveDate>,
    pub manufacture_date: Option<NaiveDate>,
    pub received_at: DateTime<Utc>,
    pub status: LotStatus,
}

impl LotBatch {
    pub fn new(tenant_id: TenantId, product_id: ProductId, lot_number: impl Into<String>) -> Self {
        Self {
            id: LotId::new(),
            tenant_id,
            product_id,
            lot_number: lot_number.into(),
            expiration_date: None,
            manufacture_date: None,
            received_at: Utc::now(),
            status: LotStatus::Available,
        }
    }

    pub fn with_expiration(mut self, date: NaiveDate) -> Self {
        self.expiration_date = Some(date);
        self
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// A lot is pickable iff its status allows picking and it is not within
    /// `min_days_to_expiration` of expiring (lots without an expiration date
    /// always pass the date check).
    pub fn is_pickable(&self, today: NaiveDate, min_days_to_expiration: i64) -> bool {
        if !self.status.is_pickable_status() {
            return false;
        }
        match self.expiration_date {
            None => true,
            Some(exp) => exp >= today + Duration::days(min_days_to_expiration),
        }
    }

    /// Days since expiration; `None` while the lot is not expired.
    pub fn days_expired(&self, today: NaiveDate) -> Option<i64> {
        let exp = self.expiration_date?;
        let days = (today - exp).num_days();
        (days > 0).then_some(days)
    }
}
