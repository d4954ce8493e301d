//! Sales order skeleton persisted by the order command.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warebus_core::{OrderId, ProductId, TenantId, VariantId, WarehouseId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Placed,
    Allocated,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line: u32,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesOrder {
    pub id: OrderId,
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub lines: Vec<OrderLine>,
    pub status: OrderStatus,
    pub placed_at: DateTime<Utc>,
}

impl SalesOrder {
    pub fn placed(tenant_id: TenantId, warehouse_id: WarehouseId, lines: Vec<OrderLine>) -> Self {
        Self {
            id: OrderId::new(),
            tenant_id,
            warehouse_id,
            lines,
            status: OrderStatus::Placed,
            placed_at: Utc::now(),
        }
    }
}
