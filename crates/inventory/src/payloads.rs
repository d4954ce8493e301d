//! Typed payloads for the canonical event catalog.
//!
//! Commands, agents, and tests share these shapes so both sides of every
//! event agree on the wire fields. All serialize snake_case to match the
//! envelope codec.

use serde::{Deserialize, Serialize};

use warebus_core::{LocationId, LotId, OrderId, ProductId, ReservationId, VariantId};

use crate::fefo::{AllocationLine, SkippedSource};
use crate::product::{AbcClass, XyzClass};
use crate::slotting::ScoredLocation;
use crate::stock::MovementType;
use crate::thresholds::AlertLevel;

/// `Inventory.GoodsReceived`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodsReceived {
    pub product_id: ProductId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot_id: Option<LotId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot_number: Option<String>,
    pub quantity: i64,
}

/// `Inventory.MovementRecorded`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRecorded {
    pub movement_type: MovementType,
    pub product_id: ProductId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot_id: Option<LotId>,
    pub quantity: i64,
    /// Availability across the product's stock levels after the movement.
    pub available_after: i64,
}

/// `SalesOrder.OrderPlaced`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub lines: Vec<OrderPlacedLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlacedLine {
    pub line: u32,
    pub product_id: ProductId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<VariantId>,
    pub quantity: i64,
}

/// `Inventory.StockReserved`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReserved {
    pub order_id: OrderId,
    pub line: u32,
    pub product_id: ProductId,
    pub reservation_ids: Vec<ReservationId>,
    pub allocations: Vec<AllocationLine>,
    pub skipped: Vec<SkippedSource>,
    pub requested_quantity: i64,
    pub reserved_quantity: i64,
    pub fully_reserved: bool,
}

/// `Inventory.ReservationShortfall`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationShortfall {
    pub order_id: OrderId,
    pub line: u32,
    pub product_id: ProductId,
    pub requested_quantity: i64,
    pub reserved_quantity: i64,
    pub shortfall_quantity: i64,
}

/// `SalesOrder.OrderFullyAllocated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFullyAllocated {
    pub order_id: OrderId,
    pub reservation_ids: Vec<ReservationId>,
}

/// `Inventory.SlottingSuggestionsGenerated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlottingSuggestionsGenerated {
    pub product_id: ProductId,
    pub quantity: i64,
    pub suggestions: Vec<ScoredLocation>,
}

/// `Inventory.LowStockDetected`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowStockDetected {
    pub product_id: ProductId,
    pub alert_level: AlertLevel,
    pub available: i64,
    pub reorder_point: i64,
    pub safety_stock: i64,
}

/// `Inventory.LotExpired`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotExpired {
    pub lot_id: LotId,
    pub lot_number: String,
    pub product_id: ProductId,
    pub days_expired: i64,
    pub action_taken: String,
    /// On-hand quantity moved into quarantine accounting by the sweep.
    pub quantity_quarantined: i64,
}

impl LotExpired {
    pub const AUTO_QUARANTINE: &'static str = "AUTO_QUARANTINE";
}

/// `Product.AbcXyzClassified`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbcXyzClassified {
    pub classifications: Vec<ProductClassification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductClassification {
    pub product_id: ProductId,
    pub abc_class: AbcClass,
    pub xyz_class: XyzClass,
    pub revenue: f64,
    pub coefficient_of_variation: f64,
}

/// `Inventory.SafetyStockRecalculated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStockRecalculated {
    pub recalculations: Vec<SafetyStockLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStockLine {
    pub product_id: ProductId,
    pub safety_stock: i64,
    pub service_level_z: f64,
    pub demand_mean: f64,
    pub demand_std_dev: f64,
    pub lead_time_mean_days: f64,
    pub lead_time_std_dev_days: f64,
}

/// `Inventory.DemandForecastGenerated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandForecastGenerated {
    pub horizon_days: usize,
    pub forecasts: Vec<ProductForecast>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductForecast {
    pub product_id: ProductId,
    pub daily_quantity: f64,
    pub total_quantity: f64,
}
