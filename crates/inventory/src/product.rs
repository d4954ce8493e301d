//! Product master data used by reservation, slotting, and planning agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warebus_core::{ProductId, TenantId};

use crate::location::TemperatureZone;

/// Revenue-Pareto class: A covers the top 80 % of cumulative revenue,
/// B up to 95 %, C the tail.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbcClass {
    A,
    B,
    C,
}

/// Demand-variability class by coefficient of variation:
/// X < 0.5, Y < 1.0, Z otherwise.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XyzClass {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub tenant_id: TenantId,
    pub sku: String,
    pub name: String,
    pub unit_price: f64,
    pub reorder_point: i64,
    pub safety_stock: i64,
    pub abc_class: Option<AbcClass>,
    pub xyz_class: Option<XyzClass>,
    pub hazmat: bool,
    pub temperature_zone: Option<TemperatureZone>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(tenant_id: TenantId, sku: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ProductId::new(),
            tenant_id,
            sku: sku.into(),
            name: name.into(),
            unit_price: 0.0,
            reorder_point: 0,
            safety_stock: 0,
            abc_class: None,
            xyz_class: None,
            hazmat: false,
            temperature_zone: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_thresholds(mut self, reorder_point: i64, safety_stock: i64) -> Self {
        self.reorder_point = reorder_point;
        self.safety_stock = safety_stock;
        self
    }

    pub fn with_unit_price(mut self, price: f64) -> Self {
        self.unit_price = price;
        self
    }

    pub fn with_abc_class(mut self, class: AbcClass) -> Self {
        self.abc_class = Some(class);
        self
    }

    pub fn with_hazmat(mut self, hazmat: bool) -> Self {
        self.hazmat = hazmat;
        self
    }

    pub fn with_temperature_zone(mut self, zone: TemperatureZone) -> Self {
        self.temperature_zone = Some(zone);
        self
    }
}
