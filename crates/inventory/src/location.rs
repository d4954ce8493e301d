//! Storage locations and their slotting-relevant attributes.

use serde::{Deserialize, Serialize};

use warebus_core::{LocationId, TenantId, WarehouseId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationType {
    Pick,
    Staging,
    Bulk,
    Receiving,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemperatureZone {
    Ambient,
    Chilled,
    Frozen,
    Controlled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub code: String,
    pub zone: String,
    pub location_type: LocationType,
    pub temperature_zone: TemperatureZone,
    /// Current fill level in percent, 0–100.
    pub utilization_pct: f64,
    /// Walking distance from the receiving dock, in meters.
    pub distance_from_dock: f64,
    /// Picks per period, maintained by the read model.
    pub pick_frequency: f64,
    /// Walk order within the warehouse; also the deterministic tiebreak.
    pub pick_sequence: u32,
    pub hazmat_certified: bool,
    pub active: bool,
}

impl Location {
    pub fn new(
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        code: impl Into<String>,
        location_type: LocationType,
    ) -> Self {
        Self {
            id: LocationId::new(),
            tenant_id,
            warehouse_id,
            code: code.into(),
            zone: "A".to_string(),
            location_type,
            temperature_zone: TemperatureZone::Ambient,
            utilization_pct: 0.0,
            distance_from_dock: 0.0,
            pick_frequency: 0.0,
            pick_sequence: 0,
            hazmat_certified: false,
            active: true,
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn with_stats(mut self, utilization_pct: f64, distance_from_dock: f64, pick_frequency: f64) -> Self {
        self.utilization_pct = utilization_pct;
        self.distance_from_dock = distance_from_dock;
        self.pick_frequency = pick_frequency;
        self
    }

    pub fn with_pick_sequence(mut self, seq: u32) -> Self {
        self.pick_sequence = seq;
        self
    }

    pub fn with_temperature_zone(mut self, zone: TemperatureZone) -> Self {
        self.temperature_zone = zone;
        self
    }

    pub fn with_hazmat_certified(mut self, certified: bool) -> Self {
        self.hazmat_certified = certified;
        self
    }
}
