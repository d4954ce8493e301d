//! Event type names and the `Aggregate.Verb` grammar.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use warebus_core::DomainError;

static EVENT_TYPE_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z]+\.[A-Z][A-Za-z]+$").expect("valid grammar regex"));

/// A validated event type name, e.g. `Inventory.MovementRecorded`.
///
/// The name is `AggregateName.VerbPhrase`, both in UpperCamelCase. Anything
/// else is rejected at parse time, so a constructed `EventType` is always
/// well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    /// Parse and validate an event type name.
    pub fn parse(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if !EVENT_TYPE_GRAMMAR.is_match(&name) {
            return Err(DomainError::validation(format!(
                "event type '{name}' does not match AggregateName.VerbPhrase"
            )));
        }
        Ok(Self(name))
    }

    /// Construct from a catalog literal (see [`catalog`]).
    ///
    /// Catalog names are grammar-checked by tests; runtime input must go
    /// through [`EventType::parse`].
    pub fn known(name: &'static str) -> Self {
        debug_assert!(EVENT_TYPE_GRAMMAR.is_match(name), "catalog name '{name}' breaks grammar");
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The aggregate part, e.g. `Inventory`.
    pub fn aggregate(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// The verb phrase, e.g. `MovementRecorded`.
    pub fn verb(&self) -> &str {
        self.0.split('.').nth(1).unwrap_or("")
    }

    /// Broker routing key: lower-case, dot-separated on word boundaries.
    ///
    /// `Inventory.MovementRecorded` → `inventory.movement.recorded`.
    pub fn routing_key(&self) -> String {
        let mut key = String::with_capacity(self.0.len() + 4);
        for (i, segment) in self.0.split('.').enumerate() {
            if i > 0 {
                key.push('.');
            }
            for (j, ch) in segment.chars().enumerate() {
                if ch.is_ascii_uppercase() {
                    if j > 0 {
                        key.push('.');
                    }
                    key.push(ch.to_ascii_lowercase());
                } else {
                    key.push(ch);
                }
            }
        }
        key
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EventType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Canonical event type names minted by this system.
///
/// The legacy bare `OrderPlaced` spelling is not an alias of
/// `SalesOrder.OrderPlaced`; nothing in this workspace parses it.
pub mod catalog {
    pub const GOODS_RECEIVED: &str = "Inventory.GoodsReceived";
    pub const MOVEMENT_RECORDED: &str = "Inventory.MovementRecorded";
    pub const STOCK_RESERVED: &str = "Inventory.StockReserved";
    pub const RESERVATION_SHORTFALL: &str = "Inventory.ReservationShortfall";
    pub const SLOTTING_SUGGESTIONS_GENERATED: &str = "Inventory.SlottingSuggestionsGenerated";
    pub const LOW_STOCK_DETECTED: &str = "Inventory.LowStockDetected";
    pub const LOT_EXPIRED: &str = "Inventory.LotExpired";
    pub const SAFETY_STOCK_RECALCULATED: &str = "Inventory.SafetyStockRecalculated";
    pub const DEMAND_FORECAST_GENERATED: &str = "Inventory.DemandForecastGenerated";
    pub const ABC_XYZ_CLASSIFIED: &str = "Product.AbcXyzClassified";
    pub const ORDER_PLACED: &str = "SalesOrder.OrderPlaced";
    pub const ORDER_FULLY_ALLOCATED: &str = "SalesOrder.OrderFullyAllocated";
    pub const SCHEDULED_EXPIRY_CHECK: &str = "Scheduled.ExpiryCheck";
    pub const SCHEDULED_ABC_XYZ_ANALYSIS: &str = "Scheduled.AbcXyzAnalysis";
    pub const SCHEDULED_SAFETY_STOCK_RECALC: &str = "Scheduled.SafetyStockRecalc";
    pub const SCHEDULED_DEMAND_FORECAST: &str = "Scheduled.DemandForecast";

    pub const ALL: &[&str] = &[
        GOODS_RECEIVED,
        MOVEMENT_RECORDED,
        STOCK_RESERVED,
        RESERVATION_SHORTFALL,
        SLOTTING_SUGGESTIONS_GENERATED,
        LOW_STOCK_DETECTED,
        LOT_EXPIRED,
        SAFETY_STOCK_RECALCULATED,
        DEMAND_FORECAST_GENERATED,
        ABC_XYZ_CLASSIFIED,
        ORDER_PLACED,
        ORDER_FULLY_ALLOCATED,
        SCHEDULED_EXPIRY_CHECK,
        SCHEDULED_ABC_XYZ_ANALYSIS,
        SCHEDULED_SAFETY_STOCK_RECALC,
        SCHEDULED_DEMAND_FORECAST,
    ];
}
