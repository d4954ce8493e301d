//! Low-stock threshold evaluation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Alert level for a product's availability in a warehouse.
///
/// At or below safety stock is `CRITICAL`; at or below the reorder point is
/// `WARNING`; above both, no alert.
pub fn evaluate_stock_level(available: i64, reorder_point: i64, safety_stock: i64) -> Option<AlertLevel> {
    if reorder_point <= 0 && safety_stock <= 0 {
        return None;
    }
    if available <= safety_stock {
        Some(AlertLevel::Critical)
    } else if available <= reorder_point {
        Some(AlertLevel::Warning)
    } else {
        None
    }
}
