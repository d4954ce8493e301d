//! Built-in reaction agents.

mod abc_xyz;
mod audit;
mod expiry;
mod forecast;
mod reservation;
mod safety_stock;
mod slotting;
mod threshold;

pub use abc_xyz::AbcXyzClassifierAgent;
pub use audit::AuditTrailAgent;
pub use expiry::LotExpiryAgent;
pub use forecast::DemandForecastAgent;
pub use reservation::FefoReservationAgent;
pub use safety_stock::SafetyStockAgent;
pub use slotting::SlottingSuggestionAgent;
pub use threshold::StockThresholdAgent;

use serde::de::DeserializeOwned;
use warebus_events::EventEnvelope;
use warebus_inventory::StoreError;

use crate::contract::{AgentError, AgentResult};

/// Deserialize the payload, turning a malformed one into a captured
/// (non-retriable) failure result.
fn parse_payload<T: DeserializeOwned>(envelope: &EventEnvelope) -> Result<T, Box<AgentResult>> {
    serde_json::from_value(envelope.payload().clone()).map_err(|e| {
        Box::new(
            AgentResult::failed(format!(
                "malformed {} payload",
                envelope.event_type().as_str()
            ))
            .with_error(format!("VALIDATION_FAILED: {e}")),
        )
    })
}

/// Read-path store failures are always infrastructure: reads have no domain
/// conflicts to capture.
fn read_failure(error: StoreError) -> AgentError {
    AgentError::Infrastructure(error.to_string())
}
