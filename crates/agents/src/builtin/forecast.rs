//! Scheduled demand forecasting.

use std::sync::Arc;

use async_trait::async_trait;

use warebus_events::{catalog, Actor, EventEnvelope, EventType};
use warebus_inventory::payloads::{DemandForecastGenerated, ProductForecast};
use warebus_inventory::{forecast_demand, StateStore};

use crate::builtin::read_failure;
use crate::contract::{Agent, AgentContext, AgentError, AgentResult};

/// Reacts to `Scheduled.DemandForecast`: produces an exponentially smoothed
/// per-product demand forecast over the configured horizon.
///
/// Read-only; emits one `Inventory.DemandForecastGenerated` envelope.
pub struct DemandForecastAgent {
    store: Arc<dyn StateStore>,
    alpha: f64,
    horizon_days: usize,
}

impl DemandForecastAgent {
    pub const NAME: &'static str = "demand-forecast";

    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            alpha: 0.3,
            horizon_days: 30,
        }
    }

    pub fn with_horizon_days(mut self, days: usize) -> Self {
        self.horizon_days = days;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }
}

#[async_trait]
impl Agent for DemandForecastAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Generates smoothed demand forecasts per product"
    }

    fn subscriptions(&self) -> &[&str] {
        &[catalog::SCHEDULED_DEMAND_FORECAST]
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        let products = self.store.products(ctx.tenant_id).await.map_err(read_failure)?;

        let mut forecasts = Vec::new();
        for product in &products {
            let mut history = self
                .store
                .demand_history(ctx.tenant_id, product.id)
                .await
                .map_err(read_failure)?;
            if history.is_empty() {
                continue;
            }
            history.sort_by_key(|s| s.day);

            let samples: Vec<f64> = history.iter().map(|s| s.quantity as f64).collect();
            let daily = forecast_demand(&samples, self.alpha, self.horizon_days);
            let daily_quantity = daily.first().copied().unwrap_or(0.0);
            forecasts.push(ProductForecast {
                product_id: product.id,
                daily_quantity,
                total_quantity: daily_quantity * self.horizon_days as f64,
            });
        }

        if forecasts.is_empty() {
            return Ok(AgentResult::ok("no demand history to forecast from"));
        }

        let payload = DemandForecastGenerated {
            horizon_days: self.horizon_days,
            forecasts,
        };
        let derived = envelope.derive(
            EventType::known(catalog::DEMAND_FORECAST_GENERATED),
            serde_json::to_value(&payload)
                .map_err(|e| AgentError::Infrastructure(format!("payload serialization: {e}")))?,
            Actor::agent(Self::NAME),
        );

        Ok(AgentResult::ok(format!(
            "forecast {} products over {} days",
            payload.forecasts.len(),
            self.horizon_days
        ))
        .with_envelope(derived))
    }
}
