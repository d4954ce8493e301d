//! Scheduled safety-stock recomputation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use warebus_events::{catalog, Actor, EventEnvelope, EventType};
use warebus_inventory::payloads::{SafetyStockLine, SafetyStockRecalculated};
use warebus_inventory::{safety_stock, SeriesStats, StateStore};

use crate::builtin::read_failure;
use crate::contract::{Agent, AgentContext, AgentError, AgentResult};

/// Reacts to `Scheduled.SafetyStockRecalc`: sizes each product's buffer to
/// the target service level via `Z · √(LT·σD² + D²·σLT²)` and persists it.
///
/// Products without lead-time statistics are skipped; the formula has
/// nothing to work with for them.
pub struct SafetyStockAgent {
    store: Arc<dyn StateStore>,
    service_level_z: f64,
}

impl SafetyStockAgent {
    pub const NAME: &'static str = "safety-stock";

    /// Z defaults to 1.65 (~95 % service level).
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            service_level_z: 1.65,
        }
    }

    pub fn with_service_level_z(mut self, z: f64) -> Self {
        self.service_level_z = z;
        self
    }
}

#[async_trait]
impl Agent for SafetyStockAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Recomputes per-product safety stock from demand and lead-time stats"
    }

    fn subscriptions(&self) -> &[&str] {
        &[catalog::SCHEDULED_SAFETY_STOCK_RECALC]
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        let products = self.store.products(ctx.tenant_id).await.map_err(read_failure)?;

        // Gather every input first; the write transaction opens only once
        // all reads are done.
        let mut lines = Vec::new();
        for product in &products {
            let Some(lead_time) = self
                .store
                .lead_time_stats(ctx.tenant_id, product.id)
                .await
                .map_err(read_failure)?
            else {
                debug!(product_id = %product.id, "no lead-time stats; skipping");
                continue;
            };

            let history = self
                .store
                .demand_history(ctx.tenant_id, product.id)
                .await
                .map_err(read_failure)?;
            let samples: Vec<f64> = history.iter().map(|s| s.quantity as f64).collect();
            let demand = SeriesStats::from_samples(&samples);
            let lead = SeriesStats {
                mean: lead_time.mean_days,
                std_dev: lead_time.std_dev_days,
            };

            lines.push(SafetyStockLine {
                product_id: product.id,
                safety_stock: safety_stock(self.service_level_z, demand, lead),
                service_level_z: self.service_level_z,
                demand_mean: demand.mean,
                demand_std_dev: demand.std_dev,
                lead_time_mean_days: lead.mean,
                lead_time_std_dev_days: lead.std_dev,
            });
        }

        if !lines.is_empty() {
            let mut tx = self.store.begin().await.map_err(read_failure)?;
            for line in &lines {
                tx.set_product_safety_stock(ctx.tenant_id, line.product_id, line.safety_stock)
                    .await
                    .map_err(read_failure)?;
            }
            tx.commit().await.map_err(read_failure)?;
        }

        if lines.is_empty() {
            return Ok(AgentResult::ok("no products with lead-time statistics"));
        }

        let payload = SafetyStockRecalculated { recalculations: lines };
        let derived = envelope.derive(
            EventType::known(catalog::SAFETY_STOCK_RECALCULATED),
            serde_json::to_value(&payload)
                .map_err(|e| AgentError::Infrastructure(format!("payload serialization: {e}")))?,
            Actor::agent(Self::NAME),
        );

        Ok(AgentResult::ok(format!(
            "recomputed safety stock for {} products",
            payload.recalculations.len()
        ))
        .with_envelope(derived))
    }
}
