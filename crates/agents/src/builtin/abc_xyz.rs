//! Scheduled ABC-XYZ product classification.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use warebus_events::{catalog, Actor, EventEnvelope, EventType};
use warebus_inventory::payloads::{AbcXyzClassified, ProductClassification};
use warebus_inventory::{classify_abc, classify_xyz, SeriesStats, StateStore};

use crate::builtin::read_failure;
use crate::contract::{Agent, AgentContext, AgentError, AgentResult};

/// Reacts to `Scheduled.AbcXyzAnalysis`: ranks the tenant's products by
/// trailing revenue (ABC) and demand variability (XYZ), persists the
/// classes, and emits one `Product.AbcXyzClassified` envelope.
///
/// Recomputing from the same history writes the same classes, so redelivery
/// is harmless.
pub struct AbcXyzClassifierAgent {
    store: Arc<dyn StateStore>,
}

impl AbcXyzClassifierAgent {
    pub const NAME: &'static str = "abc-xyz-classifier";

    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Agent for AbcXyzClassifierAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Classifies products by revenue share and demand variability"
    }

    fn subscriptions(&self) -> &[&str] {
        &[catalog::SCHEDULED_ABC_XYZ_ANALYSIS]
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        let products = self.store.products(ctx.tenant_id).await.map_err(read_failure)?;
        if products.is_empty() {
            return Ok(AgentResult::ok("no products to classify"));
        }

        let mut revenues = Vec::with_capacity(products.len());
        let mut stats = Vec::with_capacity(products.len());
        for product in &products {
            let history = self
                .store
                .demand_history(ctx.tenant_id, product.id)
                .await
                .map_err(read_failure)?;
            let samples: Vec<f64> = history.iter().map(|s| s.quantity as f64).collect();
            let shipped: f64 = samples.iter().sum();
            revenues.push((product.id, shipped * product.unit_price));
            stats.push((product.id, SeriesStats::from_samples(&samples)));
        }

        let abc = classify_abc(&revenues);

        let mut tx = self.store.begin().await.map_err(read_failure)?;
        let mut classifications = Vec::with_capacity(products.len());
        for (product_id, abc_class) in abc {
            let series = stats
                .iter()
                .find(|(id, _)| *id == product_id)
                .map(|(_, s)| *s)
                .unwrap_or(SeriesStats { mean: 0.0, std_dev: 0.0 });
            let cov = series.coefficient_of_variation();
            let xyz_class = classify_xyz(cov);

            tx.set_product_classes(ctx.tenant_id, product_id, abc_class, xyz_class)
                .await
                .map_err(read_failure)?;

            let revenue = revenues
                .iter()
                .find(|(id, _)| *id == product_id)
                .map(|(_, r)| *r)
                .unwrap_or(0.0);
            classifications.push(ProductClassification {
                product_id,
                abc_class,
                xyz_class,
                revenue,
                coefficient_of_variation: if cov.is_finite() { cov } else { f64::MAX },
            });
        }
        tx.commit().await.map_err(read_failure)?;

        debug!(products = classifications.len(), "abc-xyz classification persisted");

        let payload = AbcXyzClassified { classifications };
        let derived = envelope.derive(
            EventType::known(catalog::ABC_XYZ_CLASSIFIED),
            serde_json::to_value(&payload)
                .map_err(|e| AgentError::Infrastructure(format!("payload serialization: {e}")))?,
            Actor::agent(Self::NAME),
        );

        Ok(AgentResult::ok(format!("classified {} products", payload.classifications.len()))
            .with_envelope(derived))
    }
}
