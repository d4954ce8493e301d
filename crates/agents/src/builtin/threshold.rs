//! Low-stock threshold monitoring.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use warebus_core::ProductId;
use warebus_events::{catalog, Actor, EventEnvelope, EventType};
use warebus_inventory::payloads::LowStockDetected;
use warebus_inventory::{evaluate_stock_level, StateStore};

use crate::builtin::read_failure;
use crate::contract::{Agent, AgentContext, AgentError, AgentResult};

/// Watches movements and reservations; raises `Inventory.LowStockDetected`
/// when a product's warehouse availability crosses its reorder point
/// (WARNING) or safety stock (CRITICAL).
///
/// Duplicate suppression: the last alert level per (warehouse, product) is
/// persisted; an unchanged level stays silent, an escalation or recovery
/// re-emits. That guard also makes redelivery a no-op.
pub struct StockThresholdAgent {
    store: Arc<dyn StateStore>,
}

/// The slice of the movement/reservation payloads this agent needs.
#[derive(Debug, Deserialize)]
struct ProductRef {
    product_id: ProductId,
}

impl StockThresholdAgent {
    pub const NAME: &'static str = "stock-threshold";

    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Agent for StockThresholdAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Raises low-stock alerts when availability crosses thresholds"
    }

    fn subscriptions(&self) -> &[&str] {
        &[catalog::MOVEMENT_RECORDED, catalog::STOCK_RESERVED]
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        let Ok(payload) = serde_json::from_value::<ProductRef>(envelope.payload().clone()) else {
            return Ok(AgentResult::failed("payload carries no product_id")
                .with_error("VALIDATION_FAILED: missing product_id"));
        };
        let Some(warehouse_id) = ctx.warehouse_id else {
            return Ok(AgentResult::ok("no warehouse context; nothing to evaluate"));
        };

        let Some(product) = self
            .store
            .product(ctx.tenant_id, payload.product_id)
            .await
            .map_err(read_failure)?
        else {
            return Ok(AgentResult::failed("product not found")
                .with_error(format!("NOT_FOUND: product {}", payload.product_id)));
        };

        let levels = self
            .store
            .stock_levels_for_product(ctx.tenant_id, warehouse_id, product.id, None)
            .await
            .map_err(read_failure)?;

        // Stock on EXPIRED/QUARANTINE/HOLD lots cannot be picked and must
        // not mask a shortage.
        let lots = self.store.lots(ctx.tenant_id).await.map_err(read_failure)?;
        let pickable: HashMap<_, _> =
            lots.iter().map(|l| (l.id, l.status.is_pickable_status())).collect();
        let available: i64 = levels
            .iter()
            .filter(|l| match l.lot_id {
                None => true,
                Some(lot_id) => pickable.get(&lot_id).copied().unwrap_or(false),
            })
            .map(|l| l.available)
            .sum();

        let level = evaluate_stock_level(available, product.reorder_point, product.safety_stock);
        let last = self
            .store
            .last_alert_level(ctx.tenant_id, warehouse_id, product.id)
            .await
            .map_err(read_failure)?;

        if level == last {
            debug!(
                product_id = %product.id,
                available,
                level = ?level,
                "threshold unchanged; suppressing alert"
            );
            return Ok(AgentResult::ok("alert level unchanged"));
        }

        let mut tx = self.store.begin().await.map_err(read_failure)?;
        tx.record_alert_level(ctx.tenant_id, warehouse_id, product.id, level)
            .await
            .map_err(read_failure)?;
        tx.commit().await.map_err(read_failure)?;

        let Some(level) = level else {
            return Ok(AgentResult::ok("availability recovered; alert cleared"));
        };

        let alert = LowStockDetected {
            product_id: product.id,
            alert_level: level,
            available,
            reorder_point: product.reorder_point,
            safety_stock: product.safety_stock,
        };
        let derived = envelope.derive(
            EventType::known(catalog::LOW_STOCK_DETECTED),
            serde_json::to_value(&alert)
                .map_err(|e| AgentError::Infrastructure(format!("payload serialization: {e}")))?,
            Actor::agent(Self::NAME),
        );

        Ok(AgentResult::ok(format!(
            "{:?} low-stock alert for product {} (available {available})",
            level, product.id
        ))
        .with_envelope(derived))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubStore;
    use serde_json::json;
    use warebus_core::{TenantId, WarehouseId};
    use warebus_events::EnvelopeContext;
    use warebus_inventory::{AlertLevel, Product, StockLevel};

    struct World {
        store: Arc<StubStore>,
        tenant: TenantId,
        warehouse: WarehouseId,
        product: ProductId,
    }

    fn world(reorder_point: i64, safety_stock: i64) -> World {
        let store = Arc::new(StubStore::new());
        let tenant = TenantId::new();
        let warehouse = WarehouseId::new();
        let product = Product::new(tenant, "SKU-3", "Gadget").with_thresholds(reorder_point, safety_stock);
        let product_id = product.id;
        store.state().products.push(product);
        World {
            store,
            tenant,
            warehouse,
            product: product_id,
        }
    }

    impl World {
        fn set_available(&self, available: i64) {
            let mut state = self.store.state();
            state.stock_levels.clear();
            let mut level = StockLevel::new(
                self.tenant,
                self.warehouse,
                self.product,
                None,
                warebus_core::LocationId::new(),
                None,
            );
            level.on_hand = available;
            level.available = available;
            state.stock_levels.push(level);
        }

        fn movement_envelope(&self) -> EventEnvelope {
            let ctx = EnvelopeContext::root(self.tenant, Some(self.warehouse), Actor::system("test"));
            EventEnvelope::record(
                EventType::known(catalog::MOVEMENT_RECORDED),
                json!({"product_id": self.product, "movement_type": "SHIP", "quantity": 2}),
                &ctx,
            )
        }
    }

    async fn run(world: &World) -> AgentResult {
        let agent = StockThresholdAgent::new(world.store.clone());
        let envelope = world.movement_envelope();
        agent
            .handle(&envelope, &AgentContext::for_envelope(&envelope))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cascade_warns_then_escalates() {
        let w = world(10, 3);

        // Available drops from 11 to 9: WARNING.
        w.set_available(9);
        let result = run(&w).await;
        assert_eq!(result.envelopes.len(), 1);
        let alert: LowStockDetected =
            serde_json::from_value(result.envelopes[0].payload().clone()).unwrap();
        assert_eq!(alert.alert_level, AlertLevel::Warning);
        assert_eq!(alert.available, 9);

        // Further drop to 2: CRITICAL.
        w.set_available(2);
        let result = run(&w).await;
        assert_eq!(result.envelopes.len(), 1);
        let alert: LowStockDetected =
            serde_json::from_value(result.envelopes[0].payload().clone()).unwrap();
        assert_eq!(alert.alert_level, AlertLevel::Critical);
        assert_eq!(alert.available, 2);
    }

    #[tokio::test]
    async fn unchanged_level_is_suppressed() {
        let w = world(10, 3);
        w.set_available(9);

        let first = run(&w).await;
        assert_eq!(first.envelopes.len(), 1);

        // Same WARNING band again (and the redelivery case).
        w.set_available(8);
        let second = run(&w).await;
        assert!(second.success);
        assert!(second.envelopes.is_empty());
    }

    #[tokio::test]
    async fn recovery_clears_the_alert_silently() {
        let w = world(10, 3);
        w.set_available(9);
        run(&w).await;

        w.set_available(50);
        let result = run(&w).await;
        assert!(result.success);
        assert!(result.envelopes.is_empty());

        // A later dip must alert again.
        w.set_available(9);
        let result = run(&w).await;
        assert_eq!(result.envelopes.len(), 1);
    }

    #[tokio::test]
    async fn healthy_stock_never_alerts() {
        let w = world(10, 3);
        w.set_available(100);
        let result = run(&w).await;
        assert!(result.success);
        assert!(result.envelopes.is_empty());
    }

    #[tokio::test]
    async fn stock_on_non_pickable_lots_does_not_mask_a_shortage() {
        let w = world(10, 3);
        // 2 pickable units plus 50 sitting on a quarantined lot.
        w.set_available(2);
        {
            let mut state = w.store.state();
            let mut lot =
                warebus_inventory::LotBatch::new(w.tenant, w.product, "Q-1");
            lot.status = warebus_inventory::LotStatus::Quarantine;
            let mut level = StockLevel::new(
                w.tenant,
                w.warehouse,
                w.product,
                None,
                warebus_core::LocationId::new(),
                Some(lot.id),
            );
            level.on_hand = 50;
            level.available = 50;
            state.lots.push(lot);
            state.stock_levels.push(level);
        }

        let result = run(&w).await;
        assert_eq!(result.envelopes.len(), 1);
        let alert: LowStockDetected =
            serde_json::from_value(result.envelopes[0].payload().clone()).unwrap();
        assert_eq!(alert.alert_level, AlertLevel::Critical);
        assert_eq!(alert.available, 2);
    }
}
