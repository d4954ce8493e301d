//! Scheduled lot expiry sweep.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use warebus_events::{catalog, Actor, EventEnvelope, EventType};
use warebus_inventory::payloads::LotExpired;
use warebus_inventory::{LotStatus, StateStore, StockDeltas};

use crate::builtin::read_failure;
use crate::contract::{Agent, AgentContext, AgentError, AgentResult};

/// Reacts to `Scheduled.ExpiryCheck`: lots past their expiration date that
/// are still pickable are auto-quarantined — status `EXPIRED` and their
/// on-hand moved into the quarantine bucket, one transaction and one
/// `Inventory.LotExpired` envelope per lot.
///
/// Idempotent: a lot already `EXPIRED` is skipped, so a redelivered sweep
/// changes nothing.
pub struct LotExpiryAgent {
    store: Arc<dyn StateStore>,
}

impl LotExpiryAgent {
    pub const NAME: &'static str = "lot-expiry";

    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Agent for LotExpiryAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Expires lots past their expiration date"
    }

    fn subscriptions(&self) -> &[&str] {
        &[catalog::SCHEDULED_EXPIRY_CHECK]
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        // The sweep date comes from the envelope, so replays see the same
        // cutoff the original tick did.
        let today = envelope.occurred_at().date_naive();

        let lots = self.store.lots(ctx.tenant_id).await.map_err(read_failure)?;
        let mut result = AgentResult::ok("expiry sweep complete");
        let mut expired = 0usize;

        for lot in lots {
            let Some(days_expired) = lot.days_expired(today) else {
                continue;
            };
            if lot.status == LotStatus::Expired {
                continue;
            }

            let levels = self
                .store
                .stock_levels_for_lot(ctx.tenant_id, lot.id)
                .await
                .map_err(read_failure)?;

            // Status flip and quarantine accounting commit together, so the
            // lot's stock stops counting as available the moment it expires.
            let mut tx = self.store.begin().await.map_err(read_failure)?;
            tx.set_lot_status(lot.id, LotStatus::Expired)
                .await
                .map_err(read_failure)?;
            let mut quantity_quarantined = 0i64;
            for level in &levels {
                if level.on_hand > 0 {
                    tx.adjust_stock(
                        level.id,
                        StockDeltas::quarantine(level.on_hand),
                        level.row_version,
                        false,
                    )
                    .await
                    .map_err(read_failure)?;
                    quantity_quarantined += level.on_hand;
                }
            }
            tx.commit().await.map_err(read_failure)?;

            info!(
                lot_id = %lot.id,
                lot_number = %lot.lot_number,
                days_expired,
                quantity_quarantined,
                "lot auto-quarantined as expired"
            );

            let payload = LotExpired {
                lot_id: lot.id,
                lot_number: lot.lot_number.clone(),
                product_id: lot.product_id,
                days_expired,
                action_taken: LotExpired::AUTO_QUARANTINE.to_string(),
                quantity_quarantined,
            };
            result = result.with_envelope(envelope.derive(
                EventType::known(catalog::LOT_EXPIRED),
                serde_json::to_value(&payload)
                    .map_err(|e| AgentError::Infrastructure(format!("payload serialization: {e}")))?,
                Actor::agent(Self::NAME),
            ));
            expired += 1;
        }

        result.message = format!("expired {expired} lots");
        Ok(result)
    }
}
