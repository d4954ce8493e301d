//! Putaway slotting suggestions on goods receipt.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use warebus_events::{catalog, Actor, EventEnvelope, EventType};
use warebus_inventory::payloads::{GoodsReceived, SlottingSuggestionsGenerated};
use warebus_inventory::{rank, SlottingContext, SlottingWeights, StateStore};

use crate::builtin::{parse_payload, read_failure};
use crate::contract::{Agent, AgentContext, AgentError, AgentResult};

/// Reacts to `Inventory.GoodsReceived` with ranked putaway locations.
///
/// Pure read-and-emit: safe to re-run on redelivery.
pub struct SlottingSuggestionAgent {
    store: Arc<dyn StateStore>,
    weights: SlottingWeights,
}

impl SlottingSuggestionAgent {
    pub const NAME: &'static str = "slotting-suggestion";

    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            weights: SlottingWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: SlottingWeights) -> Self {
        self.weights = weights;
        self
    }
}

#[async_trait]
impl Agent for SlottingSuggestionAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Ranks putaway locations for received goods"
    }

    fn subscriptions(&self) -> &[&str] {
        &[catalog::GOODS_RECEIVED]
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        let payload: GoodsReceived = match parse_payload(envelope) {
            Ok(p) => p,
            Err(failed) => return Ok(*failed),
        };

        let Some(warehouse_id) = ctx.warehouse_id else {
            return Ok(AgentResult::failed("goods receipt without warehouse context")
                .with_error("VALIDATION_FAILED: missing warehouse_id"));
        };

        let product = self
            .store
            .product(ctx.tenant_id, payload.product_id)
            .await
            .map_err(read_failure)?;
        let candidates = self
            .store
            .locations(ctx.tenant_id, warehouse_id)
            .await
            .map_err(read_failure)?;

        let mut slotting_ctx = SlottingContext::new(payload.quantity);
        if let Some(product) = &product {
            slotting_ctx.abc_class = product.abc_class;
            slotting_ctx.required_temperature = product.temperature_zone;
            slotting_ctx.hazmat = product.hazmat;
        }

        let ranked = rank(&candidates, &slotting_ctx, &self.weights);
        debug!(
            product_id = %payload.product_id,
            candidates = candidates.len(),
            ranked = ranked.len(),
            "slotting suggestions computed"
        );

        if ranked.is_empty() {
            return Ok(AgentResult::ok("no eligible locations")
                .with_data(json!({"candidates_considered": candidates.len()})));
        }

        let suggestions = SlottingSuggestionsGenerated {
            product_id: payload.product_id,
            quantity: payload.quantity,
            suggestions: ranked,
        };
        let derived = envelope.derive(
            EventType::known(catalog::SLOTTING_SUGGESTIONS_GENERATED),
            serde_json::to_value(&suggestions)
                .map_err(|e| AgentError::Infrastructure(format!("payload serialization: {e}")))?,
            Actor::agent(Self::NAME),
        );

        Ok(AgentResult::ok(format!(
            "{} suggestions for product {}",
            suggestions.suggestions.len(),
            payload.product_id
        ))
        .with_envelope(derived))
    }
}
