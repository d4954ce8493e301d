//! FEFO reservation of stock for placed sales orders.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use warebus_core::{ReservationId, WarehouseId};
use warebus_events::{catalog, Actor, EventEnvelope, EventType};
use warebus_inventory::payloads::{
    OrderFullyAllocated, OrderPlaced, OrderPlacedLine, ReservationShortfall, StockReserved,
};
use warebus_inventory::{
    allocate, retry_on_conflict, AllocationRequest, AllocationResult, AllocationSource,
    OrderStatus, Reservation, ReservationReference, StateStore, StockDeltas, StoreError,
};

use crate::builtin::{parse_payload, read_failure};
use crate::contract::{Agent, AgentContext, AgentError, AgentResult};

const CAS_ATTEMPTS: u32 = 3;

/// Reacts to `SalesOrder.OrderPlaced`: allocates each line FEFO, creates
/// reservations, and moves the allocated quantity into the stock levels'
/// reserved totals under optimistic concurrency.
///
/// Idempotency: the order id is the natural unique key. A re-run that finds
/// reservations for the order leaves state untouched.
pub struct FefoReservationAgent {
    store: Arc<dyn StateStore>,
    min_days_to_expiration: i64,
}

struct LineOutcome {
    line: OrderPlacedLine,
    allocation: AllocationResult,
    reservation_ids: Vec<ReservationId>,
}

impl FefoReservationAgent {
    pub const NAME: &'static str = "fefo-reservation";

    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            min_days_to_expiration: 0,
        }
    }

    pub fn with_min_days_to_expiration(mut self, days: i64) -> Self {
        self.min_days_to_expiration = days;
        self
    }

    /// Allocate and reserve one order line inside a single transaction,
    /// retrying bounded times when the row-version CAS loses.
    async fn reserve_line(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
        warehouse_id: WarehouseId,
        order_id: &str,
        line: &OrderPlacedLine,
    ) -> Result<LineOutcome, StoreError> {
        let today = envelope.occurred_at().date_naive();

        retry_on_conflict(CAS_ATTEMPTS, || {
            let (this, ctx, line, order_id) = (self, ctx, line, order_id);
            async move {
                let levels = this
                    .store
                    .stock_levels_for_product(
                        ctx.tenant_id,
                        warehouse_id,
                        line.product_id,
                        line.variant_id,
                    )
                    .await?;

                let locations = this.store.locations(ctx.tenant_id, warehouse_id).await?;
                let pick_sequences: HashMap<_, _> =
                    locations.iter().map(|l| (l.id, l.pick_sequence)).collect();

                let mut sources = Vec::with_capacity(levels.len());
                for level in levels {
                    let lot = match level.lot_id {
                        Some(lot_id) => this.store.lot(lot_id).await?,
                        None => None,
                    };
                    let pick_sequence =
                        pick_sequences.get(&level.location_id).copied().unwrap_or(u32::MAX);
                    sources.push(AllocationSource {
                        stock: level,
                        lot,
                        pick_sequence,
                    });
                }

                let mut request =
                    AllocationRequest::new(line.product_id, warehouse_id, line.quantity);
                request.variant_id = line.variant_id;
                request.min_days_to_expiration = this.min_days_to_expiration;
                let allocation = allocate(&request, &sources, today);

                let mut tx = this.store.begin().await?;
                let mut reservation_ids = Vec::with_capacity(allocation.lines.len());
                for alloc in &allocation.lines {
                    let source = sources
                        .iter()
                        .find(|s| s.stock.id == alloc.stock_level_id)
                        .ok_or_else(|| StoreError::storage("allocation references unknown source"))?;

                    tx.adjust_stock(
                        alloc.stock_level_id,
                        StockDeltas::reserved(alloc.quantity),
                        source.stock.row_version,
                        false,
                    )
                    .await?;

                    let reservation = Reservation::active(
                        ctx.tenant_id,
                        line.product_id,
                        line.variant_id,
                        alloc.stock_level_id,
                        alloc.lot_id,
                        alloc.quantity,
                        ReservationReference {
                            ref_type: "SALES_ORDER".to_string(),
                            ref_id: order_id.to_string(),
                            line: line.line,
                        },
                    )?;
                    reservation_ids.push(reservation.id);
                    tx.put_reservation(reservation).await?;
                }
                tx.commit().await?;

                Ok(LineOutcome {
                    line: line.clone(),
                    allocation,
                    reservation_ids,
                })
            }
        })
        .await
    }
}

#[async_trait]
impl Agent for FefoReservationAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Reserves stock FEFO for placed sales orders"
    }

    fn subscriptions(&self) -> &[&str] {
        &[catalog::ORDER_PLACED]
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id(), tenant_id = %ctx.tenant_id))]
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        ctx: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        let payload: OrderPlaced = match parse_payload(envelope) {
            Ok(p) => p,
            Err(failed) => return Ok(*failed),
        };
        let Some(warehouse_id) = ctx.warehouse_id else {
            return Ok(AgentResult::failed("order placed without warehouse context")
                .with_error("VALIDATION_FAILED: missing warehouse_id"));
        };

        let order_key = payload.order_id.to_string();
        let existing = self
            .store
            .reservations_for_reference(ctx.tenant_id, "SALES_ORDER", &order_key)
            .await
            .map_err(read_failure)?;
        if !existing.is_empty() {
            debug!(order_id = %order_key, reservations = existing.len(), "order already reserved");
            return Ok(AgentResult::ok("reservations already exist for order"));
        }

        let mut outcomes = Vec::with_capacity(payload.lines.len());
        for line in &payload.lines {
            match self
                .reserve_line(envelope, ctx, warehouse_id, &order_key, line)
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_conflict() => {
                    // CAS budget exhausted; retriable at the message level.
                    return Err(AgentError::Infrastructure(e.to_string()));
                }
                Err(StoreError::Storage(msg)) => return Err(AgentError::Infrastructure(msg)),
                Err(StoreError::Domain(domain)) => {
                    return Ok(AgentResult::failed(format!(
                        "reservation failed for line {}",
                        line.line
                    ))
                    .with_error(domain.to_string()));
                }
            }
        }

        let mut result = AgentResult::ok(format!(
            "reserved {} of {} lines in full",
            outcomes.iter().filter(|o| o.allocation.fully_allocated).count(),
            outcomes.len(),
        ));

        for outcome in &outcomes {
            let reserved = StockReserved {
                order_id: payload.order_id,
                line: outcome.line.line,
                product_id: outcome.line.product_id,
                reservation_ids: outcome.reservation_ids.clone(),
                allocations: outcome.allocation.lines.clone(),
                skipped: outcome.allocation.skipped.clone(),
                requested_quantity: outcome.allocation.requested_quantity,
                reserved_quantity: outcome.allocation.allocated_quantity,
                fully_reserved: outcome.allocation.fully_allocated,
            };
            result = result.with_envelope(envelope.derive(
                EventType::known(catalog::STOCK_RESERVED),
                serde_json::to_value(&reserved)
                    .map_err(|e| AgentError::Infrastructure(format!("payload serialization: {e}")))?,
                Actor::agent(Self::NAME),
            ));

            if !outcome.allocation.fully_allocated {
                let shortfall = ReservationShortfall {
                    order_id: payload.order_id,
                    line: outcome.line.line,
                    product_id: outcome.line.product_id,
                    requested_quantity: outcome.allocation.requested_quantity,
                    reserved_quantity: outcome.allocation.allocated_quantity,
                    shortfall_quantity: outcome.allocation.shortfall_quantity,
                };
                result = result.with_envelope(envelope.derive(
                    EventType::known(catalog::RESERVATION_SHORTFALL),
                    serde_json::to_value(&shortfall).map_err(|e| {
                        AgentError::Infrastructure(format!("payload serialization: {e}"))
                    })?,
                    Actor::agent(Self::NAME),
                ));
            }
        }

        if !outcomes.is_empty() && outcomes.iter().all(|o| o.allocation.fully_allocated) {
            let mut tx = self.store.begin().await.map_err(read_failure)?;
            match tx.set_order_status(ctx.tenant_id, payload.order_id, OrderStatus::Allocated).await {
                Ok(()) => tx.commit().await.map_err(read_failure)?,
                // The order row is optional state; its absence does not
                // invalidate the reservations already made.
                Err(StoreError::Domain(_)) => {}
                Err(StoreError::Storage(msg)) => return Err(AgentError::Infrastructure(msg)),
            }

            let allocated = OrderFullyAllocated {
                order_id: payload.order_id,
                reservation_ids: outcomes.iter().flat_map(|o| o.reservation_ids.clone()).collect(),
            };
            result = result.with_envelope(envelope.derive(
                EventType::known(catalog::ORDER_FULLY_ALLOCATED),
                serde_json::to_value(&allocated)
                    .map_err(|e| AgentError::Infrastructure(format!("payload serialization: {e}")))?,
                Actor::agent(Self::NAME),
            ));
        }

        Ok(result)
    }
}
