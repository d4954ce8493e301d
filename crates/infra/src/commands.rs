//! Command services hosting the business transactions.
//!
//! Each command mutates warehouse state, appends its envelopes to the event
//! log, and enqueues them in the outbox — one transaction. A domain
//! conflict aborts the whole transaction: no outbox row is ever written for
//! a failed command. (The HTTP layer that would call these lives outside
//! this workspace.)

use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::instrument;

use warebus_core::{
    DomainError, EventId, LocationId, LotId, OrderId, ProductId, TenantId, VariantId, WarehouseId,
};
use warebus_events::{
    catalog, Actor, EnvelopeContext, EventEnvelope, EventType, OutboxEntry, OutboxError,
    OutboxStore,
};
use warebus_inventory::payloads::{GoodsReceived, MovementRecorded, OrderPlaced, OrderPlacedLine};
use warebus_inventory::store::DemandSample;
use warebus_inventory::{
    retry_on_conflict, LotBatch, MovementType, OrderLine, SalesOrder, StateStore, StockDeltas,
    StockLevel, StoreError,
};

const CAS_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("store failure: {0}")]
    Store(String),
}

impl From<StoreError> for CommandError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(e) => CommandError::Domain(e),
            StoreError::Storage(msg) => CommandError::Store(msg),
        }
    }
}

impl From<OutboxError> for CommandError {
    fn from(value: OutboxError) -> Self {
        match value {
            OutboxError::NotFound(id) => {
                CommandError::Domain(DomainError::not_found(format!("outbox entry {id}")))
            }
            OutboxError::Storage(msg) => CommandError::Store(msg),
        }
    }
}

/// Who is issuing the command, and where.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub actor: Actor,
}

#[derive(Debug, Clone)]
pub struct GoodsReceiptCommand {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    pub lot_number: Option<String>,
    pub expiration_date: Option<NaiveDate>,
    pub quantity: i64,
}

#[derive(Debug, Clone)]
pub struct MovementCommand {
    pub movement_type: MovementType,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    pub lot_id: Option<LotId>,
    /// Positive magnitude; the movement type decides the sign.
    pub quantity: i64,
    /// Destination for transfers.
    pub to_location_id: Option<LocationId>,
    /// Record an explicit negative-stock override.
    pub allow_negative: bool,
}

pub struct CommandService {
    store: Arc<dyn StateStore>,
    outbox: Arc<dyn OutboxStore>,
}

impl CommandService {
    pub fn new(store: Arc<dyn StateStore>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self { store, outbox }
    }

    /// Receive goods into a (product, location, lot) slot.
    ///
    /// Emits `Inventory.GoodsReceived` and, caused by it,
    /// `Inventory.MovementRecorded`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, product_id = %command.product_id))]
    pub async fn record_goods_receipt(
        &self,
        ctx: &CommandContext,
        command: GoodsReceiptCommand,
    ) -> Result<EventEnvelope, CommandError> {
        if command.quantity <= 0 {
            return Err(DomainError::validation("receipt quantity must be positive").into());
        }
        if self
            .store
            .product(ctx.tenant_id, command.product_id)
            .await?
            .is_none()
        {
            return Err(DomainError::not_found(format!("product {}", command.product_id)).into());
        }

        // Reuse an existing lot for the same lot number, otherwise mint one.
        let lot = match &command.lot_number {
            None => None,
            Some(number) => {
                let existing = self
                    .store
                    .lots(ctx.tenant_id)
                    .await?
                    .into_iter()
                    .find(|l| l.product_id == command.product_id && &l.lot_number == number);
                Some(existing.unwrap_or_else(|| {
                    let mut lot = LotBatch::new(ctx.tenant_id, command.product_id, number.clone());
                    lot.expiration_date = command.expiration_date;
                    lot
                }))
            }
        };
        let lot_id = lot.as_ref().map(|l| l.id);

        let slot = self
            .store
            .stock_level_at(
                ctx.tenant_id,
                ctx.warehouse_id,
                command.product_id,
                command.variant_id,
                command.location_id,
                lot_id,
            )
            .await?;

        let envelope_ctx = EnvelopeContext::root(
            ctx.tenant_id,
            Some(ctx.warehouse_id),
            ctx.actor.clone(),
        );
        let received = EventEnvelope::record(
            EventType::known(catalog::GOODS_RECEIVED),
            serde_json::to_value(&GoodsReceived {
                product_id: command.product_id,
                variant_id: command.variant_id,
                location_id: command.location_id,
                lot_id,
                lot_number: command.lot_number.clone(),
                quantity: command.quantity,
            })
            .map_err(|e| CommandError::Store(format!("payload serialization: {e}")))?,
            &envelope_ctx,
        );

        let mut tx = self.store.begin().await?;

        if let Some(lot) = lot {
            tx.put_lot(lot).await?;
        }

        let level = match slot {
            Some(level) => level,
            None => {
                tx.upsert_stock_level(StockLevel::new(
                    ctx.tenant_id,
                    ctx.warehouse_id,
                    command.product_id,
                    command.variant_id,
                    command.location_id,
                    lot_id,
                ))
                .await?
            }
        };
        let updated = tx
            .adjust_stock(
                level.id,
                StockDeltas::on_hand(command.quantity),
                level.row_version,
                false,
            )
            .await?;

        let movement = received.derive(
            EventType::known(catalog::MOVEMENT_RECORDED),
            serde_json::to_value(&MovementRecorded {
                movement_type: MovementType::Receipt,
                product_id: command.product_id,
                variant_id: command.variant_id,
                location_id: command.location_id,
                lot_id,
                quantity: command.quantity,
                available_after: updated.available,
            })
            .map_err(|e| CommandError::Store(format!("payload serialization: {e}")))?,
            ctx.actor.clone(),
        );

        for envelope in [&received, &movement] {
            tx.append_event((*envelope).clone()).await?;
            tx.enqueue_outbox(OutboxEntry::pending((*envelope).clone(), envelope.routing_key()))
                .await?;
        }
        tx.commit().await?;

        Ok(received)
    }

    /// Record a stock movement against an existing stock level.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, product_id = %command.product_id, movement = ?command.movement_type))]
    pub async fn record_movement(
        &self,
        ctx: &CommandContext,
        command: MovementCommand,
    ) -> Result<EventEnvelope, CommandError> {
        if command.quantity <= 0 {
            return Err(DomainError::validation("movement quantity must be positive").into());
        }
        if command.movement_type == MovementType::Transfer && command.to_location_id.is_none() {
            return Err(DomainError::validation("transfer requires a destination location").into());
        }

        retry_on_conflict(CAS_ATTEMPTS, || {
            let (this, ctx) = (self, ctx);
            let command = command.clone();
            async move { this.record_movement_once(ctx, command).await }
        })
        .await
        .map_err(CommandError::from)
    }

    async fn record_movement_once(
        &self,
        ctx: &CommandContext,
        command: MovementCommand,
    ) -> Result<EventEnvelope, StoreError> {
        let level = self
            .store
            .stock_level_at(
                ctx.tenant_id,
                ctx.warehouse_id,
                command.product_id,
                command.variant_id,
                command.location_id,
                command.lot_id,
            )
            .await?
            .ok_or_else(|| {
                StoreError::Domain(DomainError::not_found(format!(
                    "no stock level for product {} at location {}",
                    command.product_id, command.location_id
                )))
            })?;

        // Product-wide availability, read before the transaction opens; the
        // adjusted row's contribution is corrected afterwards.
        let available_before: i64 = self
            .store
            .stock_levels_for_product(
                ctx.tenant_id,
                ctx.warehouse_id,
                command.product_id,
                command.variant_id,
            )
            .await?
            .iter()
            .map(|l| l.available)
            .sum();

        let deltas = match command.movement_type {
            MovementType::Receipt => StockDeltas::on_hand(command.quantity),
            MovementType::Ship | MovementType::Transfer => {
                StockDeltas::on_hand(-command.quantity)
            }
            MovementType::Adjust => StockDeltas::on_hand(command.quantity),
        };

        let mut tx = self.store.begin().await?;
        let updated = tx
            .adjust_stock(level.id, deltas, level.row_version, command.allow_negative)
            .await?;
        let mut available_after = available_before - level.available + updated.available;

        if command.movement_type == MovementType::Transfer {
            let destination = command.to_location_id.unwrap_or(command.location_id);
            let target = tx
                .upsert_stock_level(StockLevel::new(
                    ctx.tenant_id,
                    ctx.warehouse_id,
                    command.product_id,
                    command.variant_id,
                    destination,
                    command.lot_id,
                ))
                .await?;
            let target_after = tx
                .adjust_stock(
                    target.id,
                    StockDeltas::on_hand(command.quantity),
                    target.row_version,
                    false,
                )
                .await?;
            available_after += target_after.available - target.available;
        }

        if command.movement_type == MovementType::Ship {
            tx.add_demand_sample(
                ctx.tenant_id,
                command.product_id,
                DemandSample {
                    day: chrono::Utc::now().date_naive(),
                    quantity: command.quantity,
                },
            )
            .await?;
        }

        let envelope_ctx = EnvelopeContext::root(
            ctx.tenant_id,
            Some(ctx.warehouse_id),
            ctx.actor.clone(),
        );
        let movement = EventEnvelope::record(
            EventType::known(catalog::MOVEMENT_RECORDED),
            serde_json::to_value(&MovementRecorded {
                movement_type: command.movement_type,
                product_id: command.product_id,
                variant_id: command.variant_id,
                location_id: command.location_id,
                lot_id: command.lot_id,
                quantity: command.quantity,
                available_after,
            })
            .map_err(|e| StoreError::Storage(format!("payload serialization: {e}")))?,
            &envelope_ctx,
        );

        tx.append_event(movement.clone()).await?;
        tx.enqueue_outbox(OutboxEntry::pending(movement.clone(), movement.routing_key()))
            .await?;
        tx.commit().await?;

        Ok(movement)
    }

    /// Persist a sales order and emit `SalesOrder.OrderPlaced`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id))]
    pub async fn place_sales_order(
        &self,
        ctx: &CommandContext,
        lines: Vec<OrderLine>,
    ) -> Result<(OrderId, EventEnvelope), CommandError> {
        if lines.is_empty() {
            return Err(DomainError::validation("order must carry at least one line").into());
        }
        if lines.iter().any(|l| l.quantity <= 0) {
            return Err(DomainError::validation("order line quantities must be positive").into());
        }

        let order = SalesOrder::placed(ctx.tenant_id, ctx.warehouse_id, lines.clone());
        let order_id = order.id;

        let envelope_ctx = EnvelopeContext::root(
            ctx.tenant_id,
            Some(ctx.warehouse_id),
            ctx.actor.clone(),
        );
        let placed = EventEnvelope::record(
            EventType::known(catalog::ORDER_PLACED),
            serde_json::to_value(&OrderPlaced {
                order_id,
                lines: lines
                    .iter()
                    .map(|l| OrderPlacedLine {
                        line: l.line,
                        product_id: l.product_id,
                        variant_id: l.variant_id,
                        quantity: l.quantity,
                    })
                    .collect(),
            })
            .map_err(|e| CommandError::Store(format!("payload serialization: {e}")))?,
            &envelope_ctx,
        );

        let mut tx = self.store.begin().await?;
        tx.put_order(order).await?;
        tx.append_event(placed.clone()).await?;
        tx.enqueue_outbox(OutboxEntry::pending(placed.clone(), placed.routing_key()))
            .await?;
        tx.commit().await?;

        Ok((order_id, placed))
    }

    /// Operator action: reset a (typically `FAILED`) outbox row's retry
    /// budget and schedule so the dispatcher picks it up again.
    ///
    /// Tenant isolation: a row belonging to another tenant is reported as
    /// not found, never touched.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, outbox_id = %outbox_id))]
    pub async fn requeue_outbox_entry(
        &self,
        tenant_id: TenantId,
        outbox_id: EventId,
    ) -> Result<(), CommandError> {
        let entry = self
            .outbox
            .find(outbox_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("outbox entry {outbox_id}")))?;
        if entry.tenant_id != tenant_id {
            return Err(DomainError::not_found(format!("outbox entry {outbox_id}")).into());
        }

        self.outbox.requeue(outbox_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::InMemoryStateStore;
    use warebus_inventory::Product;

    struct World {
        service: CommandService,
        store: Arc<InMemoryStateStore>,
        ctx: CommandContext,
        product: ProductId,
        location: LocationId,
    }

    async fn world() -> World {
        let store = Arc::new(InMemoryStateStore::new());
        let tenant = TenantId::new();
        let warehouse = WarehouseId::new();
        let product = Product::new(tenant, "SKU-1", "Widget");
        let product_id = product.id;

        let mut tx = store.begin().await.unwrap();
        tx.put_tenant(tenant).await.unwrap();
        tx.put_warehouse(tenant, warehouse).await.unwrap();
        tx.put_product(product).await.unwrap();
        tx.commit().await.unwrap();

        World {
            service: CommandService::new(store.clone(), store.clone()),
            store,
            ctx: CommandContext {
                tenant_id: tenant,
                warehouse_id: warehouse,
                actor: Actor::user("u-1", vec!["operator".into()]),
            },
            product: product_id,
            location: LocationId::new(),
        }
    }

    fn receipt(w: &World, quantity: i64) -> GoodsReceiptCommand {
        GoodsReceiptCommand {
            product_id: w.product,
            variant_id: None,
            location_id: w.location,
            lot_number: Some("L-100".into()),
            expiration_date: NaiveDate::from_ymd_opt(2030, 1, 1),
            quantity,
        }
    }

    #[tokio::test]
    async fn receipt_creates_stock_lot_and_chained_envelopes() {
        let w = world().await;
        let received = w.service.record_goods_receipt(&w.ctx, receipt(&w, 10)).await.unwrap();

        let log = w.store.event_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event_type().as_str(), catalog::GOODS_RECEIVED);
        assert_eq!(log[1].event_type().as_str(), catalog::MOVEMENT_RECORDED);
        // The movement is caused by the receipt, same interaction.
        assert_eq!(log[1].causation_id(), Some(received.event_id()));
        assert_eq!(log[1].correlation_id(), received.correlation_id());

        let outbox = w.store.outbox_entries().await;
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].routing_key, "inventory.goods.received");

        let levels = w
            .store
            .stock_levels_for_product(w.ctx.tenant_id, w.ctx.warehouse_id, w.product, None)
            .await
            .unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].on_hand, 10);
        assert_eq!(levels[0].available, 10);
        assert_eq!(levels[0].row_version, 2);
        assert!(levels[0].lot_id.is_some());
    }

    #[tokio::test]
    async fn second_receipt_into_same_slot_reuses_the_row_and_lot() {
        let w = world().await;
        w.service.record_goods_receipt(&w.ctx, receipt(&w, 10)).await.unwrap();
        w.service.record_goods_receipt(&w.ctx, receipt(&w, 5)).await.unwrap();

        let levels = w
            .store
            .stock_levels_for_product(w.ctx.tenant_id, w.ctx.warehouse_id, w.product, None)
            .await
            .unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].on_hand, 15);

        let lots = w.store.lots(w.ctx.tenant_id).await.unwrap();
        assert_eq!(lots.len(), 1);
    }

    #[tokio::test]
    async fn failed_command_leaves_no_trace() {
        let w = world().await;
        let err = w.service.record_goods_receipt(&w.ctx, receipt(&w, 0)).await.unwrap_err();
        assert!(matches!(err, CommandError::Domain(_)));

        let missing_product = GoodsReceiptCommand {
            product_id: ProductId::new(),
            ..receipt(&w, 5)
        };
        let err = w.service.record_goods_receipt(&w.ctx, missing_product).await.unwrap_err();
        assert!(matches!(err, CommandError::Domain(_)));

        assert!(w.store.event_log().await.is_empty());
        assert!(w.store.outbox_entries().await.is_empty());
    }

    #[tokio::test]
    async fn ship_movement_decrements_and_records_demand() {
        let w = world().await;
        w.service.record_goods_receipt(&w.ctx, receipt(&w, 10)).await.unwrap();
        let lot_id = w.store.lots(w.ctx.tenant_id).await.unwrap()[0].id;

        let movement = w
            .service
            .record_movement(
                &w.ctx,
                MovementCommand {
                    movement_type: MovementType::Ship,
                    product_id: w.product,
                    variant_id: None,
                    location_id: w.location,
                    lot_id: Some(lot_id),
                    quantity: 4,
                    to_location_id: None,
                    allow_negative: false,
                },
            )
            .await
            .unwrap();

        let payload: MovementRecorded =
            serde_json::from_value(movement.payload().clone()).unwrap();
        assert_eq!(payload.available_after, 6);

        let demand = w.store.demand_history(w.ctx.tenant_id, w.product).await.unwrap();
        assert_eq!(demand.len(), 1);
        assert_eq!(demand[0].quantity, 4);
    }

    #[tokio::test]
    async fn overdraw_without_override_is_blocked() {
        let w = world().await;
        w.service.record_goods_receipt(&w.ctx, receipt(&w, 3)).await.unwrap();
        let lot_id = w.store.lots(w.ctx.tenant_id).await.unwrap()[0].id;
        let events_before = w.store.event_log().await.len();

        let err = w
            .service
            .record_movement(
                &w.ctx,
                MovementCommand {
                    movement_type: MovementType::Ship,
                    product_id: w.product,
                    variant_id: None,
                    location_id: w.location,
                    lot_id: Some(lot_id),
                    quantity: 5,
                    to_location_id: None,
                    allow_negative: false,
                },
            )
            .await
            .unwrap_err();

        match err {
            CommandError::Domain(e) => {
                assert_eq!(e.code(), warebus_core::ErrorCode::NegativeStockBlocked)
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(w.store.event_log().await.len(), events_before);
    }

    #[tokio::test]
    async fn transfer_moves_stock_between_locations() {
        let w = world().await;
        w.service.record_goods_receipt(&w.ctx, receipt(&w, 10)).await.unwrap();
        let lot_id = w.store.lots(w.ctx.tenant_id).await.unwrap()[0].id;
        let destination = LocationId::new();

        w.service
            .record_movement(
                &w.ctx,
                MovementCommand {
                    movement_type: MovementType::Transfer,
                    product_id: w.product,
                    variant_id: None,
                    location_id: w.location,
                    lot_id: Some(lot_id),
                    quantity: 4,
                    to_location_id: Some(destination),
                    allow_negative: false,
                },
            )
            .await
            .unwrap();

        let levels = w
            .store
            .stock_levels_for_product(w.ctx.tenant_id, w.ctx.warehouse_id, w.product, None)
            .await
            .unwrap();
        assert_eq!(levels.len(), 2);
        let source = levels.iter().find(|l| l.location_id == w.location).unwrap();
        let target = levels.iter().find(|l| l.location_id == destination).unwrap();
        assert_eq!(source.on_hand, 6);
        assert_eq!(target.on_hand, 4);
    }

    #[tokio::test]
    async fn operator_requeue_resets_a_failed_row() {
        let w = world().await;
        w.service.record_goods_receipt(&w.ctx, receipt(&w, 10)).await.unwrap();
        let entry_id = w.store.outbox_entries().await[0].id;

        // Walk the row to terminal FAILED.
        for _ in 0..warebus_events::DEFAULT_MAX_RETRIES {
            w.store.mark_failed(entry_id, "broker down").await.unwrap();
        }
        assert_eq!(
            w.store.outbox_entries().await[0].status,
            warebus_events::OutboxStatus::Failed
        );

        w.service.requeue_outbox_entry(w.ctx.tenant_id, entry_id).await.unwrap();

        let entry = w
            .store
            .outbox_entries()
            .await
            .into_iter()
            .find(|e| e.id == entry_id)
            .unwrap();
        assert_eq!(entry.status, warebus_events::OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.last_error.is_none());
        assert!(entry.scheduled_at <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn requeue_rejects_foreign_tenants_and_unknown_rows() {
        let w = world().await;
        w.service.record_goods_receipt(&w.ctx, receipt(&w, 10)).await.unwrap();
        let entry_id = w.store.outbox_entries().await[0].id;
        w.store.mark_failed(entry_id, "broker down").await.unwrap();

        let err = w
            .service
            .requeue_outbox_entry(TenantId::new(), entry_id)
            .await
            .unwrap_err();
        match err {
            CommandError::Domain(e) => assert_eq!(e.code(), warebus_core::ErrorCode::NotFound),
            other => panic!("unexpected error {other:?}"),
        }
        // The foreign-tenant attempt changed nothing.
        assert_eq!(w.store.outbox_entries().await[0].retry_count, 1);

        let err = w
            .service
            .requeue_outbox_entry(w.ctx.tenant_id, warebus_core::EventId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Domain(_)));
    }

    #[tokio::test]
    async fn order_placement_persists_and_emits() {
        let w = world().await;
        let (order_id, placed) = w
            .service
            .place_sales_order(
                &w.ctx,
                vec![OrderLine {
                    line: 1,
                    product_id: w.product,
                    variant_id: None,
                    quantity: 7,
                }],
            )
            .await
            .unwrap();

        assert_eq!(placed.event_type().as_str(), catalog::ORDER_PLACED);
        assert_eq!(placed.routing_key(), "sales.order.order.placed");
        let order = w.store.order(w.ctx.tenant_id, order_id).await.unwrap().unwrap();
        assert_eq!(order.lines.len(), 1);

        let empty = w.service.place_sales_order(&w.ctx, vec![]).await;
        assert!(empty.is_err());
    }
}
