//! In-memory state store.
//!
//! Intended for tests and single-process development. Transactions take the
//! table mutex for their whole lifetime and mutate a working copy; `commit`
//! swaps the copy in, dropping without commit discards it. That serializes
//! writers (fine at this scale) while keeping real abort semantics — an
//! aborted command leaves no outbox row behind.
//!
//! A single-dispatcher deployment needs no row claim locking, so
//! `claim_pending` is a plain filtered read (the Postgres implementation
//! uses `FOR UPDATE SKIP LOCKED` for replicas).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use warebus_core::{
    CorrelationId, DomainError, EventId, LocationId, LotId, OrderId, ProductId, StockLevelId,
    TenantId, VariantId, WarehouseId,
};
use warebus_events::{
    EventEnvelope, EventLog, EventLogError, OutboxEntry, OutboxError, OutboxStatus, OutboxStore,
};
use warebus_inventory::store::{
    DemandSample, LeadTimeStats, StateStore, StateTx, StoreError, StoreResult,
};
use warebus_inventory::{
    AlertLevel, Location, LotBatch, LotStatus, OrderStatus, Product, Reservation, SalesOrder,
    StockDeltas, StockLevel,
};

#[derive(Default, Clone)]
struct Tables {
    tenants: Vec<TenantId>,
    warehouses: HashMap<TenantId, Vec<WarehouseId>>,
    products: Vec<Product>,
    locations: Vec<Location>,
    stock_levels: Vec<StockLevel>,
    lots: Vec<LotBatch>,
    reservations: Vec<Reservation>,
    orders: Vec<SalesOrder>,
    demand: HashMap<(TenantId, ProductId), Vec<DemandSample>>,
    lead_times: HashMap<(TenantId, ProductId), LeadTimeStats>,
    alerts: HashMap<(TenantId, WarehouseId, ProductId), AlertLevel>,
    inbox: HashSet<EventId>,
    event_log: Vec<EventEnvelope>,
    event_ids: HashSet<EventId>,
    outbox: Vec<OutboxEntry>,
}

#[derive(Default, Clone)]
pub struct InMemoryStateStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full outbox contents, any status. Operator/test visibility.
    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.tables.lock().await.outbox.clone()
    }

    /// Every envelope in the event log, in append order.
    pub async fn event_log(&self) -> Vec<EventEnvelope> {
        self.tables.lock().await.event_log.clone()
    }

    /// Make a pending row due immediately without resetting its retry
    /// budget. Test support for walking the backoff schedule.
    pub async fn force_due(&self, id: EventId) {
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.outbox.iter_mut().find(|e| e.id == id) {
            entry.scheduled_at = Utc::now();
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn begin(&self) -> StoreResult<Box<dyn StateTx>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTx { guard, working }))
    }

    async fn tenants(&self) -> StoreResult<Vec<TenantId>> {
        Ok(self.tables.lock().await.tenants.clone())
    }

    async fn warehouses(&self, tenant_id: TenantId) -> StoreResult<Vec<WarehouseId>> {
        Ok(self
            .tables
            .lock()
            .await
            .warehouses
            .get(&tenant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn product(&self, tenant_id: TenantId, id: ProductId) -> StoreResult<Option<Product>> {
        Ok(self
            .tables
            .lock()
            .await
            .products
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.id == id)
            .cloned())
    }

    async fn products(&self, tenant_id: TenantId) -> StoreResult<Vec<Product>> {
        Ok(self
            .tables
            .lock()
            .await
            .products
            .iter()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn locations(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> StoreResult<Vec<Location>> {
        Ok(self
            .tables
            .lock()
            .await
            .locations
            .iter()
            .filter(|l| l.tenant_id == tenant_id && l.warehouse_id == warehouse_id)
            .cloned()
            .collect())
    }

    async fn stock_level(&self, id: StockLevelId) -> StoreResult<Option<StockLevel>> {
        Ok(self
            .tables
            .lock()
            .await
            .stock_levels
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn stock_levels_for_product(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> StoreResult<Vec<StockLevel>> {
        Ok(self
            .tables
            .lock()
            .await
            .stock_levels
            .iter()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && s.warehouse_id == warehouse_id
                    && s.product_id == product_id
                    && (variant_id.is_none() || s.variant_id == variant_id)
            })
            .cloned()
            .collect())
    }

    async fn stock_levels_for_lot(
        &self,
        tenant_id: TenantId,
        lot_id: LotId,
    ) -> StoreResult<Vec<StockLevel>> {
        Ok(self
            .tables
            .lock()
            .await
            .stock_levels
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.lot_id == Some(lot_id))
            .cloned()
            .collect())
    }

    async fn stock_level_at(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        location_id: LocationId,
        lot_id: Option<LotId>,
    ) -> StoreResult<Option<StockLevel>> {
        Ok(self
            .tables
            .lock()
            .await
            .stock_levels
            .iter()
            .find(|s| {
                s.tenant_id == tenant_id
                    && s.warehouse_id == warehouse_id
                    && s.product_id == product_id
                    && s.variant_id == variant_id
                    && s.location_id == location_id
                    && s.lot_id == lot_id
            })
            .cloned())
    }

    async fn lot(&self, id: LotId) -> StoreResult<Option<LotBatch>> {
        Ok(self.tables.lock().await.lots.iter().find(|l| l.id == id).cloned())
    }

    async fn lots(&self, tenant_id: TenantId) -> StoreResult<Vec<LotBatch>> {
        Ok(self
            .tables
            .lock()
            .await
            .lots
            .iter()
            .filter(|l| l.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn order(&self, tenant_id: TenantId, id: OrderId) -> StoreResult<Option<SalesOrder>> {
        Ok(self
            .tables
            .lock()
            .await
            .orders
            .iter()
            .find(|o| o.tenant_id == tenant_id && o.id == id)
            .cloned())
    }

    async fn reservations_for_reference(
        &self,
        tenant_id: TenantId,
        ref_type: &str,
        ref_id: &str,
    ) -> StoreResult<Vec<Reservation>> {
        Ok(self
            .tables
            .lock()
            .await
            .reservations
            .iter()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.reference.ref_type == ref_type
                    && r.reference.ref_id == ref_id
            })
            .cloned()
            .collect())
    }

    async fn demand_history(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> StoreResult<Vec<DemandSample>> {
        Ok(self
            .tables
            .lock()
            .await
            .demand
            .get(&(tenant_id, product_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn lead_time_stats(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> StoreResult<Option<LeadTimeStats>> {
        Ok(self
            .tables
            .lock()
            .await
            .lead_times
            .get(&(tenant_id, product_id))
            .copied())
    }

    async fn last_alert_level(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> StoreResult<Option<AlertLevel>> {
        Ok(self
            .tables
            .lock()
            .await
            .alerts
            .get(&(tenant_id, warehouse_id, product_id))
            .copied())
    }

    async fn inbox_contains(&self, event_id: EventId) -> StoreResult<bool> {
        Ok(self.tables.lock().await.inbox.contains(&event_id))
    }
}

struct InMemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl StateTx for InMemoryTx {
    async fn put_tenant(&mut self, tenant_id: TenantId) -> StoreResult<()> {
        if !self.working.tenants.contains(&tenant_id) {
            self.working.tenants.push(tenant_id);
        }
        Ok(())
    }

    async fn put_warehouse(
        &mut self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> StoreResult<()> {
        let warehouses = self.working.warehouses.entry(tenant_id).or_default();
        if !warehouses.contains(&warehouse_id) {
            warehouses.push(warehouse_id);
        }
        Ok(())
    }

    async fn put_product(&mut self, product: Product) -> StoreResult<()> {
        self.working.products.retain(|p| p.id != product.id);
        self.working.products.push(product);
        Ok(())
    }

    async fn put_location(&mut self, location: Location) -> StoreResult<()> {
        self.working.locations.retain(|l| l.id != location.id);
        self.working.locations.push(location);
        Ok(())
    }

    async fn upsert_stock_level(&mut self, level: StockLevel) -> StoreResult<StockLevel> {
        if let Some(existing) = self.working.stock_levels.iter().find(|s| {
            s.tenant_id == level.tenant_id
                && s.warehouse_id == level.warehouse_id
                && s.product_id == level.product_id
                && s.variant_id == level.variant_id
                && s.location_id == level.location_id
                && s.lot_id == level.lot_id
        }) {
            return Ok(existing.clone());
        }
        self.working.stock_levels.push(level.clone());
        Ok(level)
    }

    async fn adjust_stock(
        &mut self,
        id: StockLevelId,
        deltas: StockDeltas,
        expected_version: u64,
        allow_negative: bool,
    ) -> StoreResult<StockLevel> {
        let level = self
            .working
            .stock_levels
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::Domain(DomainError::not_found(format!("stock level {id}"))))?;

        if level.row_version != expected_version {
            return Err(StoreError::Domain(DomainError::optimistic_lock(format!(
                "stock level {id}: expected version {expected_version}, found {}",
                level.row_version
            ))));
        }

        level.apply(deltas, allow_negative)?;
        Ok(level.clone())
    }

    async fn put_lot(&mut self, lot: LotBatch) -> StoreResult<()> {
        self.working.lots.retain(|l| l.id != lot.id);
        self.working.lots.push(lot);
        Ok(())
    }

    async fn set_lot_status(&mut self, id: LotId, status: LotStatus) -> StoreResult<LotBatch> {
        let lot = self
            .working
            .lots
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::Domain(DomainError::not_found(format!("lot {id}"))))?;
        lot.status = status;
        Ok(lot.clone())
    }

    async fn put_reservation(&mut self, reservation: Reservation) -> StoreResult<()> {
        self.working.reservations.push(reservation);
        Ok(())
    }

    async fn put_order(&mut self, order: SalesOrder) -> StoreResult<()> {
        self.working.orders.retain(|o| o.id != order.id);
        self.working.orders.push(order);
        Ok(())
    }

    async fn set_order_status(
        &mut self,
        tenant_id: TenantId,
        id: OrderId,
        status: OrderStatus,
    ) -> StoreResult<()> {
        let order = self
            .working
            .orders
            .iter_mut()
            .find(|o| o.tenant_id == tenant_id && o.id == id)
            .ok_or_else(|| StoreError::Domain(DomainError::not_found(format!("order {id}"))))?;
        order.status = status;
        Ok(())
    }

    async fn set_product_classes(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        abc: warebus_inventory::AbcClass,
        xyz: warebus_inventory::XyzClass,
    ) -> StoreResult<()> {
        let product = self
            .working
            .products
            .iter_mut()
            .find(|p| p.tenant_id == tenant_id && p.id == product_id)
            .ok_or_else(|| {
                StoreError::Domain(DomainError::not_found(format!("product {product_id}")))
            })?;
        product.abc_class = Some(abc);
        product.xyz_class = Some(xyz);
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn set_product_safety_stock(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        safety_stock: i64,
    ) -> StoreResult<()> {
        let product = self
            .working
            .products
            .iter_mut()
            .find(|p| p.tenant_id == tenant_id && p.id == product_id)
            .ok_or_else(|| {
                StoreError::Domain(DomainError::not_found(format!("product {product_id}")))
            })?;
        product.safety_stock = safety_stock;
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn add_demand_sample(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        sample: DemandSample,
    ) -> StoreResult<()> {
        self.working
            .demand
            .entry((tenant_id, product_id))
            .or_default()
            .push(sample);
        Ok(())
    }

    async fn put_lead_time_stats(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        stats: LeadTimeStats,
    ) -> StoreResult<()> {
        self.working.lead_times.insert((tenant_id, product_id), stats);
        Ok(())
    }

    async fn record_alert_level(
        &mut self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        level: Option<AlertLevel>,
    ) -> StoreResult<()> {
        let key = (tenant_id, warehouse_id, product_id);
        match level {
            Some(level) => {
                self.working.alerts.insert(key, level);
            }
            None => {
                self.working.alerts.remove(&key);
            }
        }
        Ok(())
    }

    async fn mark_inbox_processed(&mut self, event_id: EventId) -> StoreResult<()> {
        self.working.inbox.insert(event_id);
        Ok(())
    }

    async fn append_event(&mut self, envelope: EventEnvelope) -> StoreResult<()> {
        if !self.working.event_ids.insert(envelope.event_id()) {
            return Err(StoreError::Domain(DomainError::idempotency(format!(
                "event {} already recorded",
                envelope.event_id()
            ))));
        }
        self.working.event_log.push(envelope);
        Ok(())
    }

    async fn enqueue_outbox(&mut self, entry: OutboxEntry) -> StoreResult<()> {
        if self.working.outbox.iter().any(|e| e.id == entry.id) {
            return Err(StoreError::Domain(DomainError::idempotency(format!(
                "outbox row for event {} already exists",
                entry.id
            ))));
        }
        self.working.outbox.push(entry);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStateStore {
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let now = Utc::now();
        let tables = self.tables.lock().await;
        let mut due: Vec<OutboxEntry> = tables
            .outbox
            .iter()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn find(&self, id: EventId) -> Result<Option<OutboxEntry>, OutboxError> {
        let tables = self.tables.lock().await;
        Ok(tables.outbox.iter().find(|e| e.id == id).cloned())
    }

    async fn mark_published(&self, id: EventId) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        entry.mark_published(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: EventId, error: &str) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        entry.mark_failed(error, Utc::now());
        Ok(())
    }

    async fn requeue(&self, id: EventId) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        entry.requeue(Utc::now());
        Ok(())
    }

    async fn gc(&self, published_before: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut tables = self.tables.lock().await;
        let before = tables.outbox.len();
        tables.outbox.retain(|e| {
            !(e.status == OutboxStatus::Published
                && e.published_at.is_some_and(|at| at < published_before))
        });
        Ok((before - tables.outbox.len()) as u64)
    }

    async fn queue_size(&self) -> Result<u64, OutboxError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count() as u64)
    }
}

#[async_trait]
impl EventLog for InMemoryStateStore {
    async fn get(&self, event_id: EventId) -> Result<Option<EventEnvelope>, EventLogError> {
        Ok(self
            .tables
            .lock()
            .await
            .event_log
            .iter()
            .find(|e| e.event_id() == event_id)
            .cloned())
    }

    async fn by_correlation(
        &self,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
    ) -> Result<Vec<EventEnvelope>, EventLogError> {
        let mut events: Vec<EventEnvelope> = self
            .tables
            .lock()
            .await
            .event_log
            .iter()
            .filter(|e| e.tenant_id() == tenant_id && e.correlation_id() == correlation_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.occurred_at());
        Ok(events)
    }
}
