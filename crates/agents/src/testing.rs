//! In-crate test double for the state store.
//!
//! Mutations apply immediately and `commit` is a no-op; transactional
//! semantics (atomicity, outbox abort) are covered by the real in-memory
//! store's tests in `warebus-infra`. Appended events and enqueued outbox
//! entries are captured for assertions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use warebus_core::{
    DomainError, EventId, LocationId, LotId, OrderId, ProductId, StockLevelId, TenantId, VariantId,
    WarehouseId,
};
use warebus_events::{EventEnvelope, OutboxEntry};
use warebus_inventory::store::{
    DemandSample, LeadTimeStats, StateStore, StateTx, StoreError, StoreResult,
};
use warebus_inventory::{
    AlertLevel, Location, LotBatch, LotStatus, OrderStatus, Product, Reservation, SalesOrder,
    StockDeltas, StockLevel,
};

#[derive(Default)]
pub struct StubState {
    pub tenants: Vec<TenantId>,
    pub warehouses: HashMap<TenantId, Vec<WarehouseId>>,
    pub products: Vec<Product>,
    pub locations: Vec<Location>,
    pub stock_levels: Vec<StockLevel>,
    pub lots: Vec<LotBatch>,
    pub orders: Vec<SalesOrder>,
    pub reservations: Vec<Reservation>,
    pub demand: HashMap<(TenantId, ProductId), Vec<DemandSample>>,
    pub lead_times: HashMap<(TenantId, ProductId), LeadTimeStats>,
    pub alerts: HashMap<(TenantId, WarehouseId, ProductId), AlertLevel>,
    pub inbox: HashSet<EventId>,
    pub appended_events: Vec<EventEnvelope>,
    pub outbox: Vec<OutboxEntry>,
}

#[derive(Default, Clone)]
pub struct StubStore {
    state: Arc<Mutex<StubState>>,
}

impl StubStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl StateStore for StubStore {
    async fn begin(&self) -> StoreResult<Box<dyn StateTx>> {
        Ok(Box::new(StubTx {
            state: Arc::clone(&self.state),
        }))
    }

    async fn tenants(&self) -> StoreResult<Vec<TenantId>> {
        Ok(self.state().tenants.clone())
    }

    async fn warehouses(&self, tenant_id: TenantId) -> StoreResult<Vec<WarehouseId>> {
        Ok(self.state().warehouses.get(&tenant_id).cloned().unwrap_or_default())
    }

    async fn product(&self, tenant_id: TenantId, id: ProductId) -> StoreResult<Option<Product>> {
        Ok(self
            .state()
            .products
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.id == id)
            .cloned())
    }

    async fn products(&self, tenant_id: TenantId) -> StoreResult<Vec<Product>> {
        Ok(self
            .state()
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
            .state()
            .locations
            .iter()
            .filter(|l| l.tenant_id == tenant_id && l.warehouse_id == warehouse_id)
            .cloned()
            .collect())
    }

    async fn stock_level(&self, id: StockLevelId) -> StoreResult<Option<StockLevel>> {
        Ok(self.state().stock_levels.iter().find(|s| s.id == id).cloned())
    }

    async fn stock_levels_for_product(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> StoreResult<Vec<StockLevel>> {
        Ok(self
            .state()
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
            .state()
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
            .state()
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
        Ok(self.state().lots.iter().find(|l| l.id == id).cloned())
    }

    async fn lots(&self, tenant_id: TenantId) -> StoreResult<Vec<LotBatch>> {
        Ok(self
            .state()
            .lots
            .iter()
            .filter(|l| l.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn order(&self, tenant_id: TenantId, id: OrderId) -> StoreResult<Option<SalesOrder>> {
        Ok(self
            .state()
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
            .state()
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
            .state()
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
        Ok(self.state().lead_times.get(&(tenant_id, product_id)).copied())
    }

    async fn last_alert_level(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> StoreResult<Option<AlertLevel>> {
        Ok(self
            .state()
            .alerts
            .get(&(tenant_id, warehouse_id, product_id))
            .copied())
    }

    async fn inbox_contains(&self, event_id: EventId) -> StoreResult<bool> {
        Ok(self.state().inbox.contains(&event_id))
    }
}

pub struct StubTx {
    state: Arc<Mutex<StubState>>,
}

impl StubTx {
    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl StateTx for StubTx {
    async fn put_tenant(&mut self, tenant_id: TenantId) -> StoreResult<()> {
        let mut state = self.state();
        if !state.tenants.contains(&tenant_id) {
            state.tenants.push(tenant_id);
        }
        Ok(())
    }

    async fn put_warehouse(
        &mut self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> StoreResult<()> {
        self.state().warehouses.entry(tenant_id).or_default().push(warehouse_id);
        Ok(())
    }

    async fn put_product(&mut self, product: Product) -> StoreResult<()> {
        let mut state = self.state();
        state.products.retain(|p| p.id != product.id);
        state.products.push(product);
        Ok(())
    }

    async fn put_location(&mut self, location: Location) -> StoreResult<()> {
        let mut state = self.state();
        state.locations.retain(|l| l.id != location.id);
        state.locations.push(location);
        Ok(())
    }

    async fn upsert_stock_level(&mut self, level: StockLevel) -> StoreResult<StockLevel> {
        let mut state = self.state();
        if let Some(existing) = state.stock_levels.iter().find(|s| {
            s.tenant_id == level.tenant_id
                && s.warehouse_id == level.warehouse_id
                && s.product_id == level.product_id
                && s.variant_id == level.variant_id
                && s.location_id == level.location_id
                && s.lot_id == level.lot_id
        }) {
            return Ok(existing.clone());
        }
        state.stock_levels.push(level.clone());
        Ok(level)
    }

    async fn adjust_stock(
        &mut self,
        id: StockLevelId,
        deltas: StockDeltas,
        expected_version: u64,
        allow_negative: bool,
    ) -> StoreResult<StockLevel> {
        let mut state = self.state();
        let level = state
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
        let mut state = self.state();
        state.lots.retain(|l| l.id != lot.id);
        state.lots.push(lot);
        Ok(())
    }

    async fn set_lot_status(&mut self, id: LotId, status: LotStatus) -> StoreResult<LotBatch> {
        let mut state = self.state();
        let lot = state
            .lots
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::Domain(DomainError::not_found(format!("lot {id}"))))?;
        lot.status = status;
        Ok(lot.clone())
    }

    async fn put_reservation(&mut self, reservation: Reservation) -> StoreResult<()> {
        self.state().reservations.push(reservation);
        Ok(())
    }

    async fn put_order(&mut self, order: SalesOrder) -> StoreResult<()> {
        let mut state = self.state();
        state.orders.retain(|o| o.id != order.id);
        state.orders.push(order);
        Ok(())
    }

    async fn set_order_status(
        &mut self,
        tenant_id: TenantId,
        id: OrderId,
        status: OrderStatus,
    ) -> StoreResult<()> {
        let mut state = self.state();
        let order = state
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
        let mut state = self.state();
        let product = state
            .products
            .iter_mut()
            .find(|p| p.tenant_id == tenant_id && p.id == product_id)
            .ok_or_else(|| StoreError::Domain(DomainError::not_found(format!("product {product_id}"))))?;
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
        let mut state = self.state();
        let product = state
            .products
            .iter_mut()
            .find(|p| p.tenant_id == tenant_id && p.id == product_id)
            .ok_or_else(|| StoreError::Domain(DomainError::not_found(format!("product {product_id}"))))?;
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
        self.state().demand.entry((tenant_id, product_id)).or_default().push(sample);
        Ok(())
    }

    async fn put_lead_time_stats(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        stats: LeadTimeStats,
    ) -> StoreResult<()> {
        self.state().lead_times.insert((tenant_id, product_id), stats);
        Ok(())
    }

    async fn record_alert_level(
        &mut self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        level: Option<AlertLevel>,
    ) -> StoreResult<()> {
        let mut state = self.state();
        match level {
            Some(level) => {
                state.alerts.insert((tenant_id, warehouse_id, product_id), level);
            }
            None => {
                state.alerts.remove(&(tenant_id, warehouse_id, product_id));
            }
        }
        Ok(())
    }

    async fn mark_inbox_processed(&mut self, event_id: EventId) -> StoreResult<()> {
        self.state().inbox.insert(event_id);
        Ok(())
    }

    async fn append_event(&mut self, envelope: EventEnvelope) -> StoreResult<()> {
        let mut state = self.state();
        if state.appended_events.iter().any(|e| e.event_id() == envelope.event_id()) {
            return Err(StoreError::Domain(DomainError::idempotency(format!(
                "event {} already recorded",
                envelope.event_id()
            ))));
        }
        state.appended_events.push(envelope);
        Ok(())
    }

    async fn enqueue_outbox(&mut self, entry: OutboxEntry) -> StoreResult<()> {
        self.state().outbox.push(entry);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
