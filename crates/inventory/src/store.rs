//! State-store ports.
//!
//! The domain owns the port; `warebus-infra` provides the in-memory and
//! Postgres implementations. A `StateTx` is one ACID transaction: business
//! mutations, event-log appends, and outbox enqueues made through it commit
//! or abort together, which is what makes the outbox transactional.

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use warebus_core::{
    DomainError, ErrorCode, LocationId, LotId, OrderId, ProductId, StockLevelId, TenantId,
    VariantId, WarehouseId,
};
use warebus_events::{EventEnvelope, OutboxEntry};

use crate::location::Location;
use crate::lot::{LotBatch, LotStatus};
use crate::order::{OrderStatus, SalesOrder};
use crate::product::{AbcClass, Product, XyzClass};
use crate::reservation::Reservation;
use crate::stock::{StockDeltas, StockLevel};
use crate::thresholds::AlertLevel;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether this is a lost optimistic-concurrency race (retriable).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Domain(e) if e.code() == ErrorCode::OptimisticLockConflict)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One day of shipped demand for a product.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DemandSample {
    pub day: NaiveDate,
    pub quantity: i64,
}

/// Supplier lead-time statistics, in days.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LeadTimeStats {
    pub mean_days: f64,
    pub std_dev_days: f64,
}

/// Read side of the warehouse state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Open a transaction. Mutations go through the returned [`StateTx`] and
    /// become visible only after `commit`.
    async fn begin(&self) -> StoreResult<Box<dyn StateTx>>;

    async fn tenants(&self) -> StoreResult<Vec<TenantId>>;

    async fn warehouses(&self, tenant_id: TenantId) -> StoreResult<Vec<WarehouseId>>;

    async fn product(&self, tenant_id: TenantId, id: ProductId) -> StoreResult<Option<Product>>;

    async fn products(&self, tenant_id: TenantId) -> StoreResult<Vec<Product>>;

    async fn locations(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> StoreResult<Vec<Location>>;

    async fn stock_level(&self, id: StockLevelId) -> StoreResult<Option<StockLevel>>;

    /// All stock levels covering a product in a warehouse, any location/lot.
    async fn stock_levels_for_product(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> StoreResult<Vec<StockLevel>>;

    /// Every stock level carrying a given lot (expiry/quarantine sweeps).
    async fn stock_levels_for_lot(
        &self,
        tenant_id: TenantId,
        lot_id: LotId,
    ) -> StoreResult<Vec<StockLevel>>;

    /// The unique stock level at a (product, variant, location, lot) slot.
    async fn stock_level_at(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        location_id: LocationId,
        lot_id: Option<LotId>,
    ) -> StoreResult<Option<StockLevel>>;

    async fn lot(&self, id: LotId) -> StoreResult<Option<LotBatch>>;

    async fn lots(&self, tenant_id: TenantId) -> StoreResult<Vec<LotBatch>>;

    async fn order(&self, tenant_id: TenantId, id: OrderId) -> StoreResult<Option<SalesOrder>>;

    /// Reservations held for a reference (idempotency guard for the
    /// reservation agent).
    async fn reservations_for_reference(
        &self,
        tenant_id: TenantId,
        ref_type: &str,
        ref_id: &str,
    ) -> StoreResult<Vec<Reservation>>;

    async fn demand_history(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> StoreResult<Vec<DemandSample>>;

    async fn lead_time_stats(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> StoreResult<Option<LeadTimeStats>>;

    /// Last low-stock alert level recorded for a product in a warehouse.
    async fn last_alert_level(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> StoreResult<Option<AlertLevel>>;

    /// Whether the consumer already processed this inbound envelope
    /// (redelivery guard; see `StateTx::mark_inbox_processed`).
    async fn inbox_contains(&self, event_id: warebus_core::EventId) -> StoreResult<bool>;
}

/// Write side: one transaction.
///
/// Dropping a `StateTx` without calling `commit` aborts it; nothing written
/// through it (including outbox rows) survives.
#[async_trait]
pub trait StateTx: Send {
    async fn put_tenant(&mut self, tenant_id: TenantId) -> StoreResult<()>;

    async fn put_warehouse(
        &mut self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> StoreResult<()>;

    async fn put_product(&mut self, product: Product) -> StoreResult<()>;

    async fn put_location(&mut self, location: Location) -> StoreResult<()>;

    /// Create the stock level if the slot is empty; otherwise return the
    /// existing row unchanged. New rows carry `row_version = 1`.
    async fn upsert_stock_level(&mut self, level: StockLevel) -> StoreResult<StockLevel>;

    /// Row-versioned adjust: fails with `OPTIMISTIC_LOCK_CONFLICT`
    /// (retriable) when `expected_version` is stale, applies the deltas and
    /// bumps the version otherwise. Negative resulting on-hand without the
    /// override fails with `NEGATIVE_STOCK_BLOCKED`.
    async fn adjust_stock(
        &mut self,
        id: StockLevelId,
        deltas: StockDeltas,
        expected_version: u64,
        allow_negative: bool,
    ) -> StoreResult<StockLevel>;

    async fn put_lot(&mut self, lot: LotBatch) -> StoreResult<()>;

    async fn set_lot_status(&mut self, id: LotId, status: LotStatus) -> StoreResult<LotBatch>;

    async fn put_reservation(&mut self, reservation: Reservation) -> StoreResult<()>;

    async fn put_order(&mut self, order: SalesOrder) -> StoreResult<()>;

    async fn set_order_status(
        &mut self,
        tenant_id: TenantId,
        id: OrderId,
        status: OrderStatus,
    ) -> StoreResult<()>;

    async fn set_product_classes(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        abc: AbcClass,
        xyz: XyzClass,
    ) -> StoreResult<()>;

    async fn set_product_safety_stock(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        safety_stock: i64,
    ) -> StoreResult<()>;

    async fn add_demand_sample(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        sample: DemandSample,
    ) -> StoreResult<()>;

    async fn put_lead_time_stats(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        stats: LeadTimeStats,
    ) -> StoreResult<()>;

    /// Record (or clear, with `None`) the active low-stock alert level.
    async fn record_alert_level(
        &mut self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        level: Option<AlertLevel>,
    ) -> StoreResult<()>;

    /// Mark an inbound envelope as fully processed by the consumer.
    ///
    /// Committed in the same transaction that persists the derived
    /// envelopes, so a redelivered message is either skipped entirely or
    /// reprocessed from scratch — never half-applied.
    async fn mark_inbox_processed(&mut self, event_id: warebus_core::EventId) -> StoreResult<()>;

    /// Append to the event log. Duplicate `event_id`s fail with
    /// `IDEMPOTENCY_CONFLICT`; the log is append-only and unique on id.
    async fn append_event(&mut self, envelope: EventEnvelope) -> StoreResult<()>;

    /// Insert a `PENDING` outbox row. Commits atomically with everything
    /// else in this transaction.
    async fn enqueue_outbox(&mut self, entry: OutboxEntry) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Run `op` up to `attempts` times, retrying only on optimistic-lock
/// conflicts. Callers bound stock CAS retries at 3 attempts.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: core::future::Future<Output = StoreResult<T>>,
{
    let mut last = None;
    for _ in 0..attempts.max(1) {
        match op().await {
            Err(e) if e.is_conflict() => last = Some(e),
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| StoreError::storage("retry_on_conflict: no attempts made")))
}
