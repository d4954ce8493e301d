//! Postgres-backed state store.
//!
//! Entities persist as JSONB documents alongside the key columns queries
//! filter on; `stock_levels.row_version` is a real column so the optimistic
//! CAS runs as a guarded `UPDATE`. Outbox claims use `FOR UPDATE SKIP
//! LOCKED` so dispatcher replicas never contend on the same row.
//!
//! ## Schema (migrations live with the deployment)
//!
//! | table | key columns | payload |
//! |---|---|---|
//! | `tenants` | `tenant_id` | — |
//! | `warehouses` | `tenant_id, warehouse_id` | — |
//! | `products` | `id, tenant_id` | `data JSONB` |
//! | `locations` | `id, tenant_id, warehouse_id` | `data JSONB` |
//! | `stock_levels` | `id, tenant_id, warehouse_id, product_id, variant_id, location_id, lot_id, row_version` | `data JSONB` |
//! | `lots` | `id, tenant_id` | `data JSONB` |
//! | `reservations` | `id, tenant_id, ref_type, ref_id` | `data JSONB` |
//! | `sales_orders` | `id, tenant_id` | `data JSONB` |
//! | `demand_history` | `tenant_id, product_id, day` | `quantity BIGINT` |
//! | `lead_time_stats` | `tenant_id, product_id` | `mean_days, std_dev_days` |
//! | `stock_alerts` | `tenant_id, warehouse_id, product_id` | `level TEXT` |
//! | `consumer_inbox` | `event_id` | `processed_at` |
//! | `event_log` | `event_id` (unique) | `tenant_id, correlation_id, occurred_at, envelope JSONB` |
//! | `outbox` | `id` (= event_id, unique) | status machine columns + `envelope JSONB` |
//!
//! ## Error mapping
//!
//! Unique violations (`23505`) on `event_log`/`outbox` become
//! `IDEMPOTENCY_CONFLICT`; a zero-row CAS `UPDATE` becomes
//! `OPTIMISTIC_LOCK_CONFLICT`; everything else is a storage error
//! (retriable at the consumer level).

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

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

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_error(op: &str, e: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("{op}: {e}"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn decode_json<T: serde::de::DeserializeOwned>(op: &str, row: &PgRow, column: &str) -> StoreResult<T> {
    let value: serde_json::Value = row
        .try_get(column)
        .map_err(|e| storage_error(op, e))?;
    serde_json::from_value(value).map_err(|e| StoreError::Storage(format!("{op}: decode: {e}")))
}

fn decode_envelope(op: &str, row: &PgRow) -> StoreResult<EventEnvelope> {
    decode_json(op, row, "envelope")
}

fn outbox_entry_from_row(op: &str, row: &PgRow) -> Result<OutboxEntry, OutboxError> {
    let to_outbox = |e: StoreError| OutboxError::Storage(e.to_string());

    let envelope = decode_envelope(op, row).map_err(to_outbox)?;
    let status: String = row.try_get("status").map_err(|e| OutboxError::Storage(e.to_string()))?;

    Ok(OutboxEntry {
        id: EventId::from_uuid(row.try_get("id").map_err(|e| OutboxError::Storage(e.to_string()))?),
        tenant_id: envelope.tenant_id(),
        routing_key: row
            .try_get("routing_key")
            .map_err(|e| OutboxError::Storage(e.to_string()))?,
        envelope,
        status: OutboxStatus::from_str(&status)?,
        retry_count: row
            .try_get::<i32, _>("retry_count")
            .map_err(|e| OutboxError::Storage(e.to_string()))? as u32,
        max_retries: row
            .try_get::<i32, _>("max_retries")
            .map_err(|e| OutboxError::Storage(e.to_string()))? as u32,
        last_error: row
            .try_get("last_error")
            .map_err(|e| OutboxError::Storage(e.to_string()))?,
        scheduled_at: row
            .try_get("scheduled_at")
            .map_err(|e| OutboxError::Storage(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| OutboxError::Storage(e.to_string()))?,
        published_at: row
            .try_get("published_at")
            .map_err(|e| OutboxError::Storage(e.to_string()))?,
    })
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn begin(&self) -> StoreResult<Box<dyn StateTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("begin", e))?;
        Ok(Box::new(PgStateTx { tx }))
    }

    #[instrument(skip(self), err)]
    async fn tenants(&self) -> StoreResult<Vec<TenantId>> {
        let rows = sqlx::query("SELECT tenant_id FROM tenants ORDER BY tenant_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("tenants", e))?;
        rows.iter()
            .map(|row| {
                Ok(TenantId::from_uuid(
                    row.try_get("tenant_id").map_err(|e| storage_error("tenants", e))?,
                ))
            })
            .collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn warehouses(&self, tenant_id: TenantId) -> StoreResult<Vec<WarehouseId>> {
        let rows = sqlx::query(
            "SELECT warehouse_id FROM warehouses WHERE tenant_id = $1 ORDER BY warehouse_id",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("warehouses", e))?;
        rows.iter()
            .map(|row| {
                Ok(WarehouseId::from_uuid(
                    row.try_get("warehouse_id")
                        .map_err(|e| storage_error("warehouses", e))?,
                ))
            })
            .collect()
    }

    async fn product(&self, tenant_id: TenantId, id: ProductId) -> StoreResult<Option<Product>> {
        let row = sqlx::query("SELECT data FROM products WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("product", e))?;
        row.map(|row| decode_json("product", &row, "data")).transpose()
    }

    async fn products(&self, tenant_id: TenantId) -> StoreResult<Vec<Product>> {
        let rows = sqlx::query("SELECT data FROM products WHERE tenant_id = $1 ORDER BY id")
            .bind(tenant_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("products", e))?;
        rows.iter().map(|row| decode_json("products", row, "data")).collect()
    }

    async fn locations(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> StoreResult<Vec<Location>> {
        let rows = sqlx::query(
            "SELECT data FROM locations WHERE tenant_id = $1 AND warehouse_id = $2 ORDER BY id",
        )
        .bind(tenant_id.as_uuid())
        .bind(warehouse_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("locations", e))?;
        rows.iter().map(|row| decode_json("locations", row, "data")).collect()
    }

    async fn stock_level(&self, id: StockLevelId) -> StoreResult<Option<StockLevel>> {
        let row = sqlx::query("SELECT data FROM stock_levels WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("stock_level", e))?;
        row.map(|row| decode_json("stock_level", &row, "data")).transpose()
    }

    async fn stock_levels_for_product(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> StoreResult<Vec<StockLevel>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM stock_levels
            WHERE tenant_id = $1 AND warehouse_id = $2 AND product_id = $3
              AND ($4::uuid IS NULL OR variant_id = $4)
            ORDER BY id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(warehouse_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(variant_id.map(|v| *v.as_uuid()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("stock_levels_for_product", e))?;
        rows.iter()
            .map(|row| decode_json("stock_levels_for_product", row, "data"))
            .collect()
    }

    async fn stock_levels_for_lot(
        &self,
        tenant_id: TenantId,
        lot_id: LotId,
    ) -> StoreResult<Vec<StockLevel>> {
        let rows = sqlx::query(
            "SELECT data FROM stock_levels WHERE tenant_id = $1 AND lot_id = $2 ORDER BY id",
        )
        .bind(tenant_id.as_uuid())
        .bind(lot_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("stock_levels_for_lot", e))?;
        rows.iter()
            .map(|row| decode_json("stock_levels_for_lot", row, "data"))
            .collect()
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
        let row = sqlx::query(
            r#"
            SELECT data FROM stock_levels
            WHERE tenant_id = $1 AND warehouse_id = $2 AND product_id = $3
              AND variant_id IS NOT DISTINCT FROM $4
              AND location_id = $5
              AND lot_id IS NOT DISTINCT FROM $6
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(warehouse_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(variant_id.map(|v| *v.as_uuid()))
        .bind(location_id.as_uuid())
        .bind(lot_id.map(|l| *l.as_uuid()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("stock_level_at", e))?;
        row.map(|row| decode_json("stock_level_at", &row, "data")).transpose()
    }

    async fn lot(&self, id: LotId) -> StoreResult<Option<LotBatch>> {
        let row = sqlx::query("SELECT data FROM lots WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("lot", e))?;
        row.map(|row| decode_json("lot", &row, "data")).transpose()
    }

    async fn lots(&self, tenant_id: TenantId) -> StoreResult<Vec<LotBatch>> {
        let rows = sqlx::query("SELECT data FROM lots WHERE tenant_id = $1 ORDER BY id")
            .bind(tenant_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("lots", e))?;
        rows.iter().map(|row| decode_json("lots", row, "data")).collect()
    }

    async fn order(&self, tenant_id: TenantId, id: OrderId) -> StoreResult<Option<SalesOrder>> {
        let row = sqlx::query("SELECT data FROM sales_orders WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("order", e))?;
        row.map(|row| decode_json("order", &row, "data")).transpose()
    }

    async fn reservations_for_reference(
        &self,
        tenant_id: TenantId,
        ref_type: &str,
        ref_id: &str,
    ) -> StoreResult<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM reservations
            WHERE tenant_id = $1 AND ref_type = $2 AND ref_id = $3
            ORDER BY id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(ref_type)
        .bind(ref_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("reservations_for_reference", e))?;
        rows.iter()
            .map(|row| decode_json("reservations_for_reference", row, "data"))
            .collect()
    }

    async fn demand_history(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> StoreResult<Vec<DemandSample>> {
        let rows = sqlx::query(
            r#"
            SELECT day, quantity FROM demand_history
            WHERE tenant_id = $1 AND product_id = $2
            ORDER BY day
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("demand_history", e))?;
        rows.iter()
            .map(|row| {
                Ok(DemandSample {
                    day: row.try_get("day").map_err(|e| storage_error("demand_history", e))?,
                    quantity: row
                        .try_get("quantity")
                        .map_err(|e| storage_error("demand_history", e))?,
                })
            })
            .collect()
    }

    async fn lead_time_stats(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
    ) -> StoreResult<Option<LeadTimeStats>> {
        let row = sqlx::query(
            "SELECT mean_days, std_dev_days FROM lead_time_stats WHERE tenant_id = $1 AND product_id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("lead_time_stats", e))?;
        row.map(|row| {
            Ok(LeadTimeStats {
                mean_days: row
                    .try_get("mean_days")
                    .map_err(|e| storage_error("lead_time_stats", e))?,
                std_dev_days: row
                    .try_get("std_dev_days")
                    .map_err(|e| storage_error("lead_time_stats", e))?,
            })
        })
        .transpose()
    }

    async fn last_alert_level(
        &self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> StoreResult<Option<AlertLevel>> {
        let row = sqlx::query(
            r#"
            SELECT level FROM stock_alerts
            WHERE tenant_id = $1 AND warehouse_id = $2 AND product_id = $3
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(warehouse_id.as_uuid())
        .bind(product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("last_alert_level", e))?;
        row.map(|row| {
            let level: String = row
                .try_get("level")
                .map_err(|e| storage_error("last_alert_level", e))?;
            serde_json::from_value(serde_json::Value::String(level))
                .map_err(|e| StoreError::Storage(format!("last_alert_level: decode: {e}")))
        })
        .transpose()
    }

    async fn inbox_contains(&self, event_id: EventId) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM consumer_inbox WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("inbox_contains", e))?;
        Ok(row.is_some())
    }
}

type PgQuery = sqlx::query::Query<'static, Postgres, sqlx::postgres::PgArguments>;

struct PgStateTx {
    tx: Transaction<'static, Postgres>,
}

impl PgStateTx {
    async fn upsert_document(
        &mut self,
        op: &'static str,
        sql: &'static str,
        binds: impl FnOnce(PgQuery) -> PgQuery,
    ) -> StoreResult<()> {
        let query = binds(sqlx::query(sql));
        query
            .execute(&mut *self.tx)
            .await
            .map_err(|e| storage_error(op, e))?;
        Ok(())
    }

    async fn fetch_stock_level(&mut self, id: StockLevelId) -> StoreResult<Option<StockLevel>> {
        let row = sqlx::query("SELECT data FROM stock_levels WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| storage_error("adjust_stock", e))?;
        row.map(|row| decode_json("adjust_stock", &row, "data")).transpose()
    }
}

#[async_trait]
impl StateTx for PgStateTx {
    async fn put_tenant(&mut self, tenant_id: TenantId) -> StoreResult<()> {
        sqlx::query("INSERT INTO tenants (tenant_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(tenant_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| storage_error("put_tenant", e))?;
        Ok(())
    }

    async fn put_warehouse(
        &mut self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO warehouses (tenant_id, warehouse_id)
            VALUES ($1, $2) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(warehouse_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("put_warehouse", e))?;
        Ok(())
    }

    async fn put_product(&mut self, product: Product) -> StoreResult<()> {
        let data = serde_json::to_value(&product)
            .map_err(|e| StoreError::Storage(format!("put_product: encode: {e}")))?;
        self.upsert_document(
            "put_product",
            r#"
            INSERT INTO products (id, tenant_id, data) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            "#,
            move |q| q.bind(*product.id.as_uuid()).bind(*product.tenant_id.as_uuid()).bind(data),
        )
        .await
    }

    async fn put_location(&mut self, location: Location) -> StoreResult<()> {
        let data = serde_json::to_value(&location)
            .map_err(|e| StoreError::Storage(format!("put_location: encode: {e}")))?;
        self.upsert_document(
            "put_location",
            r#"
            INSERT INTO locations (id, tenant_id, warehouse_id, data) VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            "#,
            move |q| {
                q.bind(*location.id.as_uuid())
                    .bind(*location.tenant_id.as_uuid())
                    .bind(*location.warehouse_id.as_uuid())
                    .bind(data)
            },
        )
        .await
    }

    async fn upsert_stock_level(&mut self, level: StockLevel) -> StoreResult<StockLevel> {
        let existing = sqlx::query(
            r#"
            SELECT data FROM stock_levels
            WHERE tenant_id = $1 AND warehouse_id = $2 AND product_id = $3
              AND variant_id IS NOT DISTINCT FROM $4
              AND location_id = $5
              AND lot_id IS NOT DISTINCT FROM $6
            FOR UPDATE
            "#,
        )
        .bind(level.tenant_id.as_uuid())
        .bind(level.warehouse_id.as_uuid())
        .bind(level.product_id.as_uuid())
        .bind(level.variant_id.map(|v| *v.as_uuid()))
        .bind(level.location_id.as_uuid())
        .bind(level.lot_id.map(|l| *l.as_uuid()))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| storage_error("upsert_stock_level", e))?;

        if let Some(row) = existing {
            return decode_json("upsert_stock_level", &row, "data");
        }

        let data = serde_json::to_value(&level)
            .map_err(|e| StoreError::Storage(format!("upsert_stock_level: encode: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO stock_levels
                (id, tenant_id, warehouse_id, product_id, variant_id, location_id, lot_id,
                 row_version, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(level.id.as_uuid())
        .bind(level.tenant_id.as_uuid())
        .bind(level.warehouse_id.as_uuid())
        .bind(level.product_id.as_uuid())
        .bind(level.variant_id.map(|v| *v.as_uuid()))
        .bind(level.location_id.as_uuid())
        .bind(level.lot_id.map(|l| *l.as_uuid()))
        .bind(level.row_version as i64)
        .bind(data)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("upsert_stock_level", e))?;

        Ok(level)
    }

    async fn adjust_stock(
        &mut self,
        id: StockLevelId,
        deltas: StockDeltas,
        expected_version: u64,
        allow_negative: bool,
    ) -> StoreResult<StockLevel> {
        let mut level = self
            .fetch_stock_level(id)
            .await?
            .ok_or_else(|| StoreError::Domain(DomainError::not_found(format!("stock level {id}"))))?;

        if level.row_version != expected_version {
            return Err(StoreError::Domain(DomainError::optimistic_lock(format!(
                "stock level {id}: expected version {expected_version}, found {}",
                level.row_version
            ))));
        }

        level.apply(deltas, allow_negative)?;

        let data = serde_json::to_value(&level)
            .map_err(|e| StoreError::Storage(format!("adjust_stock: encode: {e}")))?;
        let updated = sqlx::query(
            r#"
            UPDATE stock_levels SET data = $2, row_version = $3
            WHERE id = $1 AND row_version = $4
            "#,
        )
        .bind(id.as_uuid())
        .bind(data)
        .bind(level.row_version as i64)
        .bind(expected_version as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("adjust_stock", e))?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Domain(DomainError::optimistic_lock(format!(
                "stock level {id}: lost the version race at {expected_version}"
            ))));
        }

        Ok(level)
    }

    async fn put_lot(&mut self, lot: LotBatch) -> StoreResult<()> {
        let data = serde_json::to_value(&lot)
            .map_err(|e| StoreError::Storage(format!("put_lot: encode: {e}")))?;
        self.upsert_document(
            "put_lot",
            r#"
            INSERT INTO lots (id, tenant_id, data) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            "#,
            move |q| q.bind(*lot.id.as_uuid()).bind(*lot.tenant_id.as_uuid()).bind(data),
        )
        .await
    }

    async fn set_lot_status(&mut self, id: LotId, status: LotStatus) -> StoreResult<LotBatch> {
        let row = sqlx::query("SELECT data FROM lots WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| storage_error("set_lot_status", e))?
            .ok_or_else(|| StoreError::Domain(DomainError::not_found(format!("lot {id}"))))?;
        let mut lot: LotBatch = decode_json("set_lot_status", &row, "data")?;
        lot.status = status;

        let data = serde_json::to_value(&lot)
            .map_err(|e| StoreError::Storage(format!("set_lot_status: encode: {e}")))?;
        sqlx::query("UPDATE lots SET data = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(data)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| storage_error("set_lot_status", e))?;
        Ok(lot)
    }

    async fn put_reservation(&mut self, reservation: Reservation) -> StoreResult<()> {
        let data = serde_json::to_value(&reservation)
            .map_err(|e| StoreError::Storage(format!("put_reservation: encode: {e}")))?;
        self.upsert_document(
            "put_reservation",
            r#"
            INSERT INTO reservations (id, tenant_id, ref_type, ref_id, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            "#,
            move |q| {
                q.bind(*reservation.id.as_uuid())
                    .bind(*reservation.tenant_id.as_uuid())
                    .bind(reservation.reference.ref_type.clone())
                    .bind(reservation.reference.ref_id.clone())
                    .bind(data)
            },
        )
        .await
    }

    async fn put_order(&mut self, order: SalesOrder) -> StoreResult<()> {
        let data = serde_json::to_value(&order)
            .map_err(|e| StoreError::Storage(format!("put_order: encode: {e}")))?;
        self.upsert_document(
            "put_order",
            r#"
            INSERT INTO sales_orders (id, tenant_id, data) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            "#,
            move |q| q.bind(*order.id.as_uuid()).bind(*order.tenant_id.as_uuid()).bind(data),
        )
        .await
    }

    async fn set_order_status(
        &mut self,
        tenant_id: TenantId,
        id: OrderId,
        status: OrderStatus,
    ) -> StoreResult<()> {
        let status_json = serde_json::to_value(status)
            .map_err(|e| StoreError::Storage(format!("set_order_status: encode: {e}")))?;
        let updated = sqlx::query(
            r#"
            UPDATE sales_orders SET data = jsonb_set(data, '{status}', $3)
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(status_json)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("set_order_status", e))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Domain(DomainError::not_found(format!("order {id}"))));
        }
        Ok(())
    }

    async fn set_product_classes(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        abc: warebus_inventory::AbcClass,
        xyz: warebus_inventory::XyzClass,
    ) -> StoreResult<()> {
        let classes = serde_json::json!({"abc_class": abc, "xyz_class": xyz});
        let updated = sqlx::query(
            r#"
            UPDATE products SET data = data || $3
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(classes)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("set_product_classes", e))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Domain(DomainError::not_found(format!(
                "product {product_id}"
            ))));
        }
        Ok(())
    }

    async fn set_product_safety_stock(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        safety_stock: i64,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE products SET data = jsonb_set(data, '{safety_stock}', to_jsonb($3::bigint))
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(safety_stock)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("set_product_safety_stock", e))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Domain(DomainError::not_found(format!(
                "product {product_id}"
            ))));
        }
        Ok(())
    }

    async fn add_demand_sample(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        sample: DemandSample,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO demand_history (tenant_id, product_id, day, quantity)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, product_id, day)
            DO UPDATE SET quantity = demand_history.quantity + EXCLUDED.quantity
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(sample.day)
        .bind(sample.quantity)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("add_demand_sample", e))?;
        Ok(())
    }

    async fn put_lead_time_stats(
        &mut self,
        tenant_id: TenantId,
        product_id: ProductId,
        stats: LeadTimeStats,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lead_time_stats (tenant_id, product_id, mean_days, std_dev_days)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, product_id)
            DO UPDATE SET mean_days = EXCLUDED.mean_days, std_dev_days = EXCLUDED.std_dev_days
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(stats.mean_days)
        .bind(stats.std_dev_days)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("put_lead_time_stats", e))?;
        Ok(())
    }

    async fn record_alert_level(
        &mut self,
        tenant_id: TenantId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        level: Option<AlertLevel>,
    ) -> StoreResult<()> {
        match level {
            Some(level) => {
                let level_str = serde_json::to_value(level)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| StoreError::Storage("record_alert_level: encode".into()))?;
                sqlx::query(
                    r#"
                    INSERT INTO stock_alerts (tenant_id, warehouse_id, product_id, level)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (tenant_id, warehouse_id, product_id)
                    DO UPDATE SET level = EXCLUDED.level
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(warehouse_id.as_uuid())
                .bind(product_id.as_uuid())
                .bind(level_str)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| storage_error("record_alert_level", e))?;
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM stock_alerts
                    WHERE tenant_id = $1 AND warehouse_id = $2 AND product_id = $3
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(warehouse_id.as_uuid())
                .bind(product_id.as_uuid())
                .execute(&mut *self.tx)
                .await
                .map_err(|e| storage_error("record_alert_level", e))?;
            }
        }
        Ok(())
    }

    async fn mark_inbox_processed(&mut self, event_id: EventId) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO consumer_inbox (event_id, processed_at)
            VALUES ($1, NOW()) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(event_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("mark_inbox_processed", e))?;
        Ok(())
    }

    async fn append_event(&mut self, envelope: EventEnvelope) -> StoreResult<()> {
        let body = serde_json::to_value(&envelope)
            .map_err(|e| StoreError::Storage(format!("append_event: encode: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO event_log (event_id, tenant_id, correlation_id, occurred_at, envelope)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(envelope.event_id().as_uuid())
        .bind(envelope.tenant_id().as_uuid())
        .bind(envelope.correlation_id().as_uuid())
        .bind(envelope.occurred_at())
        .bind(body)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Domain(DomainError::idempotency(format!(
                    "event {} already recorded",
                    envelope.event_id()
                )))
            } else {
                storage_error("append_event", e)
            }
        })?;
        Ok(())
    }

    async fn enqueue_outbox(&mut self, entry: OutboxEntry) -> StoreResult<()> {
        let body = serde_json::to_value(&entry.envelope)
            .map_err(|e| StoreError::Storage(format!("enqueue_outbox: encode: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO outbox
                (id, tenant_id, routing_key, envelope, status, retry_count, max_retries,
                 last_error, scheduled_at, created_at, published_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.tenant_id.as_uuid())
        .bind(&entry.routing_key)
        .bind(body)
        .bind(entry.status.as_str())
        .bind(entry.retry_count as i32)
        .bind(entry.max_retries as i32)
        .bind(&entry.last_error)
        .bind(entry.scheduled_at)
        .bind(entry.created_at)
        .bind(entry.published_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Domain(DomainError::idempotency(format!(
                    "outbox row for event {} already exists",
                    entry.id
                )))
            } else {
                storage_error("enqueue_outbox", e)
            }
        })?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(|e| storage_error("commit", e))
    }
}

#[async_trait]
impl OutboxStore for PostgresStateStore {
    /// Claims due rows with `FOR UPDATE SKIP LOCKED`: concurrent dispatcher
    /// replicas each see a disjoint batch.
    #[instrument(skip(self), err)]
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT id, routing_key, envelope, status, retry_count, max_retries,
                   last_error, scheduled_at, created_at, published_at
            FROM outbox
            WHERE status = 'PENDING' AND scheduled_at <= NOW()
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(format!("claim_pending: {e}")))?;

        rows.iter().map(|row| outbox_entry_from_row("claim_pending", row)).collect()
    }

    async fn find(&self, id: EventId) -> Result<Option<OutboxEntry>, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT id, routing_key, envelope, status, retry_count, max_retries,
                   last_error, scheduled_at, created_at, published_at
            FROM outbox
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(format!("find: {e}")))?;
        row.map(|row| outbox_entry_from_row("find", &row)).transpose()
    }

    async fn mark_published(&self, id: EventId) -> Result<(), OutboxError> {
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'PUBLISHED', published_at = NOW() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(format!("mark_published: {e}")))?;
        if updated.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: EventId, error: &str) -> Result<(), OutboxError> {
        // Retry arithmetic lives in SQL so concurrent markers cannot lose
        // increments: backoff 2^retry seconds, terminal FAILED at the cap.
        let updated = sqlx::query(
            r#"
            UPDATE outbox SET
                retry_count = retry_count + 1,
                last_error = $2,
                status = CASE WHEN retry_count + 1 >= max_retries THEN 'FAILED' ELSE 'PENDING' END,
                scheduled_at = NOW() + (interval '1 second' * power(2, retry_count + 1))
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(format!("mark_failed: {e}")))?;
        if updated.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn requeue(&self, id: EventId) -> Result<(), OutboxError> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox SET
                status = 'PENDING', retry_count = 0, last_error = NULL,
                scheduled_at = NOW(), published_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Storage(format!("requeue: {e}")))?;
        if updated.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn gc(&self, published_before: DateTime<Utc>) -> Result<u64, OutboxError> {
        let deleted =
            sqlx::query("DELETE FROM outbox WHERE status = 'PUBLISHED' AND published_at < $1")
                .bind(published_before)
                .execute(&self.pool)
                .await
                .map_err(|e| OutboxError::Storage(format!("gc: {e}")))?;
        Ok(deleted.rows_affected())
    }

    async fn queue_size(&self) -> Result<u64, OutboxError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM outbox WHERE status = 'PENDING'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(format!("queue_size: {e}")))?;
        let n: i64 = row.try_get("n").map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(n as u64)
    }
}

#[async_trait]
impl EventLog for PostgresStateStore {
    async fn get(&self, event_id: EventId) -> Result<Option<EventEnvelope>, EventLogError> {
        let row = sqlx::query("SELECT envelope FROM event_log WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EventLogError::Storage(format!("get: {e}")))?;
        row.map(|row| {
            decode_envelope("get", &row).map_err(|e| EventLogError::Storage(e.to_string()))
        })
        .transpose()
    }

    async fn by_correlation(
        &self,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
    ) -> Result<Vec<EventEnvelope>, EventLogError> {
        let rows = sqlx::query(
            r#"
            SELECT envelope FROM event_log
            WHERE tenant_id = $1 AND correlation_id = $2
            ORDER BY occurred_at, event_id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(correlation_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventLogError::Storage(format!("by_correlation: {e}")))?;
        rows.iter()
            .map(|row| {
                decode_envelope("by_correlation", row)
                    .map_err(|e| EventLogError::Storage(e.to_string()))
            })
            .collect()
    }
}
