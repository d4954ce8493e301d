//! `warebus-inventory` — warehouse domain types and the pure algorithms the
//! reaction agents rely on.
//!
//! Nothing here touches storage or the broker; the store ports in
//! [`store`] are implemented by `warebus-infra`.

pub mod fefo;
pub mod location;
pub mod lot;
pub mod order;
pub mod payloads;
pub mod planning;
pub mod product;
pub mod reservation;
pub mod slotting;
pub mod stock;
pub mod store;
pub mod thresholds;

pub use fefo::{
    allocate, AllocationLine, AllocationRequest, AllocationResult, AllocationSource, SkipReason,
    SkippedSource,
};
pub use location::{Location, LocationType, TemperatureZone};
pub use lot::{LotBatch, LotStatus};
pub use order::{OrderLine, OrderStatus, SalesOrder};
pub use planning::{classify_abc, classify_xyz, forecast_demand, safety_stock, SeriesStats};
pub use product::{AbcClass, Product, XyzClass};
pub use reservation::{Reservation, ReservationReference, ReservationStatus};
pub use slotting::{rank, ScoreBreakdown, ScoredLocation, SlottingContext, SlottingWeights};
pub use stock::{MovementType, StockDeltas, StockLevel};
pub use store::{
    retry_on_conflict, DemandSample, LeadTimeStats, StateStore, StateTx, StoreError, StoreResult,
};
pub use thresholds::{evaluate_stock_level, AlertLevel};
