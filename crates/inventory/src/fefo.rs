//! First-Expire-First-Out allocation.
//!
//! Pure: given a demand and candidate sources (stock level + optional lot),
//! pick lots in earliest-expiry order honoring the request's filters. The
//! allocator is total — it never fails; shortfalls are reported in the
//! result, and every rejected source carries a reason.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use warebus_core::{LocationId, LotId, ProductId, StockLevelId, VariantId, WarehouseId};

use crate::lot::{LotBatch, LotStatus};
use crate::stock::StockLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: WarehouseId,
    pub quantity: i64,
    pub preferred_locations: Vec<LocationId>,
    pub excluded_lots: Vec<LotId>,
    pub min_days_to_expiration: i64,
}

impl AllocationRequest {
    pub fn new(product_id: ProductId, warehouse_id: WarehouseId, quantity: i64) -> Self {
        Self {
            product_id,
            variant_id: None,
            warehouse_id,
            quantity,
            preferred_locations: Vec::new(),
            excluded_lots: Vec::new(),
            min_days_to_expiration: 0,
        }
    }
}

/// A stock level paired with its lot (when lot-tracked) and the location's
/// pick sequence, which is the final ordering tiebreak.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationSource {
    pub stock: StockLevel,
    pub lot: Option<LotBatch>,
    pub pick_sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub stock_level_id: StockLevelId,
    pub location_id: LocationId,
    pub lot_id: Option<LotId>,
    pub expiration_date: Option<NaiveDate>,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "reason")]
pub enum SkipReason {
    NoAvailableQuantity,
    LotNotPickable { status: LotStatus },
    ExpiringTooSoon { days_to_expiration: i64 },
    LotExcluded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSource {
    pub stock_level_id: StockLevelId,
    pub lot_id: Option<LotId>,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub requested_quantity: i64,
    pub allocated_quantity: i64,
    pub shortfall_quantity: i64,
    pub fully_allocated: bool,
    pub lines: Vec<AllocationLine>,
    pub skipped: Vec<SkippedSource>,
}

/// Allocate `request.quantity` across `sources` in FEFO order.
///
/// Ordering within the preferred/other location groups:
/// 1. both lots expire → earlier expiration first
/// 2. only one expires → the expiring one first
/// 3. neither expires → lot received date ascending (FIFO fallback)
/// 4. lot-less sources after lot-tracked ones
/// 5. location pick sequence as tiebreak
pub fn allocate(
    request: &AllocationRequest,
    sources: &[AllocationSource],
    today: NaiveDate,
) -> AllocationResult {
    let mut candidates: Vec<&AllocationSource> = sources
        .iter()
        .filter(|s| {
            s.stock.product_id == request.product_id
                && s.stock.warehouse_id == request.warehouse_id
                && (request.variant_id.is_none() || s.stock.variant_id == request.variant_id)
        })
        .collect();

    let preferred = |s: &AllocationSource| request.preferred_locations.contains(&s.stock.location_id);
    candidates.sort_by(|a, b| {
        preferred(b)
            .cmp(&preferred(a))
            .then_with(|| fefo_order(a, b))
            .then_with(|| a.pick_sequence.cmp(&b.pick_sequence))
    });

    let mut remaining = request.quantity.max(0);
    let mut lines = Vec::new();
    let mut skipped = Vec::new();

    for source in candidates {
        if remaining == 0 {
            break;
        }

        if let Some(reason) = skip_reason(request, source, today) {
            skipped.push(SkippedSource {
                stock_level_id: source.stock.id,
                lot_id: source.lot.as_ref().map(|l| l.id),
                reason,
            });
            continue;
        }

        let take = remaining.min(source.stock.available);
        lines.push(AllocationLine {
            stock_level_id: source.stock.id,
            location_id: source.stock.location_id,
            lot_id: source.lot.as_ref().map(|l| l.id),
            expiration_date: source.lot.as_ref().and_then(|l| l.expiration_date),
            quantity: take,
        });
        remaining -= take;
    }

    let requested = request.quantity.max(0);
    AllocationResult {
        requested_quantity: requested,
        allocated_quantity: requested - remaining,
        shortfall_quantity: remaining,
        fully_allocated: remaining == 0,
        lines,
        skipped,
    }
}

fn fefo_order(a: &AllocationSource, b: &AllocationSource) -> Ordering {
    match (&a.lot, &b.lot) {
        (Some(la), Some(lb)) => match (la.expiration_date, lb.expiration_date) {
            (Some(ea), Some(eb)) => ea.cmp(&eb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => la.received_at.cmp(&lb.received_at),
        },
        // Lot-tracked inventory is consumed before untracked.
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn skip_reason(
    request: &AllocationRequest,
    source: &AllocationSource,
    today: NaiveDate,
) -> Option<SkipReason> {
    if source.stock.available <= 0 {
        return Some(SkipReason::NoAvailableQuantity);
    }

    let Some(lot) = &source.lot else {
        return None;
    };

    if request.excluded_lots.contains(&lot.id) {
        return Some(SkipReason::LotExcluded);
    }
    if !lot.status.is_pickable_status() {
        return Some(SkipReason::LotNotPickable { status: lot.status });
    }
    if let Some(exp) = lot.expiration_date {
        let days = (exp - today).num_days();
        if days < request.min_days_to_expiration {
            return Some(SkipReason::ExpiringTooSoon {
                days_to_expiration: days,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use warebus_core::TenantId;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    struct Fixture {
        tenant: TenantId,
        warehouse: WarehouseId,
        product: ProductId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tenant: TenantId::new(),
                warehouse: WarehouseId::new(),
                product: ProductId::new(),
            }
        }

        fn source(&self, available: i64, expiration: Option<NaiveDate>, seq: u32) -> AllocationSource {
            let mut stock = StockLevel::new(
                self.tenant,
                self.warehouse,
                self.product,
                None,
                LocationId::new(),
                None,
            );
            stock.on_hand = available;
            stock.available = available;

            let lot = expiration.map(|exp| {
                let mut l = LotBatch::new(self.tenant, self.product, format!("L-{seq}"));
                l.expiration_date = Some(exp);
                l
            });
            if let Some(l) = &lot {
                stock.lot_id = Some(l.id);
            }

            AllocationSource {
                stock,
                lot,
                pick_sequence: seq,
            }
        }
    }

    #[test]
    fn earliest_expiring_lot_is_consumed_first() {
        let f = Fixture::new();
        let today = day(2026, 8, 1);
        // L1 expires later than L2; demand 7 must take all of L2 then 2 of L1.
        let l1 = f.source(5, Some(day(2030, 1, 1)), 1);
        let l2 = f.source(5, Some(day(2029, 1, 1)), 2);

        let request = AllocationRequest::new(f.product, f.warehouse, 7);
        let result = allocate(&request, &[l1.clone(), l2.clone()], today);

        assert!(result.fully_allocated);
        assert_eq!(result.allocated_quantity, 7);
        assert_eq!(result.lines.len(), 2);
        assert_eq!(result.lines[0].stock_level_id, l2.stock.id);
        assert_eq!(result.lines[0].quantity, 5);
        assert_eq!(result.lines[1].stock_level_id, l1.stock.id);
        assert_eq!(result.lines[1].quantity, 2);
    }

    #[test]
    fn expiring_lots_sort_before_non_expiring() {
        let f = Fixture::new();
        let today = day(2026, 8, 1);
        let no_exp = f.source(10, None, 1);
        let exp = f.source(10, Some(day(2030, 1, 1)), 2);

        let request = AllocationRequest::new(f.product, f.warehouse, 5);
        let result = allocate(&request, &[no_exp, exp.clone()], today);

        assert_eq!(result.lines[0].stock_level_id, exp.stock.id);
    }

    #[test]
    fn lotless_sources_sort_after_lot_tracked() {
        let f = Fixture::new();
        let today = day(2026, 8, 1);

        let mut untracked = f.source(10, None, 1);
        untracked.lot = None;
        untracked.stock.lot_id = None;
        let tracked = f.source(10, None, 2);

        let request = AllocationRequest::new(f.product, f.warehouse, 5);
        let result = allocate(&request, &[untracked, tracked.clone()], today);
        assert_eq!(result.lines[0].stock_level_id, tracked.stock.id);
    }

    #[test]
    fn preferred_locations_outrank_fefo() {
        let f = Fixture::new();
        let today = day(2026, 8, 1);
        let earlier = f.source(10, Some(day(2028, 1, 1)), 1);
        let preferred = f.source(10, Some(day(2031, 1, 1)), 2);

        let mut request = AllocationRequest::new(f.product, f.warehouse, 5);
        request.preferred_locations = vec![preferred.stock.location_id];

        let result = allocate(&request, &[earlier, preferred.clone()], today);
        assert_eq!(result.lines[0].stock_level_id, preferred.stock.id);
    }

    #[test]
    fn skips_carry_reasons() {
        let f = Fixture::new();
        let today = day(2026, 8, 1);

        // All problem sources expire before the good one, so each is visited
        // (and skipped) before the demand is filled.
        let empty = f.source(0, Some(day(2028, 1, 1)), 1);
        let mut quarantined = f.source(10, Some(day(2028, 2, 1)), 2);
        if let Some(l) = &mut quarantined.lot {
            l.status = LotStatus::Quarantine;
        }
        let near_expiry = f.source(10, Some(day(2026, 8, 3)), 3);
        let excluded = f.source(10, Some(day(2028, 3, 1)), 4);
        let good = f.source(10, Some(day(2030, 1, 1)), 5);

        let mut request = AllocationRequest::new(f.product, f.warehouse, 4);
        request.min_days_to_expiration = 30;
        request.excluded_lots = vec![excluded.lot.as_ref().unwrap().id];

        let result = allocate(
            &request,
            &[empty, quarantined, near_expiry, excluded, good.clone()],
            today,
        );

        assert!(result.fully_allocated);
        assert_eq!(result.lines.len(), 1);
        assert_eq!(result.lines[0].stock_level_id, good.stock.id);
        assert_eq!(result.skipped.len(), 4);
        assert!(result
            .skipped
            .iter()
            .any(|s| matches!(s.reason, SkipReason::NoAvailableQuantity)));
        assert!(result
            .skipped
            .iter()
            .any(|s| matches!(s.reason, SkipReason::LotNotPickable { status: LotStatus::Quarantine })));
        assert!(result
            .skipped
            .iter()
            .any(|s| matches!(s.reason, SkipReason::ExpiringTooSoon { days_to_expiration: 2 })));
        assert!(result.skipped.iter().any(|s| matches!(s.reason, SkipReason::LotExcluded)));
    }

    #[test]
    fn shortfall_is_reported_not_raised() {
        let f = Fixture::new();
        let today = day(2026, 8, 1);
        let only = f.source(3, Some(day(2030, 1, 1)), 1);

        let request = AllocationRequest::new(f.product, f.warehouse, 10);
        let result = allocate(&request, &[only], today);

        assert!(!result.fully_allocated);
        assert_eq!(result.allocated_quantity, 3);
        assert_eq!(result.shortfall_quantity, 7);
    }

    #[test]
    fn other_products_and_warehouses_are_not_considered() {
        let f = Fixture::new();
        let today = day(2026, 8, 1);
        let mut foreign = f.source(10, Some(day(2030, 1, 1)), 1);
        foreign.stock.product_id = ProductId::new();

        let request = AllocationRequest::new(f.product, f.warehouse, 5);
        let result = allocate(&request, &[foreign], today);
        assert_eq!(result.allocated_quantity, 0);
        assert!(result.lines.is_empty());
        // Non-matching sources are dropped, not reported as skipped.
        assert!(result.skipped.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// With distinct expirations and passing filters, no allocation
            /// ever draws from a later-expiring lot while an earlier one
            /// still has available stock.
            #[test]
            fn fefo_monotonicity(
                availables in prop::collection::vec(1i64..50, 2..8),
                demand in 1i64..200,
            ) {
                let f = Fixture::new();
                let today = day(2026, 8, 1);

                let sources: Vec<AllocationSource> = availables
                    .iter()
                    .enumerate()
                    .map(|(i, &a)| {
                        f.source(a, Some(day(2027, 1, 1) + chrono::Duration::days(i as i64 * 30)), i as u32)
                    })
                    .collect();

                let request = AllocationRequest::new(f.product, f.warehouse, demand);
                let result = allocate(&request, &sources, today);

                // Lines come back in expiration order...
                let expirations: Vec<_> = result.lines.iter().map(|l| l.expiration_date).collect();
                let mut sorted = expirations.clone();
                sorted.sort();
                prop_assert_eq!(&expirations, &sorted);

                // ...and every line except the last drains its source.
                for (i, line) in result.lines.iter().enumerate() {
                    let source = sources.iter().find(|s| s.stock.id == line.stock_level_id).unwrap();
                    if i + 1 < result.lines.len() {
                        prop_assert_eq!(line.quantity, source.stock.available);
                    }
                }

                let total: i64 = result.lines.iter().map(|l| l.quantity).sum();
                prop_assert_eq!(total, result.allocated_quantity);
                prop_assert!(result.allocated_quantity <= demand);
                prop_assert_eq!(result.fully_allocated, result.shortfall_quantity == 0);
            }

            /// Allocation never exceeds per-source availability.
            #[test]
            fn never_overdraws_a_source(
                availables in prop::collection::vec(0i64..20, 1..6),
                demand in 0i64..100,
            ) {
                let f = Fixture::new();
                let today = day(2026, 8, 1);
                let sources: Vec<AllocationSource> = availables
                    .iter()
                    .enumerate()
                    .map(|(i, &a)| f.source(a, None, i as u32))
                    .collect();

                let request = AllocationRequest::new(f.product, f.warehouse, demand);
                let result = allocate(&request, &sources, today);

                for line in &result.lines {
                    let source = sources.iter().find(|s| s.stock.id == line.stock_level_id).unwrap();
                    prop_assert!(line.quantity > 0);
                    prop_assert!(line.quantity <= source.stock.available);
                }
            }
        }
    }
}
