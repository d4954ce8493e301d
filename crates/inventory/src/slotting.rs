//! Multi-criteria slotting scorer.
//!
//! Pure: ranks candidate locations for a putaway as a weighted sum of six
//! normalized subscores. Deterministic for fixed inputs and weights; ties
//! break on the lower pick sequence.

use serde::{Deserialize, Serialize};

use warebus_core::LocationId;

use crate::location::{Location, LocationType, TemperatureZone};
use crate::product::AbcClass;

/// Subscore weights. Defaults follow the standard profile; override at
/// construction when a warehouse tunes the tradeoff.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlottingWeights {
    pub abc_velocity: f64,
    pub proximity: f64,
    pub capacity: f64,
    pub temperature: f64,
    pub fefo_friendliness: f64,
    pub hazard: f64,
}

impl Default for SlottingWeights {
    fn default() -> Self {
        Self {
            abc_velocity: 0.30,
            proximity: 0.25,
            capacity: 0.20,
            temperature: 0.10,
            fefo_friendliness: 0.10,
            hazard: 0.05,
        }
    }
}

/// What is being put away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlottingContext {
    pub abc_class: Option<AbcClass>,
    pub required_temperature: Option<TemperatureZone>,
    pub hazmat: bool,
    pub quantity: i64,
    pub preferred_zones: Vec<String>,
    pub excluded_locations: Vec<LocationId>,
}

impl SlottingContext {
    pub fn new(quantity: i64) -> Self {
        Self {
            abc_class: None,
            required_temperature: None,
            hazmat: false,
            quantity,
            preferred_zones: Vec::new(),
            excluded_locations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub abc_velocity: f64,
    pub proximity: f64,
    pub capacity: f64,
    pub temperature: f64,
    pub fefo_friendliness: f64,
    pub hazard: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredLocation {
    pub location_id: LocationId,
    pub location_code: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Rank candidate locations, best first.
pub fn rank(
    candidates: &[Location],
    ctx: &SlottingContext,
    weights: &SlottingWeights,
) -> Vec<ScoredLocation> {
    let eligible: Vec<&Location> = candidates.iter().filter(|l| passes_filters(l, ctx)).collect();

    let max_distance = eligible
        .iter()
        .map(|l| l.distance_from_dock)
        .fold(0.0_f64, f64::max);
    let max_frequency = eligible
        .iter()
        .map(|l| l.pick_frequency)
        .fold(0.0_f64, f64::max);

    let mut scored: Vec<(u32, ScoredLocation)> = eligible
        .iter()
        .map(|l| {
            let breakdown = breakdown_for(l, ctx, max_distance, max_frequency);
            let score = weights.abc_velocity * breakdown.abc_velocity
                + weights.proximity * breakdown.proximity
                + weights.capacity * breakdown.capacity
                + weights.temperature * breakdown.temperature
                + weights.fefo_friendliness * breakdown.fefo_friendliness
                + weights.hazard * breakdown.hazard;
            (
                l.pick_sequence,
                ScoredLocation {
                    location_id: l.id,
                    location_code: l.code.clone(),
                    score,
                    breakdown,
                },
            )
        })
        .collect();

    scored.sort_by(|(seq_a, a), (seq_b, b)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| seq_a.cmp(seq_b))
    });

    scored.into_iter().map(|(_, s)| s).collect()
}

fn passes_filters(location: &Location, ctx: &SlottingContext) -> bool {
    if !location.active {
        return false;
    }
    if ctx.excluded_locations.contains(&location.id) {
        return false;
    }
    if !ctx.preferred_zones.is_empty() && !ctx.preferred_zones.contains(&location.zone) {
        return false;
    }
    // AMBIENT goods go anywhere; anything else needs the matching zone.
    if let Some(required) = ctx.required_temperature {
        if required != TemperatureZone::Ambient && location.temperature_zone != required {
            return false;
        }
    }
    if ctx.hazmat && !location.hazmat_certified {
        return false;
    }
    true
}

fn breakdown_for(
    location: &Location,
    ctx: &SlottingContext,
    max_distance: f64,
    max_frequency: f64,
) -> ScoreBreakdown {
    let velocity = if max_frequency > 0.0 {
        (location.pick_frequency / max_frequency).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let abc_velocity = match ctx.abc_class {
        Some(AbcClass::A) => velocity,
        Some(AbcClass::C) => 1.0 - velocity,
        Some(AbcClass::B) | None => 0.5,
    };

    let proximity = if max_distance > 0.0 {
        (1.0 - location.distance_from_dock / max_distance).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let capacity = (1.0 - location.utilization_pct / 100.0).clamp(0.0, 1.0);

    let temperature = match ctx.required_temperature {
        None => 0.5,
        Some(required) if required == location.temperature_zone => 1.0,
        Some(_) => 0.0,
    };

    let fefo_friendliness = match location.location_type {
        LocationType::Pick | LocationType::Staging => 1.0,
        _ => 0.5,
    };

    let hazard = if !ctx.hazmat {
        1.0
    } else if location.hazmat_certified {
        1.0
    } else {
        0.0
    };

    ScoreBreakdown {
        abc_velocity,
        proximity,
        capacity,
        temperature,
        fefo_friendliness,
        hazard,
    }
}
