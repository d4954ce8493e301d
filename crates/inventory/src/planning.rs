//! Planning math: ABC-XYZ classification, safety stock, demand forecasting.
//!
//! All functions are pure over demand snapshots; the planning agents supply
//! the data and persist the outcomes.

use serde::{Deserialize, Serialize};

use warebus_core::ProductId;

use crate::product::{AbcClass, XyzClass};

/// Mean / standard deviation summary of a demand or lead-time series.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub mean: f64,
    pub std_dev: f64,
}

impl SeriesStats {
    /// Population statistics of a sample series. Empty series yield zeros.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self { mean: 0.0, std_dev: 0.0 };
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std_dev: variance.sqrt(),
        }
    }

    /// Coefficient of variation; zero-mean series count as maximally
    /// variable only when they carry any deviation.
    pub fn coefficient_of_variation(&self) -> f64 {
        if self.mean.abs() < f64::EPSILON {
            if self.std_dev.abs() < f64::EPSILON {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            self.std_dev / self.mean
        }
    }
}

/// Revenue-Pareto classification over (product, revenue) pairs.
///
/// Products are ranked by revenue descending; the cumulative share decides
/// the class: ≤ 80 % A, ≤ 95 % B, otherwise C. The top earner is always A
/// (a single dominant product must not fall through to C), and zero total
/// revenue puts everything in C.
pub fn classify_abc(revenues: &[(ProductId, f64)]) -> Vec<(ProductId, AbcClass)> {
    let total: f64 = revenues.iter().map(|(_, r)| r.max(0.0)).sum();
    if total <= 0.0 {
        return revenues.iter().map(|(id, _)| (*id, AbcClass::C)).collect();
    }

    let mut ranked: Vec<(ProductId, f64)> =
        revenues.iter().map(|(id, r)| (*id, r.max(0.0))).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut cumulative = 0.0;
    ranked
        .into_iter()
        .enumerate()
        .map(|(rank, (id, revenue))| {
            cumulative += revenue;
            let share = cumulative / total;
            let class = if rank == 0 || share <= 0.80 {
                AbcClass::A
            } else if share <= 0.95 {
                AbcClass::B
            } else {
                AbcClass::C
            };
            (id, class)
        })
        .collect()
}

/// Demand-variability class from the coefficient of variation.
pub fn classify_xyz(cov: f64) -> XyzClass {
    if cov < 0.5 {
        XyzClass::X
    } else if cov < 1.0 {
        XyzClass::Y
    } else {
        XyzClass::Z
    }
}

/// Safety stock via the z-score formula `Z · √(LT·σD² + D²·σLT²)`.
///
/// `demand` is per-day demand statistics, `lead_time` the supplier lead time
/// in days. The result is rounded up to whole units and never negative.
pub fn safety_stock(z: f64, demand: SeriesStats, lead_time: SeriesStats) -> i64 {
    let variance =
        lead_time.mean * demand.std_dev.powi(2) + demand.mean.powi(2) * lead_time.std_dev.powi(2);
    if variance <= 0.0 || z <= 0.0 {
        return 0;
    }
    (z * variance.sqrt()).ceil() as i64
}

/// Simple exponential smoothing forecast.
///
/// Returns a flat per-day forecast of length `horizon_days` at the smoothed
/// level of the history. Empty history forecasts zero demand.
pub fn forecast_demand(history: &[f64], alpha: f64, horizon_days: usize) -> Vec<f64> {
    let alpha = alpha.clamp(0.0, 1.0);
    let level = match history.split_first() {
        None => 0.0,
        Some((first, rest)) => rest
            .iter()
            .fold(*first, |level, &sample| alpha * sample + (1.0 - alpha) * level),
    };
    vec![level.max(0.0); horizon_days]
}
