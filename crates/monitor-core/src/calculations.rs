use serde::{Deserialize, Serialize};

use crate::formatting::ratio_pct;
use crate::models::UtilizationStatus;

/// Percentage cut-offs for [`UtilizationStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilizationThresholds {
    /// At or above this percentage a feature is in effective use.
    pub effective_pct: f64,
    /// At or above this (and below `effective_pct`) usage is partial.
    pub partial_pct: f64,
}

impl Default for UtilizationThresholds {
    fn default() -> Self {
        Self {
            effective_pct: 80.0,
            partial_pct: 30.0,
        }
    }
}

// ── UtilizationCalculator ─────────────────────────────────────────────────────

/// Stateless utilization ratios against a policy ceiling.
///
/// Every ratio is `None` when the ceiling is missing or zero.
pub struct UtilizationCalculator;

impl UtilizationCalculator {
    /// Average concurrency while active as a share of the ceiling.
    pub fn active_utilization(avg_concurrent: f64, ceiling: Option<u32>) -> Option<f64> {
        let ceiling = ceiling.filter(|c| *c > 0)?;
        ratio_pct(avg_concurrent, ceiling as f64)
    }

    /// Usage-hours as a share of `ceiling × period_hours` seat-hours.
    ///
    /// Also `None` when `period_hours` is not positive.
    pub fn period_utilization(
        usage_hours: f64,
        ceiling: Option<u32>,
        period_hours: f64,
    ) -> Option<f64> {
        let ceiling = ceiling.filter(|c| *c > 0)?;
        ratio_pct(usage_hours, ceiling as f64 * period_hours)
    }

    /// Bucket a utilization percentage.
    pub fn classify(
        utilization_pct: Option<f64>,
        thresholds: &UtilizationThresholds,
    ) -> UtilizationStatus {
        match utilization_pct {
            None => UtilizationStatus::NoPolicy,
            Some(pct) if pct >= thresholds.effective_pct => UtilizationStatus::EffectiveUse,
            Some(pct) if pct >= thresholds.partial_pct => UtilizationStatus::PartialUse,
            Some(_) => UtilizationStatus::Underutilized,
        }
    }
}
