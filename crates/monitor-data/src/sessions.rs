//! Session reconstruction from point-in-time observations.
//!
//! A snapshot only shows who holds a license at that instant. Consecutive
//! observations of the same (user, feature) are merged into one session while
//! the gap between them stays within `multiplier × sampling interval`; each
//! session is credited one extra interval for the time after its last sample.

use chrono::NaiveDateTime;

use monitor_core::models::Session;
use monitor_core::percentile::median;
use monitor_core::settings::AnalysisConfig;
use monitor_core::time_utils::{hours_between, minutes_between};

/// Session count and total hours for one observation series.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionSummary {
    pub sessions: usize,
    pub hours: f64,
}

// ── SessionReconstructor ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SessionReconstructor {
    interval_minutes: f64,
    gap_multiplier: f64,
}

impl SessionReconstructor {
    pub fn new(interval_minutes: f64, gap_multiplier: f64) -> Self {
        Self {
            interval_minutes,
            gap_multiplier,
        }
    }

    pub fn from_config(config: &AnalysisConfig, interval_minutes: f64) -> Self {
        Self::new(interval_minutes, config.session_gap_multiplier)
    }

    pub fn interval_minutes(&self) -> f64 {
        self.interval_minutes
    }

    /// Sessions of one series, in time order. Input order and duplicates do
    /// not matter.
    pub fn sessions(&self, timestamps: &[NaiveDateTime]) -> Vec<Session> {
        let mut sorted = timestamps.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let Some((&first, rest)) = sorted.split_first() else {
            return Vec::new();
        };

        let max_gap = self.gap_multiplier * self.interval_minutes;
        let mut sessions = Vec::new();
        let (mut start, mut prev, mut count) = (first, first, 1usize);

        for &ts in rest {
            if minutes_between(prev, ts) <= max_gap {
                prev = ts;
                count += 1;
            } else {
                sessions.push(self.close(start, prev, count));
                (start, prev, count) = (ts, ts, 1);
            }
        }
        sessions.push(self.close(start, prev, count));
        sessions
    }

    pub fn reconstruct(&self, timestamps: &[NaiveDateTime]) -> SessionSummary {
        let sessions = self.sessions(timestamps);
        SessionSummary {
            sessions: sessions.len(),
            hours: sessions.iter().map(|s| s.duration_hours).sum(),
        }
    }

    fn close(&self, start: NaiveDateTime, end: NaiveDateTime, observations: usize) -> Session {
        Session {
            start,
            end,
            observations,
            duration_hours: hours_between(start, end) + self.interval_minutes / 60.0,
        }
    }
}

// ── Sampling interval ─────────────────────────────────────────────────────────

/// Median gap between distinct snapshot timestamps, clamped to the
/// configured bounds. Falls back to the default with fewer than two
/// distinct timestamps.
pub fn detect_sampling_interval(
    timestamps: impl IntoIterator<Item = NaiveDateTime>,
    config: &AnalysisConfig,
) -> f64 {
    let gaps = distinct_gaps_minutes(timestamps);
    match median(&gaps) {
        Some(m) => config.clamp_interval(m),
        None => config.default_sampling_interval_minutes,
    }
}

/// Gaps in minutes between consecutive distinct timestamps.
pub fn distinct_gaps_minutes(timestamps: impl IntoIterator<Item = NaiveDateTime>) -> Vec<f64> {
    let mut sorted: Vec<NaiveDateTime> = timestamps.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
        .windows(2)
        .map(|w| minutes_between(w[0], w[1]))
        .collect()
}
