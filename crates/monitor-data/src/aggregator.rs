//! Concurrency per time bin per feature.
//!
//! Concurrency is measured per snapshot (distinct users holding the feature
//! at that instant) and a bin reports the highest snapshot value inside it.
//! Bins are zero-filled so a chart sees every bin for every feature.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use monitor_core::models::{CheckoutRecord, DateRange, Granularity, TimeBin, TimeBinSeries};
use monitor_core::settings::{AnalysisConfig, GranularityThresholds};
use monitor_core::time_utils::{next_month, TimezoneHandler};

// ── TimeBinAggregator ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TimeBinAggregator {
    thresholds: GranularityThresholds,
    now: NaiveDateTime,
}

impl TimeBinAggregator {
    /// `now` caps fine-grained bin generation for ranges ending in the future.
    pub fn new(thresholds: GranularityThresholds, now: NaiveDateTime) -> Self {
        Self { thresholds, now }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(
            config.granularity_thresholds,
            TimezoneHandler::new(&config.timezone).now(),
        )
    }

    pub fn select_granularity(&self, range: &DateRange) -> Granularity {
        self.thresholds.select(range.span_days())
    }

    /// Bin records in `range`. Records outside the range are ignored.
    pub fn aggregate(
        &self,
        records: &[CheckoutRecord],
        range: &DateRange,
        granularity: Option<Granularity>,
    ) -> TimeBinSeries {
        let granularity = granularity.unwrap_or_else(|| self.select_granularity(range));

        // (timestamp, feature) -> users present in that snapshot
        let mut per_snapshot: BTreeMap<(NaiveDateTime, &str), HashSet<&str>> = BTreeMap::new();
        for r in records.iter().filter(|r| range.contains(r.timestamp)) {
            per_snapshot
                .entry((r.timestamp, r.feature.as_str()))
                .or_default()
                .insert(r.user.as_str());
        }

        let features: BTreeSet<&str> = per_snapshot.keys().map(|(_, f)| *f).collect();

        // (bin start, feature) -> (peak, users)
        let mut observed: BTreeMap<(NaiveDateTime, &str), (u32, HashSet<&str>)> = BTreeMap::new();
        for ((ts, feature), users) in &per_snapshot {
            let slot = observed
                .entry((granularity.floor(*ts), *feature))
                .or_default();
            slot.0 = slot.0.max(users.len() as u32);
            slot.1.extend(users.iter().copied());
        }

        let mut starts: BTreeSet<NaiveDateTime> = self.bin_starts(range, granularity).into_iter().collect();
        starts.extend(observed.keys().map(|(start, _)| *start));

        let mut bins = Vec::with_capacity(starts.len() * features.len());
        for start in &starts {
            let label = granularity.label(*start);
            for feature in &features {
                let (peak, users) = observed
                    .get(&(*start, *feature))
                    .map(|(p, u)| (*p, u.len() as u32))
                    .unwrap_or((0, 0));
                bins.push(TimeBin {
                    label: label.clone(),
                    start: *start,
                    feature: feature.to_string(),
                    peak_concurrent: peak,
                    unique_users: users,
                });
            }
        }

        debug!(
            "Aggregated {} snapshot groups into {} {} bins across {} features",
            per_snapshot.len(),
            starts.len(),
            granularity,
            features.len()
        );

        TimeBinSeries {
            bins,
            granularity,
            tick_format: granularity.tick_format().to_string(),
        }
    }

    /// Bin boundaries covering `range`.
    ///
    /// Five-minute, hourly and daily bins stop at `now` when the range ends
    /// in the future. Weekly bins are ISO weeks and monthly bins calendar
    /// months; both always include the period containing the range end.
    pub fn bin_starts(&self, range: &DateRange, granularity: Granularity) -> Vec<NaiveDateTime> {
        let first = granularity.floor(range.start_instant());
        let mut starts = Vec::new();

        match granularity {
            Granularity::FiveMinute | Granularity::Hourly | Granularity::Daily => {
                let step = match granularity {
                    Granularity::FiveMinute => Duration::minutes(5),
                    Granularity::Hourly => Duration::hours(1),
                    _ => Duration::days(1),
                };
                let cap = range.end_instant().min(self.now);
                let mut t = first;
                while t <= cap {
                    starts.push(t);
                    t += step;
                }
            }
            Granularity::Weekly => {
                let mut t = first;
                while t <= range.end_instant() {
                    starts.push(t);
                    t += Duration::days(7);
                }
            }
            Granularity::Monthly => {
                let mut t = first;
                while t <= range.end_instant() {
                    starts.push(t);
                    t = next_month(t.date()).and_time(t.time());
                }
            }
        }
        starts
    }
}

/// Aggregate with thresholds and "now" taken from `config`.
pub fn aggregate_time_bins(
    records: &[CheckoutRecord],
    range: &DateRange,
    granularity: Option<Granularity>,
    config: &AnalysisConfig,
) -> TimeBinSeries {
    TimeBinAggregator::from_config(config).aggregate(records, range, granularity)
}
