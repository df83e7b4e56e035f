//! Main analysis pipeline.
//!
//! Loads snapshots for a date range, applies the record filter, scopes policy
//! ceilings to the selected users and runs every aggregation, returning an
//! [`AnalysisResult`] ready for tables, charts and CSV export.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use monitor_core::error::Result;
use monitor_core::models::{
    CheckoutRecord, CompanyFeatureStat, DateRange, FeatureStat, Granularity, OveruseReport,
    RecordFilter, TimeBinSeries, UserStat,
};
use monitor_core::policy::PolicyTable;
use monitor_core::settings::AnalysisConfig;
use monitor_core::time_utils::TimezoneHandler;

use crate::aggregator::TimeBinAggregator;
use crate::parser::SnapshotParser;
use crate::reader::{load_records_with_progress, LoadedSnapshots, SnapshotStore};
use crate::sessions::{detect_sampling_interval, SessionReconstructor};
use crate::statistics::{
    compute_company_statistics, compute_feature_statistics, compute_user_activity,
    detect_overuse,
};

// ── Public types ──────────────────────────────────────────────────────────────

/// What to analyse.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub range: DateRange,
    /// `None` selects granularity from the range length.
    pub granularity: Option<Granularity>,
    pub filter: RecordFilter,
}

impl AnalysisRequest {
    pub fn new(range: DateRange) -> Self {
        Self {
            range,
            granularity: None,
            filter: RecordFilter::default(),
        }
    }
}

/// Metadata produced alongside the analysis result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    /// Server wall-clock time when the result was generated.
    pub generated_at: NaiveDateTime,
    pub range: DateRange,
    pub snapshots_loaded: usize,
    /// Records parsed before the filter was applied.
    pub records_loaded: usize,
    pub records_selected: usize,
    pub sampling_interval_minutes: f64,
    pub granularity: Granularity,
    pub period_hours: f64,
    pub load_time_seconds: f64,
    pub transform_time_seconds: f64,
}

/// The complete output of [`analyze`].
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub metadata: AnalysisMetadata,
    /// Selected records, ordered by timestamp.
    pub records: Vec<CheckoutRecord>,
    pub time_bins: TimeBinSeries,
    pub feature_stats: Vec<FeatureStat>,
    pub user_stats: Vec<UserStat>,
    pub company_stats: Vec<CompanyFeatureStat>,
    pub overuse: Vec<OveruseReport>,
    /// Per-feature ceilings scoped to the selection.
    pub ceilings: BTreeMap<String, u32>,
}

impl AnalysisResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn companies(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.company.as_str()).collect()
    }
}

// ── Public functions ──────────────────────────────────────────────────────────

/// User filter handed to the parser: the policy's users when a policy is
/// loaded, otherwise `None` so the username heuristic applies.
pub fn parser_user_filter(
    policy: &PolicyTable,
) -> Option<std::collections::HashMap<String, String>> {
    (!policy.is_empty()).then(|| policy.user_companies())
}

/// Load the snapshots of `range` from `store`.
pub fn load_snapshots<S, F>(
    store: &S,
    range: &DateRange,
    policy: &PolicyTable,
    config: &AnalysisConfig,
    on_progress: F,
) -> Result<LoadedSnapshots>
where
    S: SnapshotStore + ?Sized,
    F: FnMut(usize, usize),
{
    let parser = SnapshotParser::from_config(config)?;
    let user_filter = parser_user_filter(policy);
    Ok(load_records_with_progress(
        store,
        range,
        &parser,
        user_filter.as_ref(),
        on_progress,
    ))
}

/// Run the full pipeline against a store.
///
/// 1. Load and parse the snapshots in range.
/// 2. Detect the sampling interval from the snapshot timestamps.
/// 3. Filter records and scope policy ceilings to the selection.
/// 4. Aggregate time bins and compute statistics.
pub fn analyze<S, F>(
    request: &AnalysisRequest,
    store: &S,
    policy: &PolicyTable,
    config: &AnalysisConfig,
    on_progress: F,
) -> Result<AnalysisResult>
where
    S: SnapshotStore + ?Sized,
    F: FnMut(usize, usize),
{
    config.validate()?;

    let load_start = std::time::Instant::now();
    let loaded = load_snapshots(store, &request.range, policy, config, on_progress)?;
    let load_time = load_start.elapsed().as_secs_f64();

    Ok(analyze_loaded(&loaded, request, policy, config, load_time))
}

/// Run the aggregation steps over already loaded snapshots.
pub fn analyze_loaded(
    loaded: &LoadedSnapshots,
    request: &AnalysisRequest,
    policy: &PolicyTable,
    config: &AnalysisConfig,
    load_time_seconds: f64,
) -> AnalysisResult {
    let transform_start = std::time::Instant::now();

    let interval = detect_sampling_interval(loaded.snapshot_times.iter().copied(), config);

    let mut records: Vec<CheckoutRecord> = request
        .filter
        .apply(loaded.records.clone())
        .into_iter()
        .filter(|r| request.range.contains(r.timestamp))
        .collect();
    records.sort_by(|a, b| {
        (a.timestamp, &a.feature, &a.user).cmp(&(b.timestamp, &b.feature, &b.user))
    });

    let ceilings = scoped_ceilings(policy, &request.filter);
    let company_ceilings: BTreeMap<(String, String), u32> = policy
        .company_ceilings()
        .into_iter()
        .filter(|((_, feature), _)| request.filter.allows_feature(feature))
        .collect();

    let aggregator = TimeBinAggregator::from_config(config);
    let reconstructor = SessionReconstructor::from_config(config, interval);
    let thresholds = &config.utilization_thresholds;
    let period_hours = request.range.period_hours();

    let time_bins = aggregator.aggregate(&records, &request.range, request.granularity);
    let feature_stats =
        compute_feature_statistics(&records, &ceilings, period_hours, &reconstructor, thresholds);
    let user_stats = compute_user_activity(&records, &reconstructor);
    let company_stats =
        compute_company_statistics(&records, &company_ceilings, &reconstructor, thresholds);
    let overuse = detect_overuse(&records, &ceilings, &loaded.snapshot_times, interval);

    let metadata = AnalysisMetadata {
        generated_at: TimezoneHandler::new(&config.timezone).now(),
        range: request.range,
        snapshots_loaded: loaded.snapshot_times.len(),
        records_loaded: loaded.records.len(),
        records_selected: records.len(),
        sampling_interval_minutes: interval,
        granularity: time_bins.granularity,
        period_hours,
        load_time_seconds,
        transform_time_seconds: transform_start.elapsed().as_secs_f64(),
    };

    info!(
        "Analysed {} of {} records from {} snapshots ({} bins, interval {:.1} min)",
        metadata.records_selected,
        metadata.records_loaded,
        metadata.snapshots_loaded,
        metadata.granularity,
        interval
    );

    AnalysisResult {
        metadata,
        records,
        time_bins,
        feature_stats,
        user_stats,
        company_stats,
        overuse,
        ceilings,
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Ceilings over the policy users admitted by `filter`, limited to the
/// filter's features.
fn scoped_ceilings(policy: &PolicyTable, filter: &RecordFilter) -> BTreeMap<String, u32> {
    let users: Option<BTreeSet<String>> =
        if filter.users.is_none() && filter.companies.is_none() {
            None
        } else {
            Some(
                policy
                    .entries()
                    .filter(|e| {
                        filter.users.as_ref().map_or(true, |u| u.contains(&e.user))
                            && filter
                                .companies
                                .as_ref()
                                .map_or(true, |c| c.contains(&e.company))
                    })
                    .map(|e| e.user.clone())
                    .collect(),
            )
        };

    policy
        .ceilings_for_users(users.as_ref())
        .into_iter()
        .filter(|(feature, _)| filter.allows_feature(feature))
        .collect()
}
