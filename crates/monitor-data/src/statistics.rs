//! Feature, user and company summary statistics.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime};

use monitor_core::calculations::{UtilizationCalculator, UtilizationThresholds};
use monitor_core::formatting::ratio_pct;
use monitor_core::models::{
    CheckoutRecord, CompanyFeatureStat, FeatureStat, OveruseReport, UserStat,
};
use monitor_core::percentile::mean;

use crate::sessions::{distinct_gaps_minutes, SessionReconstructor, SessionSummary};

/// Distinct users per snapshot for every feature: `feature -> ts -> count`.
pub fn snapshot_concurrency(
    records: &[CheckoutRecord],
) -> BTreeMap<String, BTreeMap<NaiveDateTime, u32>> {
    let mut users: HashMap<(&str, NaiveDateTime), HashSet<&str>> = HashMap::new();
    for r in records {
        users
            .entry((r.feature.as_str(), r.timestamp))
            .or_default()
            .insert(r.user.as_str());
    }

    let mut out: BTreeMap<String, BTreeMap<NaiveDateTime, u32>> = BTreeMap::new();
    for ((feature, ts), set) in users {
        out.entry(feature.to_string())
            .or_default()
            .insert(ts, set.len() as u32);
    }
    out
}

/// Session totals summed over the per-user observation series of a group.
fn sum_sessions<'a>(
    series: impl IntoIterator<Item = &'a Vec<NaiveDateTime>>,
    reconstructor: &SessionReconstructor,
) -> SessionSummary {
    series
        .into_iter()
        .map(|stamps| reconstructor.reconstruct(stamps))
        .fold(SessionSummary::default(), |acc, s| SessionSummary {
            sessions: acc.sessions + s.sessions,
            hours: acc.hours + s.hours,
        })
}

fn avg_and_peak(concurrency: Option<&BTreeMap<NaiveDateTime, u32>>) -> (f64, u32) {
    let Some(counts) = concurrency else {
        return (0.0, 0);
    };
    let values: Vec<f64> = counts.values().map(|c| *c as f64).collect();
    (
        mean(&values).unwrap_or(0.0),
        counts.values().copied().max().unwrap_or(0),
    )
}

// ── Feature statistics ────────────────────────────────────────────────────────

#[derive(Default)]
struct FeatureAccumulator<'a> {
    checkouts: usize,
    users: HashMap<&'a str, Vec<NaiveDateTime>>,
    days: HashSet<NaiveDate>,
    first: Option<NaiveDateTime>,
    last: Option<NaiveDateTime>,
}

/// One row per feature seen in `records` or carrying a ceiling.
///
/// Ratios are `None` when the feature has no positive ceiling or
/// `period_hours` is not positive. Rows are ordered by feature name.
pub fn compute_feature_statistics(
    records: &[CheckoutRecord],
    ceilings: &BTreeMap<String, u32>,
    period_hours: f64,
    reconstructor: &SessionReconstructor,
    thresholds: &UtilizationThresholds,
) -> Vec<FeatureStat> {
    let mut acc: BTreeMap<&str, FeatureAccumulator<'_>> = BTreeMap::new();
    for r in records {
        let a = acc.entry(r.feature.as_str()).or_default();
        a.checkouts += 1;
        a.users.entry(r.user.as_str()).or_default().push(r.timestamp);
        a.days.insert(r.timestamp.date());
        a.first = Some(a.first.map_or(r.timestamp, |f| f.min(r.timestamp)));
        a.last = Some(a.last.map_or(r.timestamp, |l| l.max(r.timestamp)));
    }
    for feature in ceilings.keys() {
        acc.entry(feature.as_str()).or_default();
    }

    let concurrency = snapshot_concurrency(records);

    acc.into_iter()
        .map(|(feature, a)| {
            let (avg, peak) = avg_and_peak(concurrency.get(feature));
            let usage = sum_sessions(a.users.values(), reconstructor);
            let policy_max = ceilings.get(feature).copied();
            let active = UtilizationCalculator::active_utilization(avg, policy_max);
            let period =
                UtilizationCalculator::period_utilization(usage.hours, policy_max, period_hours);
            FeatureStat {
                feature: feature.to_string(),
                total_checkouts: a.checkouts,
                unique_users: a.users.len(),
                active_days: a.days.len(),
                avg_concurrent_when_active: avg,
                peak_concurrent: peak,
                usage_hours: usage.hours,
                sessions: usage.sessions,
                first_seen: a.first,
                last_seen: a.last,
                policy_max,
                active_utilization_pct: active,
                period_utilization_pct: period,
                utilization_status: UtilizationCalculator::classify(active, thresholds),
            }
        })
        .collect()
}

// ── Overuse ───────────────────────────────────────────────────────────────────

/// Features whose snapshot concurrency exceeded their ceiling.
///
/// Duration is estimated as `overuse snapshots × mean gap between snapshots`.
/// `snapshot_times` lists every snapshot read, including idle ones; with
/// fewer than two the sampling interval is used. A ceiling of zero counts as
/// no ceiling.
pub fn detect_overuse(
    records: &[CheckoutRecord],
    ceilings: &BTreeMap<String, u32>,
    snapshot_times: &[NaiveDateTime],
    sampling_interval_minutes: f64,
) -> Vec<OveruseReport> {
    let gaps = distinct_gaps_minutes(snapshot_times.iter().copied());
    let step_minutes = mean(&gaps).unwrap_or(sampling_interval_minutes);

    snapshot_concurrency(records)
        .into_iter()
        .filter_map(|(feature, counts)| {
            let policy_max = *ceilings.get(&feature).filter(|c| **c > 0)?;
            let over: Vec<(NaiveDateTime, u32)> = counts
                .iter()
                .filter(|(_, c)| **c > policy_max)
                .map(|(t, c)| (*t, *c))
                .collect();
            let (first, _) = *over.first()?;
            let (last, _) = *over.last()?;
            Some(OveruseReport {
                overuse_snapshots: over.len(),
                total_snapshots: counts.len(),
                overuse_pct: over.len() as f64 / counts.len() as f64 * 100.0,
                estimated_overuse_hours: over.len() as f64 * step_minutes / 60.0,
                peak_excess: over.iter().map(|(_, c)| c - policy_max).max().unwrap_or(0),
                first_occurrence: first,
                last_occurrence: last,
                feature,
                policy_max,
            })
        })
        .collect()
}

// ── User activity ─────────────────────────────────────────────────────────────

/// One row per user, heaviest usage first.
pub fn compute_user_activity(
    records: &[CheckoutRecord],
    reconstructor: &SessionReconstructor,
) -> Vec<UserStat> {
    struct UserAccumulator<'a> {
        company: &'a str,
        checkouts: usize,
        per_feature: HashMap<&'a str, Vec<NaiveDateTime>>,
        days: HashSet<NaiveDate>,
        first: NaiveDateTime,
        last: NaiveDateTime,
    }

    let mut acc: BTreeMap<&str, UserAccumulator<'_>> = BTreeMap::new();
    for r in records {
        let a = acc.entry(r.user.as_str()).or_insert_with(|| UserAccumulator {
            company: r.company.as_str(),
            checkouts: 0,
            per_feature: HashMap::new(),
            days: HashSet::new(),
            first: r.timestamp,
            last: r.timestamp,
        });
        a.checkouts += 1;
        a.per_feature
            .entry(r.feature.as_str())
            .or_default()
            .push(r.timestamp);
        a.days.insert(r.timestamp.date());
        a.first = a.first.min(r.timestamp);
        a.last = a.last.max(r.timestamp);
    }

    let mut stats: Vec<UserStat> = acc
        .into_iter()
        .map(|(user, a)| {
            let usage = sum_sessions(a.per_feature.values(), reconstructor);
            let per = |n: usize| if n > 0 { usage.hours / n as f64 } else { 0.0 };
            UserStat {
                user: user.to_string(),
                company: a.company.to_string(),
                checkouts: a.checkouts,
                features_used: a.per_feature.len(),
                usage_hours: usage.hours,
                sessions: usage.sessions,
                avg_session_hours: per(usage.sessions),
                active_days: a.days.len(),
                avg_hours_per_active_day: per(a.days.len()),
                avg_hours_per_feature: per(a.per_feature.len()),
                first_seen: a.first,
                last_seen: a.last,
            }
        })
        .collect();

    stats.sort_by(|a, b| {
        b.usage_hours
            .total_cmp(&a.usage_hours)
            .then_with(|| a.user.cmp(&b.user))
    });
    stats
}

// ── Company statistics ────────────────────────────────────────────────────────

/// One row per (company, feature) pair with usage, ordered by company then
/// feature.
///
/// `company_ceilings` maps `(company, feature)` to the company's own
/// entitlement; utilization is average concurrency against it.
pub fn compute_company_statistics(
    records: &[CheckoutRecord],
    company_ceilings: &BTreeMap<(String, String), u32>,
    reconstructor: &SessionReconstructor,
    thresholds: &UtilizationThresholds,
) -> Vec<CompanyFeatureStat> {
    let total_snapshots = records
        .iter()
        .map(|r| r.timestamp)
        .collect::<BTreeSet<_>>()
        .len();

    let mut groups: BTreeMap<(&str, &str), Vec<CheckoutRecord>> = BTreeMap::new();
    for r in records {
        groups
            .entry((r.company.as_str(), r.feature.as_str()))
            .or_default()
            .push(r.clone());
    }

    groups
        .into_iter()
        .map(|((company, feature), group)| {
            let concurrency = snapshot_concurrency(&group);
            let (avg, peak) = avg_and_peak(concurrency.get(feature));
            let active_snapshots = concurrency.get(feature).map_or(0, |c| c.len());

            let mut per_user: HashMap<&str, Vec<NaiveDateTime>> = HashMap::new();
            for r in &group {
                per_user.entry(r.user.as_str()).or_default().push(r.timestamp);
            }
            let usage = sum_sessions(per_user.values(), reconstructor);

            let policy_max = company_ceilings
                .get(&(company.to_string(), feature.to_string()))
                .copied();
            let utilization = UtilizationCalculator::active_utilization(avg, policy_max);

            CompanyFeatureStat {
                company: company.to_string(),
                feature: feature.to_string(),
                usage_count: group.len(),
                active_users: per_user.len(),
                active_snapshots,
                usage_ratio_pct: ratio_pct(active_snapshots as f64, total_snapshots as f64),
                usage_hours: usage.hours,
                avg_concurrent: avg,
                peak_concurrent: peak,
                policy_max,
                utilization_pct: utilization,
                utilization_status: UtilizationCalculator::classify(utilization, thresholds),
            }
        })
        .collect()
}
