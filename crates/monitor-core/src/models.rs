use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};
use crate::time_utils;

// ── Records ───────────────────────────────────────────────────────────────────

/// One observed license checkout: `user` held `feature` on `host` at the
/// instant the snapshot was taken.
///
/// `(timestamp, feature, user)` identifies a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckoutRecord {
    /// Wall-clock time of the snapshot, second precision.
    pub timestamp: NaiveDateTime,
    pub feature: String,
    pub user: String,
    pub company: String,
    pub host: String,
}

impl CheckoutRecord {
    pub fn new(
        timestamp: NaiveDateTime,
        feature: impl Into<String>,
        user: impl Into<String>,
        company: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            feature: feature.into(),
            user: user.into(),
            company: company.into(),
            host: host.into(),
        }
    }
}

/// A pre-parsed row handed over by a database-backed store.
///
/// The timestamp is still a string; rows whose timestamp does not parse are
/// dropped when converted into [`CheckoutRecord`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCheckoutRow {
    pub ts: String,
    pub feature: String,
    pub user: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub host: String,
}

// ── DateRange ─────────────────────────────────────────────────────────────────

/// Inclusive calendar date range. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Build a range, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(MonitorError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Range covering `period` ending on `end` (inclusive).
    pub fn ending_on(end: NaiveDate, period: QuickPeriod) -> Self {
        Self {
            start: end - Duration::days(period.days()),
            end,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// First instant of the range (`start 00:00:00`).
    pub fn start_instant(&self) -> NaiveDateTime {
        time_utils::start_of_day(self.start)
    }

    /// Last instant of the range (`end 23:59:59`).
    pub fn end_instant(&self) -> NaiveDateTime {
        time_utils::end_of_day(self.end)
    }

    /// `end - start` in whole days; used for automatic granularity.
    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.contains_date(ts.date())
    }

    /// Number of hours covered by the whole range, both ends inclusive.
    pub fn period_hours(&self) -> f64 {
        (self.span_days() + 1) as f64 * 24.0
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// Preset report periods offered by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuickPeriod {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl QuickPeriod {
    pub fn days(&self) -> i64 {
        match self {
            Self::Weekly => 7,
            Self::Monthly => 30,
            Self::Quarterly => 90,
            Self::Yearly => 365,
        }
    }
}

impl FromStr for QuickPeriod {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" => Ok(Self::Yearly),
            other => Err(MonitorError::Config(format!("unknown period: {other}"))),
        }
    }
}

// ── Granularity ───────────────────────────────────────────────────────────────

/// Width of a time bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[serde(rename = "5min")]
    FiveMinute,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Granularity {
    /// strftime pattern a chart uses for axis ticks at this granularity.
    pub fn tick_format(&self) -> &'static str {
        match self {
            Self::FiveMinute => "%H:%M",
            Self::Hourly => "%m-%d %H:00",
            Self::Daily => "%Y-%m-%d",
            Self::Weekly => "%G-W%V",
            Self::Monthly => "%Y-%m",
        }
    }

    /// Start of the bin containing `ts`.
    ///
    /// Weekly bins start on the ISO Monday.
    pub fn floor(&self, ts: NaiveDateTime) -> NaiveDateTime {
        match self {
            Self::FiveMinute => time_utils::floor_to_minutes(ts, 5),
            Self::Hourly => time_utils::floor_to_minutes(ts, 60),
            Self::Daily => time_utils::start_of_day(ts.date()),
            Self::Weekly => time_utils::start_of_day(time_utils::iso_week_start(ts.date())),
            Self::Monthly => time_utils::start_of_day(time_utils::first_of_month(ts.date())),
        }
    }

    /// Human-readable bin key, unique per bin.
    pub fn label(&self, ts: NaiveDateTime) -> String {
        match self {
            Self::FiveMinute => ts.format("%Y-%m-%d %H:%M").to_string(),
            Self::Hourly => ts.format("%Y-%m-%d %H:00").to_string(),
            Self::Daily => ts.format("%Y-%m-%d").to_string(),
            Self::Weekly => time_utils::iso_week_label(ts.date()),
            Self::Monthly => ts.format("%Y-%m").to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FiveMinute => "5min",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "5min" | "5-minute" | "five_minute" => Ok(Self::FiveMinute),
            "hourly" | "hour" => Ok(Self::Hourly),
            "daily" | "day" => Ok(Self::Daily),
            "weekly" | "week" => Ok(Self::Weekly),
            "monthly" | "month" => Ok(Self::Monthly),
            other => Err(MonitorError::InvalidGranularity(other.to_string())),
        }
    }
}

// ── Filtering ─────────────────────────────────────────────────────────────────

/// Restricts a record set by feature, company and user.
///
/// `None` places no restriction; `Some` of an empty set selects nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub features: Option<BTreeSet<String>>,
    pub companies: Option<BTreeSet<String>>,
    pub users: Option<BTreeSet<String>>,
}

impl RecordFilter {
    pub fn is_unrestricted(&self) -> bool {
        self.features.is_none() && self.companies.is_none() && self.users.is_none()
    }

    pub fn matches(&self, record: &CheckoutRecord) -> bool {
        fn allowed(set: &Option<BTreeSet<String>>, value: &str) -> bool {
            set.as_ref().map_or(true, |s| s.contains(value))
        }
        allowed(&self.features, &record.feature)
            && allowed(&self.companies, &record.company)
            && allowed(&self.users, &record.user)
    }

    pub fn apply(&self, records: Vec<CheckoutRecord>) -> Vec<CheckoutRecord> {
        if self.is_unrestricted() {
            return records;
        }
        records.into_iter().filter(|r| self.matches(r)).collect()
    }

    pub fn allows_feature(&self, feature: &str) -> bool {
        self.features.as_ref().map_or(true, |s| s.contains(feature))
    }
}

/// How usernames are accepted when no explicit user list is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserMatching {
    /// Only `company-xxxx` shaped names; everything else is dropped.
    #[default]
    Strict,
    /// Every user is kept; company falls back to `"unknown"`.
    Permissive,
}

// ── Sessions and bins ─────────────────────────────────────────────────────────

/// A maximal run of observations of one (user, feature) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub observations: usize,
    /// `(end - start) + sampling interval`, in hours.
    pub duration_hours: f64,
}

/// Concurrency of one feature inside one time bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBin {
    pub label: String,
    pub start: NaiveDateTime,
    pub feature: String,
    /// Highest per-snapshot checkout count seen inside the bin.
    pub peak_concurrent: u32,
    pub unique_users: u32,
}

/// Output of the time-bin aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBinSeries {
    pub bins: Vec<TimeBin>,
    pub granularity: Granularity,
    pub tick_format: String,
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Utilization bucket of a feature or company/feature pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UtilizationStatus {
    EffectiveUse,
    PartialUse,
    Underutilized,
    NoPolicy,
}

impl UtilizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EffectiveUse => "EFFECTIVE_USE",
            Self::PartialUse => "PARTIAL_USE",
            Self::Underutilized => "UNDERUTILIZED",
            Self::NoPolicy => "NO_POLICY",
        }
    }
}

impl fmt::Display for UtilizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary row for one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStat {
    pub feature: String,
    pub total_checkouts: usize,
    pub unique_users: usize,
    pub active_days: usize,
    pub avg_concurrent_when_active: f64,
    pub peak_concurrent: u32,
    pub usage_hours: f64,
    pub sessions: usize,
    pub first_seen: Option<NaiveDateTime>,
    pub last_seen: Option<NaiveDateTime>,
    pub policy_max: Option<u32>,
    pub active_utilization_pct: Option<f64>,
    pub period_utilization_pct: Option<f64>,
    pub utilization_status: UtilizationStatus,
}

/// Summary row for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStat {
    pub user: String,
    pub company: String,
    pub checkouts: usize,
    pub features_used: usize,
    pub usage_hours: f64,
    pub sessions: usize,
    pub avg_session_hours: f64,
    pub active_days: usize,
    pub avg_hours_per_active_day: f64,
    pub avg_hours_per_feature: f64,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
}

/// Summary row for one (company, feature) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyFeatureStat {
    pub company: String,
    pub feature: String,
    pub usage_count: usize,
    pub active_users: usize,
    pub active_snapshots: usize,
    /// Share of all loaded snapshots in which the pair was active.
    pub usage_ratio_pct: Option<f64>,
    pub usage_hours: f64,
    pub avg_concurrent: f64,
    pub peak_concurrent: u32,
    pub policy_max: Option<u32>,
    pub utilization_pct: Option<f64>,
    pub utilization_status: UtilizationStatus,
}

/// Snapshots in which a feature ran above its policy ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OveruseReport {
    pub feature: String,
    pub policy_max: u32,
    pub overuse_snapshots: usize,
    pub total_snapshots: usize,
    pub overuse_pct: f64,
    pub estimated_overuse_hours: f64,
    pub peak_excess: u32,
    pub first_occurrence: NaiveDateTime,
    pub last_occurrence: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_date_range_rejects_inverted() {
        let err = DateRange::new(date(2024, 3, 2), date(2024, 3, 1)).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidDateRange { .. }));
    }

    #[test]
    fn test_date_range_single_day() {
        let range = DateRange::new(date(2024, 3, 1), date(2024, 3, 1)).unwrap();
        assert_eq!(range.span_days(), 0);
        assert!((range.period_hours() - 24.0).abs() < f64::EPSILON);
        assert_eq!(range.end_instant(), ts("2024-03-01 23:59:59"));
        assert!(range.contains(ts("2024-03-01 23:59:59")));
        assert!(!range.contains(ts("2024-03-02 00:00:00")));
        assert_eq!(range.to_string(), "2024-03-01 to 2024-03-01");
    }

    #[test]
    fn test_date_range_ending_on_quick_period() {
        let range = DateRange::ending_on(date(2024, 4, 30), QuickPeriod::Monthly);
        assert_eq!(range.start(), date(2024, 3, 31));
        assert_eq!(range.span_days(), 30);
    }

    #[test]
    fn test_quick_period_from_str() {
        assert_eq!("Quarterly".parse::<QuickPeriod>().unwrap(), QuickPeriod::Quarterly);
        assert!("daily".parse::<QuickPeriod>().is_err());
    }

    #[test]
    fn test_granularity_from_str() {
        assert_eq!("5min".parse::<Granularity>().unwrap(), Granularity::FiveMinute);
        assert_eq!("WEEKLY".parse::<Granularity>().unwrap(), Granularity::Weekly);
        assert!("yearly".parse::<Granularity>().is_err());
    }

    #[test]
    fn test_granularity_floor_and_label() {
        let t = ts("2024-01-03 10:07:42");
        assert_eq!(Granularity::FiveMinute.floor(t), ts("2024-01-03 10:05:00"));
        assert_eq!(Granularity::Hourly.floor(t), ts("2024-01-03 10:00:00"));
        assert_eq!(Granularity::Daily.floor(t), ts("2024-01-03 00:00:00"));
        // 2024-01-03 is a Wednesday; the ISO week starts Monday the 1st.
        assert_eq!(Granularity::Weekly.floor(t), ts("2024-01-01 00:00:00"));
        assert_eq!(Granularity::Monthly.floor(t), ts("2024-01-01 00:00:00"));

        assert_eq!(Granularity::FiveMinute.label(t), "2024-01-03 10:07");
        assert_eq!(Granularity::Hourly.label(t), "2024-01-03 10:00");
        assert_eq!(Granularity::Weekly.label(t), "2024-W01");
        assert_eq!(Granularity::Monthly.label(t), "2024-01");
    }

    #[test]
    fn test_record_filter_semantics() {
        let rec = CheckoutRecord::new(ts("2024-01-01 10:00:00"), "CAD", "acme-abcd", "acme", "h1");

        assert!(RecordFilter::default().matches(&rec));

        let only_cad = RecordFilter {
            features: Some(BTreeSet::from(["CAD".to_string()])),
            ..Default::default()
        };
        assert!(only_cad.matches(&rec));

        let nothing = RecordFilter {
            companies: Some(BTreeSet::new()),
            ..Default::default()
        };
        assert!(!nothing.matches(&rec));
        assert!(nothing.apply(vec![rec]).is_empty());
    }

    #[test]
    fn test_utilization_status_serializes_screaming() {
        let json = serde_json::to_string(&UtilizationStatus::EffectiveUse).unwrap();
        assert_eq!(json, "\"EFFECTIVE_USE\"");
        assert_eq!(UtilizationStatus::NoPolicy.to_string(), "NO_POLICY");
    }
}
