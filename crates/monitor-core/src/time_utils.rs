use std::sync::OnceLock;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;
use tracing::warn;

// ── System timezone detection ─────────────────────────────────────────────────

/// Detect the IANA timezone name of the running system.
///
/// Falls back to `"UTC"` if detection fails.
pub fn get_system_timezone() -> String {
    iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string())
}

// ── TimezoneHandler ───────────────────────────────────────────────────────────

/// Wall-clock view of the license server's timezone.
///
/// Snapshot timestamps carry no offset; they are the server's local time.
/// The handler turns "now" into the same naive wall-clock form so the two
/// can be compared.
#[derive(Debug, Clone, Copy)]
pub struct TimezoneHandler {
    tz: Tz,
}

impl TimezoneHandler {
    /// Create a handler for `tz_name`; `"auto"` resolves the system timezone.
    ///
    /// Unknown names fall back to UTC with a warning.
    pub fn new(tz_name: &str) -> Self {
        let name = if tz_name.eq_ignore_ascii_case("auto") {
            get_system_timezone()
        } else {
            tz_name.to_string()
        };
        let tz = name.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                "TimezoneHandler: unrecognised timezone \"{}\", falling back to UTC",
                name
            );
            Tz::UTC
        });
        Self { tz }
    }

    /// Validate that `tz_name` is a recognised IANA timezone identifier.
    pub fn validate_timezone(tz_name: &str) -> bool {
        tz_name.parse::<Tz>().is_ok()
    }

    /// Current wall-clock time in the handler's timezone, truncated to seconds.
    pub fn now(&self) -> NaiveDateTime {
        let local = Utc::now().with_timezone(&self.tz).naive_local();
        local.with_nanosecond(0).unwrap_or(local)
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse the timestamp embedded in a snapshot filename such as
/// `lmstat_2024-01-15_10-30-00.txt`.
///
/// Returns `None` when the name does not follow
/// `<prefix>_<YYYY-MM-DD>_<HH-MM-SS>.<ext>`.
pub fn parse_snapshot_filename(name: &str) -> Option<NaiveDateTime> {
    let caps = filename_regex().captures(name)?;
    let stamp = format!("{} {}", &caps[2], caps[3].replace('-', ":"));
    NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S").ok()
}

/// Prefix part of a snapshot filename (`lmstat` for `lmstat_2024-...txt`).
pub fn snapshot_filename_prefix(name: &str) -> Option<String> {
    filename_regex()
        .captures(name)
        .map(|caps| caps[1].to_string())
}

/// Parse a naive wall-clock timestamp as stored by ingestion tools.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    const FMTS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    let s = s.trim();
    FMTS.iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

// ── Calendar arithmetic ───────────────────────────────────────────────────────

pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    start_of_day(date) + Duration::days(1) - Duration::seconds(1)
}

/// Floor `ts` to a multiple of `minutes` within its hour (or to the hour
/// when `minutes >= 60`).
pub fn floor_to_minutes(ts: NaiveDateTime, minutes: u32) -> NaiveDateTime {
    let minute = if minutes >= 60 {
        0
    } else {
        ts.minute() - ts.minute() % minutes.max(1)
    };
    ts.date()
        .and_hms_opt(ts.hour(), minute, 0)
        .unwrap_or(ts)
}

/// Monday of the ISO week containing `date`.
pub fn iso_week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// ISO year-week label, e.g. `2024-W01`.
pub fn iso_week_label(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{:04}-W{:02}", week.year(), week.week())
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the month after the month containing `date`.
pub fn next_month(date: NaiveDate) -> NaiveDate {
    let (y, m) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(date)
}

/// Hours between two instants as a float.
pub fn hours_between(start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    (end - start).num_seconds() as f64 / 3600.0
}

/// Minutes between two instants as a float.
pub fn minutes_between(start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    (end - start).num_seconds() as f64 / 60.0
}

fn filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+)_(\d{4}-\d{2}-\d{2})_(\d{2}-\d{2}-\d{2})\.[^.]+$")
            .expect("regex is valid")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_parse_snapshot_filename() {
        assert_eq!(
            parse_snapshot_filename("lmstat_2024-01-15_10-30-05.txt"),
            Some(ts("2024-01-15 10:30:05"))
        );
        assert_eq!(
            parse_snapshot_filename("server_a_2024-01-15_00-00-00.log"),
            Some(ts("2024-01-15 00:00:00"))
        );
        assert_eq!(parse_snapshot_filename("lmstat_2024-01-15.txt"), None);
        assert_eq!(parse_snapshot_filename("lmstat_2024-13-40_10-30-05.txt"), None);
        assert_eq!(parse_snapshot_filename("notes.txt"), None);
    }

    #[test]
    fn test_snapshot_filename_prefix() {
        assert_eq!(
            snapshot_filename_prefix("lmstat_2024-01-15_10-30-05.txt").as_deref(),
            Some("lmstat")
        );
        assert_eq!(snapshot_filename_prefix("readme.md"), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = ts("2024-01-15 10:30:00");
        assert_eq!(parse_timestamp("2024-01-15 10:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-15T10:30:00"), Some(expected));
        assert_eq!(parse_timestamp(" 2024-01-15 10:30 "), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_floor_to_minutes() {
        assert_eq!(floor_to_minutes(ts("2024-01-15 10:34:59"), 5), ts("2024-01-15 10:30:00"));
        assert_eq!(floor_to_minutes(ts("2024-01-15 10:35:00"), 5), ts("2024-01-15 10:35:00"));
        assert_eq!(floor_to_minutes(ts("2024-01-15 10:59:59"), 60), ts("2024-01-15 10:00:00"));
    }

    #[test]
    fn test_day_bounds() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(start_of_day(d), ts("2024-02-29 00:00:00"));
        assert_eq!(end_of_day(d), ts("2024-02-29 23:59:59"));
    }

    #[test]
    fn test_iso_week_helpers() {
        // 2021-01-03 is a Sunday belonging to ISO week 53 of 2020.
        let d = NaiveDate::from_ymd_opt(2021, 1, 3).unwrap();
        assert_eq!(iso_week_label(d), "2020-W53");
        assert_eq!(iso_week_start(d), NaiveDate::from_ymd_opt(2020, 12, 28).unwrap());
    }

    #[test]
    fn test_month_helpers() {
        let d = NaiveDate::from_ymd_opt(2024, 12, 17).unwrap();
        assert_eq!(first_of_month(d), NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
        assert_eq!(next_month(d), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    }

    #[test]
    fn test_hours_between() {
        let h = hours_between(ts("2024-01-15 10:00:00"), ts("2024-01-15 11:30:00"));
        assert!((h - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_timezone_handler_fallback() {
        assert!(TimezoneHandler::validate_timezone("Europe/Berlin"));
        assert!(!TimezoneHandler::validate_timezone("Mars/Olympus"));
        let handler = TimezoneHandler::new("Mars/Olympus");
        assert_eq!(handler.tz(), Tz::UTC);
    }
}
