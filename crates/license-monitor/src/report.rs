//! Plain-text report tables printed after an analysis run.

use std::fmt::Write;

use monitor_core::formatting::{
    format_hours, format_number, format_optional_count, format_optional_pct, format_timestamp,
};
use monitor_data::analysis::AnalysisResult;

fn heading(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{title}");
    let _ = writeln!(out, "{}", "─".repeat(title.chars().count()));
}

fn summary(out: &mut String, result: &AnalysisResult) {
    let m = &result.metadata;
    let _ = writeln!(out, "Period:      {}", m.range);
    let _ = writeln!(
        out,
        "Snapshots:   {} ({} records, {} selected)",
        format_number(m.snapshots_loaded as f64, 0),
        format_number(m.records_loaded as f64, 0),
        format_number(m.records_selected as f64, 0)
    );
    let _ = writeln!(
        out,
        "Sampling:    {} min, {} bins",
        format_number(m.sampling_interval_minutes, 1),
        m.granularity
    );
    let _ = writeln!(
        out,
        "Timing:      load {:.2}s, transform {:.2}s",
        m.load_time_seconds, m.transform_time_seconds
    );
}

fn feature_table(out: &mut String, result: &AnalysisResult) {
    heading(out, "Feature utilization");
    let _ = writeln!(
        out,
        "{:<20} {:>6} {:>6} {:>8} {:>6} {:>10} {:>6} {:>8} {:>8}  {}",
        "FEATURE", "USERS", "DAYS", "AVG", "PEAK", "HOURS", "MAX", "ACTIVE", "PERIOD", "STATUS"
    );
    for s in &result.feature_stats {
        let _ = writeln!(
            out,
            "{:<20} {:>6} {:>6} {:>8} {:>6} {:>10} {:>6} {:>8} {:>8}  {}",
            s.feature,
            s.unique_users,
            s.active_days,
            format_number(s.avg_concurrent_when_active, 2),
            s.peak_concurrent,
            format_hours(s.usage_hours),
            format_optional_count(s.policy_max),
            format_optional_pct(s.active_utilization_pct),
            format_optional_pct(s.period_utilization_pct),
            s.utilization_status
        );
    }
}

fn overuse_table(out: &mut String, result: &AnalysisResult) {
    if result.overuse.is_empty() {
        return;
    }
    heading(out, "Policy overuse");
    let _ = writeln!(
        out,
        "{:<20} {:>6} {:>10} {:>8} {:>10} {:>7}  {}",
        "FEATURE", "MAX", "SNAPSHOTS", "SHARE", "HOURS", "EXCESS", "FIRST / LAST"
    );
    for o in &result.overuse {
        let _ = writeln!(
            out,
            "{:<20} {:>6} {:>10} {:>8} {:>10} {:>7}  {} / {}",
            o.feature,
            o.policy_max,
            format!("{}/{}", o.overuse_snapshots, o.total_snapshots),
            format_optional_pct(Some(o.overuse_pct)),
            format_hours(o.estimated_overuse_hours),
            o.peak_excess,
            format_timestamp(o.first_occurrence),
            format_timestamp(o.last_occurrence)
        );
    }
}

fn company_table(out: &mut String, result: &AnalysisResult) {
    heading(out, "Company usage");
    let _ = writeln!(
        out,
        "{:<12} {:<20} {:>6} {:>8} {:>10} {:>8} {:>6} {:>6} {:>8}  {}",
        "COMPANY", "FEATURE", "USERS", "SHARE", "HOURS", "AVG", "PEAK", "MAX", "UTIL", "STATUS"
    );
    for s in &result.company_stats {
        let _ = writeln!(
            out,
            "{:<12} {:<20} {:>6} {:>8} {:>10} {:>8} {:>6} {:>6} {:>8}  {}",
            s.company,
            s.feature,
            s.active_users,
            format_optional_pct(s.usage_ratio_pct),
            format_hours(s.usage_hours),
            format_number(s.avg_concurrent, 2),
            s.peak_concurrent,
            format_optional_count(s.policy_max),
            format_optional_pct(s.utilization_pct),
            s.utilization_status
        );
    }
}

fn user_table(out: &mut String, result: &AnalysisResult, top: usize) {
    heading(out, &format!("Top {top} users"));
    let _ = writeln!(
        out,
        "{:<20} {:<12} {:>9} {:>10} {:>9} {:>6} {:>10}",
        "USER", "COMPANY", "FEATURES", "HOURS", "SESSIONS", "DAYS", "PER DAY"
    );
    for u in result.user_stats.iter().take(top) {
        let _ = writeln!(
            out,
            "{:<20} {:<12} {:>9} {:>10} {:>9} {:>6} {:>10}",
            u.user,
            u.company,
            u.features_used,
            format_hours(u.usage_hours),
            u.sessions,
            u.active_days,
            format_hours(u.avg_hours_per_active_day)
        );
    }
}

/// Render every table for `result`, listing at most `top_users` users.
pub fn render_report(result: &AnalysisResult, top_users: usize) -> String {
    let mut out = String::new();
    summary(&mut out, result);
    if result.is_empty() && result.feature_stats.is_empty() {
        let _ = writeln!(out, "\nNo license checkouts found for this period.");
        return out;
    }
    feature_table(&mut out, result);
    overuse_table(&mut out, result);
    company_table(&mut out, result);
    user_table(&mut out, result, top_users);
    out
}
