//! CSV export of analysis results.
//!
//! Writes the selected records, time bins and the feature, company and user
//! tables, plus the run metadata as JSON. Missing values (no policy, no
//! ratio) are written as empty cells.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use monitor_core::error::{MonitorError, Result};
use monitor_core::formatting::{format_optional_timestamp, format_timestamp, round_to};
use monitor_core::models::{
    CheckoutRecord, CompanyFeatureStat, FeatureStat, TimeBin, UserStat,
};

use crate::analysis::{AnalysisMetadata, AnalysisResult};

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn pct(value: Option<f64>) -> String {
    opt(value.map(|v| round_to(v, 2)))
}

/// Pretty-printed JSON of the run metadata, flushed before returning.
fn write_metadata<W: Write>(writer: &mut W, metadata: &AnalysisMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    writeln!(writer, "{json}")?;
    writer.flush()?;
    Ok(())
}

/// CSV writer for analysis tables.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    include_header: bool,
    delimiter: char,
}

impl Default for CsvExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvExporter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            include_header: true,
            delimiter: ',',
        }
    }

    #[must_use]
    pub fn with_header(mut self, include: bool) -> Self {
        self.include_header = include;
        self
    }

    #[must_use]
    pub fn with_delimiter(mut self, delim: char) -> Self {
        self.delimiter = delim;
        self
    }

    fn escape_field(&self, value: &str) -> String {
        if value.contains(self.delimiter)
            || value.contains('"')
            || value.contains('\n')
            || value.contains('\r')
        {
            format!("\"{}\"", value.replace('"', "\"\""))
        } else {
            value.to_string()
        }
    }

    fn write_row<W: Write, S: AsRef<str>>(&self, writer: &mut W, fields: &[S]) -> Result<()> {
        let line: Vec<String> = fields
            .iter()
            .map(|f| self.escape_field(f.as_ref()))
            .collect();
        writeln!(writer, "{}", line.join(&self.delimiter.to_string()))?;
        Ok(())
    }

    fn write_header<W: Write>(&self, writer: &mut W, header: &[&str]) -> Result<()> {
        if self.include_header {
            self.write_row(writer, header)?;
        }
        Ok(())
    }

    pub fn write_records<W: Write>(&self, writer: &mut W, records: &[CheckoutRecord]) -> Result<()> {
        self.write_header(writer, &["timestamp", "feature", "user", "company", "host"])?;
        for r in records {
            self.write_row(
                writer,
                &[
                    format_timestamp(r.timestamp),
                    r.feature.clone(),
                    r.user.clone(),
                    r.company.clone(),
                    r.host.clone(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn write_time_bins<W: Write>(&self, writer: &mut W, bins: &[TimeBin]) -> Result<()> {
        self.write_header(
            writer,
            &["time_bin", "bin_start", "feature", "concurrent", "unique_users"],
        )?;
        for b in bins {
            self.write_row(
                writer,
                &[
                    b.label.clone(),
                    format_timestamp(b.start),
                    b.feature.clone(),
                    b.peak_concurrent.to_string(),
                    b.unique_users.to_string(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn write_feature_stats<W: Write>(&self, writer: &mut W, stats: &[FeatureStat]) -> Result<()> {
        self.write_header(
            writer,
            &[
                "feature",
                "total_checkouts",
                "unique_users",
                "active_days",
                "avg_concurrent",
                "peak_concurrent",
                "usage_hours",
                "sessions",
                "first_seen",
                "last_seen",
                "policy_max",
                "active_utilization_pct",
                "period_utilization_pct",
                "utilization_status",
            ],
        )?;
        for s in stats {
            self.write_row(
                writer,
                &[
                    s.feature.clone(),
                    s.total_checkouts.to_string(),
                    s.unique_users.to_string(),
                    s.active_days.to_string(),
                    round_to(s.avg_concurrent_when_active, 2).to_string(),
                    s.peak_concurrent.to_string(),
                    round_to(s.usage_hours, 2).to_string(),
                    s.sessions.to_string(),
                    format_optional_timestamp(s.first_seen),
                    format_optional_timestamp(s.last_seen),
                    opt(s.policy_max),
                    pct(s.active_utilization_pct),
                    pct(s.period_utilization_pct),
                    s.utilization_status.to_string(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn write_company_stats<W: Write>(
        &self,
        writer: &mut W,
        period: &str,
        stats: &[CompanyFeatureStat],
    ) -> Result<()> {
        self.write_header(
            writer,
            &[
                "period",
                "company",
                "feature",
                "usage_count",
                "active_users",
                "active_snapshots",
                "usage_hours",
                "usage_ratio_percent",
                "avg_concurrent",
                "peak_concurrent",
                "policy_max",
                "utilization_pct",
                "utilization_status",
            ],
        )?;
        for s in stats {
            self.write_row(
                writer,
                &[
                    period.to_string(),
                    s.company.clone(),
                    s.feature.clone(),
                    s.usage_count.to_string(),
                    s.active_users.to_string(),
                    s.active_snapshots.to_string(),
                    round_to(s.usage_hours, 2).to_string(),
                    pct(s.usage_ratio_pct),
                    round_to(s.avg_concurrent, 2).to_string(),
                    s.peak_concurrent.to_string(),
                    opt(s.policy_max),
                    pct(s.utilization_pct),
                    s.utilization_status.to_string(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn write_user_stats<W: Write>(&self, writer: &mut W, stats: &[UserStat]) -> Result<()> {
        self.write_header(
            writer,
            &[
                "user",
                "company",
                "checkouts",
                "features_used",
                "usage_hours",
                "sessions",
                "avg_session_hours",
                "active_days",
                "avg_hours_per_active_day",
                "avg_hours_per_feature",
                "first_seen",
                "last_seen",
            ],
        )?;
        for s in stats {
            self.write_row(
                writer,
                &[
                    s.user.clone(),
                    s.company.clone(),
                    s.checkouts.to_string(),
                    s.features_used.to_string(),
                    round_to(s.usage_hours, 2).to_string(),
                    s.sessions.to_string(),
                    round_to(s.avg_session_hours, 2).to_string(),
                    s.active_days.to_string(),
                    round_to(s.avg_hours_per_active_day, 2).to_string(),
                    round_to(s.avg_hours_per_feature, 2).to_string(),
                    format_timestamp(s.first_seen),
                    format_timestamp(s.last_seen),
                ],
            )?;
        }
        Ok(())
    }

    /// Write every table of `result` into `dir`, returning the files written.
    pub fn export_all(&self, result: &AnalysisResult, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let range = &result.metadata.range;
        let period = format!("{}_{}", range.start(), range.end());
        let mut written = Vec::new();

        let mut emit = |path: PathBuf, f: &dyn Fn(&mut BufWriter<File>) -> Result<()>| -> Result<()> {
            let write_err = |source: std::io::Error| MonitorError::FileWrite {
                path: path.clone(),
                source,
            };
            let mut writer = BufWriter::new(File::create(&path).map_err(write_err)?);
            f(&mut writer)?;
            writer.flush().map_err(write_err)?;
            written.push(path);
            Ok(())
        };
        let csv = |name: &str| dir.join(format!("{name}_{period}.csv"));

        emit(csv("records"), &|w| self.write_records(w, &result.records))?;
        emit(csv("timeline"), &|w| self.write_time_bins(w, &result.time_bins.bins))?;
        emit(csv("features"), &|w| self.write_feature_stats(w, &result.feature_stats))?;
        emit(csv("companies"), &|w| {
            self.write_company_stats(w, &period, &result.company_stats)
        })?;
        emit(csv("users"), &|w| self.write_user_stats(w, &result.user_stats))?;
        emit(dir.join(format!("metadata_{period}.json")), &|w| {
            write_metadata(w, &result.metadata)
        })?;

        info!("Exported {} report files to {}", written.len(), dir.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use monitor_core::models::UtilizationStatus;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn render<F: FnOnce(&mut Vec<u8>) -> Result<()>>(f: F) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_escape_field() {
        let exporter = CsvExporter::new();
        assert_eq!(exporter.escape_field("plain"), "plain");
        assert_eq!(exporter.escape_field("a,b"), "\"a,b\"");
        assert_eq!(exporter.escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_write_records() {
        let records = vec![CheckoutRecord::new(
            ts("2024-01-15 10:00:00"),
            "CAD",
            "acme-abcd",
            "acme",
            "ws01",
        )];
        let out = render(|w| CsvExporter::new().write_records(w, &records));
        assert_eq!(
            out,
            "timestamp,feature,user,company,host\n2024-01-15 10:00:00,CAD,acme-abcd,acme,ws01\n"
        );
    }

    #[test]
    fn test_write_feature_stats_blank_for_missing_policy() {
        let stat = FeatureStat {
            feature: "SIM".to_string(),
            total_checkouts: 0,
            unique_users: 0,
            active_days: 0,
            avg_concurrent_when_active: 0.0,
            peak_concurrent: 0,
            usage_hours: 0.0,
            sessions: 0,
            first_seen: None,
            last_seen: None,
            policy_max: None,
            active_utilization_pct: None,
            period_utilization_pct: None,
            utilization_status: UtilizationStatus::NoPolicy,
        };
        let out = render(|w| CsvExporter::new().with_header(false).write_feature_stats(w, &[stat]));
        assert_eq!(out, "SIM,0,0,0,0,0,0,0,,,,,,NO_POLICY\n");
    }

    #[test]
    fn test_write_with_semicolon_delimiter() {
        let bins = vec![TimeBin {
            label: "2024-01-15".to_string(),
            start: ts("2024-01-15 00:00:00"),
            feature: "CAD".to_string(),
            peak_concurrent: 3,
            unique_users: 4,
        }];
        let out = render(|w| {
            CsvExporter::new()
                .with_header(false)
                .with_delimiter(';')
                .write_time_bins(w, &bins)
        });
        assert_eq!(out, "2024-01-15;2024-01-15 00:00:00;CAD;3;4\n");
    }

    #[test]
    fn test_export_all_writes_every_table() {
        use crate::analysis::{analyze, AnalysisRequest};
        use crate::reader::DirectorySnapshotStore;
        use chrono::NaiveDate;
        use monitor_core::models::DateRange;
        use monitor_core::policy::PolicyTable;
        use monitor_core::settings::AnalysisConfig;
        use tempfile::TempDir;

        let raw = TempDir::new().unwrap();
        std::fs::write(
            raw.path().join("lmstat_2024-01-15_10-00-00.txt"),
            "Users of CAD:  (Total of 10 licenses issued;  Total of 1 licenses in use)\n\n    \
             acme-jdoe ws01 /dev/pts/1 (v1) (lic01/27000 101), start Mon 1/15 9:02\n",
        )
        .unwrap();
        let config = AnalysisConfig {
            raw_dir: raw.path().to_path_buf(),
            ..Default::default()
        };
        let store = DirectorySnapshotStore::from_config(&config);
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let request = AnalysisRequest::new(DateRange::new(d, d).unwrap());
        let result = analyze(&request, &store, &PolicyTable::new(), &config, |_, _| {}).unwrap();

        let out = TempDir::new().unwrap();
        let files = CsvExporter::new().export_all(&result, out.path()).unwrap();
        assert_eq!(files.len(), 6);
        for f in &files {
            assert!(f.exists());
        }

        let companies = std::fs::read_to_string(
            out.path().join("companies_2024-01-15_2024-01-15.csv"),
        )
        .unwrap();
        let mut lines = companies.lines();
        assert!(lines.next().unwrap().starts_with("period,company,feature,usage_count"));
        assert!(lines
            .next()
            .unwrap()
            .starts_with("2024-01-15_2024-01-15,acme,CAD,1,1,1,"));
    }

    struct FailingFlush;

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }
    }

    fn sample_result() -> AnalysisResult {
        use crate::analysis::{analyze, AnalysisRequest};
        use crate::reader::DirectorySnapshotStore;
        use chrono::NaiveDate;
        use monitor_core::models::DateRange;
        use monitor_core::policy::PolicyTable;
        use monitor_core::settings::AnalysisConfig;

        let raw = tempfile::TempDir::new().unwrap();
        let config = AnalysisConfig {
            raw_dir: raw.path().to_path_buf(),
            ..Default::default()
        };
        let store = DirectorySnapshotStore::from_config(&config);
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let request = AnalysisRequest::new(DateRange::new(d, d).unwrap());
        analyze(&request, &store, &PolicyTable::new(), &config, |_, _| {}).unwrap()
    }

    #[test]
    fn test_write_metadata_reports_flush_failure() {
        let result = sample_result();
        let err = write_metadata(&mut FailingFlush, &result.metadata).unwrap_err();
        assert!(matches!(err, MonitorError::Io(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_write_metadata_is_valid_json() {
        let result = sample_result();
        let mut buf = Vec::new();
        write_metadata(&mut buf, &result.metadata).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["snapshots_loaded"], 0);
    }

    #[test]
    fn test_export_all_reports_create_failure_as_write_error() {
        let result = sample_result();
        let out = tempfile::TempDir::new().unwrap();
        // A directory where the first CSV should go makes creation fail.
        std::fs::create_dir(out.path().join("records_2024-01-15_2024-01-15.csv")).unwrap();

        let err = CsvExporter::new().export_all(&result, out.path()).unwrap_err();
        match err {
            MonitorError::FileWrite { path, .. } => {
                assert!(path.ends_with("records_2024-01-15_2024-01-15.csv"));
            }
            other => panic!("expected FileWrite, got {other:?}"),
        }
    }
}
