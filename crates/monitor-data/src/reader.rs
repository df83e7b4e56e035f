//! Snapshot discovery and loading.
//!
//! Snapshots are plain files named `<prefix>_<YYYY-MM-DD>_<HH-MM-SS>.<ext>`
//! somewhere under a raw directory. Reading is fail-soft: a file that cannot
//! be read contributes zero records and the batch carries on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use monitor_core::error::{MonitorError, Result};
use monitor_core::models::{CheckoutRecord, DateRange, RawCheckoutRow};
use monitor_core::policy::company_of_user;
use monitor_core::settings::AnalysisConfig;
use monitor_core::time_utils::{parse_snapshot_filename, parse_timestamp, snapshot_filename_prefix};

use crate::parser::SnapshotParser;

/// One snapshot document known to a store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotId {
    pub timestamp: NaiveDateTime,
    pub path: PathBuf,
}

// ── SnapshotStore ─────────────────────────────────────────────────────────────

/// Source of raw snapshot documents.
pub trait SnapshotStore {
    /// Snapshots whose timestamp falls on a date inside `range`, oldest first.
    fn list_available_snapshots(&self, range: &DateRange) -> Vec<SnapshotId>;

    /// Raw text of one snapshot.
    fn read_snapshot(&self, id: &SnapshotId) -> Result<String>;
}

/// Snapshot files under a directory tree.
#[derive(Debug, Clone)]
pub struct DirectorySnapshotStore {
    root: PathBuf,
    prefix: String,
}

impl DirectorySnapshotStore {
    /// `prefix` restricts filenames to `<prefix>_...`; empty accepts any.
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.raw_dir.clone(), config.file_prefix.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every well-named snapshot file under the root, oldest first.
    pub fn find_snapshot_files(&self) -> Vec<SnapshotId> {
        if !self.root.exists() {
            warn!("Snapshot directory does not exist: {}", self.root.display());
            return Vec::new();
        }

        let mut ids: Vec<SnapshotId> = walkdir::WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?;
                if !self.prefix.is_empty()
                    && snapshot_filename_prefix(name).as_deref() != Some(self.prefix.as_str())
                {
                    return None;
                }
                let timestamp = parse_snapshot_filename(name)?;
                Some(SnapshotId {
                    timestamp,
                    path: entry.into_path(),
                })
            })
            .collect();

        ids.sort();
        ids
    }
}

impl SnapshotStore for DirectorySnapshotStore {
    fn list_available_snapshots(&self, range: &DateRange) -> Vec<SnapshotId> {
        let ids: Vec<SnapshotId> = self
            .find_snapshot_files()
            .into_iter()
            .filter(|id| range.contains(id.timestamp))
            .collect();
        debug!(
            "Found {} snapshots between {} and {} in {}",
            ids.len(),
            range.start(),
            range.end(),
            self.root.display()
        );
        ids
    }

    fn read_snapshot(&self, id: &SnapshotId) -> Result<String> {
        let bytes = std::fs::read(&id.path).map_err(|source| MonitorError::FileRead {
            path: id.path.clone(),
            source,
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Read and parse one snapshot. Read failures are logged and yield no records.
pub fn parse_snapshot<S: SnapshotStore + ?Sized>(
    store: &S,
    id: &SnapshotId,
    parser: &SnapshotParser,
    user_filter: Option<&HashMap<String, String>>,
) -> Vec<CheckoutRecord> {
    match store.read_snapshot(id) {
        Ok(text) => parser.parse(&text, id.timestamp, user_filter),
        Err(e) => {
            warn!("Skipping snapshot {}: {}", id.path.display(), e);
            Vec::new()
        }
    }
}

/// Records loaded for a range plus the timestamps of every snapshot read,
/// including snapshots that produced no records.
#[derive(Debug, Clone, Default)]
pub struct LoadedSnapshots {
    pub records: Vec<CheckoutRecord>,
    pub snapshot_times: Vec<NaiveDateTime>,
}

/// Load every record in `range`, calling `on_progress(done, total)` after
/// each snapshot.
pub fn load_records_with_progress<S, F>(
    store: &S,
    range: &DateRange,
    parser: &SnapshotParser,
    user_filter: Option<&HashMap<String, String>>,
    mut on_progress: F,
) -> LoadedSnapshots
where
    S: SnapshotStore + ?Sized,
    F: FnMut(usize, usize),
{
    let ids = store.list_available_snapshots(range);
    let total = ids.len();
    let mut loaded = LoadedSnapshots {
        records: Vec::new(),
        snapshot_times: Vec::with_capacity(total),
    };

    for (i, id) in ids.iter().enumerate() {
        loaded
            .records
            .extend(parse_snapshot(store, id, parser, user_filter));
        loaded.snapshot_times.push(id.timestamp);
        on_progress(i + 1, total);
    }

    debug!(
        "Loaded {} records from {} snapshots",
        loaded.records.len(),
        total
    );
    loaded
}

pub fn load_records<S: SnapshotStore + ?Sized>(
    store: &S,
    range: &DateRange,
    parser: &SnapshotParser,
    user_filter: Option<&HashMap<String, String>>,
) -> LoadedSnapshots {
    load_records_with_progress(store, range, parser, user_filter, |_, _| {})
}

/// Convert pre-parsed rows from a database-backed store.
///
/// Rows with an unparseable timestamp are dropped. A missing company is
/// derived from the username.
pub fn records_from_rows(rows: impl IntoIterator<Item = RawCheckoutRow>) -> Vec<CheckoutRecord> {
    let mut dropped = 0usize;
    let records: Vec<CheckoutRecord> = rows
        .into_iter()
        .filter_map(|row| {
            let Some(timestamp) = parse_timestamp(&row.ts) else {
                dropped += 1;
                return None;
            };
            let company = row
                .company
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| company_of_user(&row.user).to_string());
            Some(CheckoutRecord {
                timestamp,
                feature: row.feature,
                user: row.user,
                company,
                host: row.host,
            })
        })
        .collect();

    if dropped > 0 {
        debug!("Dropped {} rows with unparseable timestamps", dropped);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    const SNAPSHOT: &str = "\
Users of CAD:  (Total of 10 licenses issued;  Total of 1 licenses in use)
    acme-abcd ws01 /dev/pts/1 (v1) (lic01/27000 101), start Mon 1/15 9:02
";

    fn range(start: (i32, u32, u32), end: (i32, u32, u32)) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
        )
        .unwrap()
    }

    fn write(dir: &Path, name: &str, body: &[u8]) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_find_snapshot_files_filters_names_and_sorts() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lmstat_2024-01-15_10-05-00.txt", SNAPSHOT.as_bytes());
        write(tmp.path(), "lmstat_2024-01-15_10-00-00.txt", SNAPSHOT.as_bytes());
        write(&tmp.path().join("2024"), "lmstat_2024-01-14_23-55-00.txt", SNAPSHOT.as_bytes());
        write(tmp.path(), "other_2024-01-15_10-00-00.txt", SNAPSHOT.as_bytes());
        write(tmp.path(), "notes.txt", b"hello");

        let store = DirectorySnapshotStore::new(tmp.path(), "lmstat");
        let stamps: Vec<String> = store
            .find_snapshot_files()
            .iter()
            .map(|id| id.timestamp.to_string())
            .collect();
        assert_eq!(
            stamps,
            vec![
                "2024-01-14 23:55:00",
                "2024-01-15 10:00:00",
                "2024-01-15 10:05:00"
            ]
        );

        let any_prefix = DirectorySnapshotStore::new(tmp.path(), "");
        assert_eq!(any_prefix.find_snapshot_files().len(), 4);
    }

    #[test]
    fn test_list_available_snapshots_by_date() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lmstat_2024-01-14_23-59-59.txt", SNAPSHOT.as_bytes());
        write(tmp.path(), "lmstat_2024-01-15_00-00-00.txt", SNAPSHOT.as_bytes());
        write(tmp.path(), "lmstat_2024-01-16_23-59-59.txt", SNAPSHOT.as_bytes());
        write(tmp.path(), "lmstat_2024-01-17_00-00-00.txt", SNAPSHOT.as_bytes());

        let store = DirectorySnapshotStore::new(tmp.path(), "lmstat");
        let ids = store.list_available_snapshots(&range((2024, 1, 15), (2024, 1, 16)));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_missing_directory_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = DirectorySnapshotStore::new(tmp.path().join("absent"), "lmstat");
        let loaded = load_records(
            &store,
            &range((2024, 1, 1), (2024, 1, 31)),
            &SnapshotParser::default(),
            None,
        );
        assert!(loaded.records.is_empty());
        assert!(loaded.snapshot_times.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut body = SNAPSHOT.as_bytes().to_vec();
        body.extend_from_slice(b"\xff\xfe garbage\n");
        write(tmp.path(), "lmstat_2024-01-15_10-00-00.txt", &body);

        let store = DirectorySnapshotStore::new(tmp.path(), "lmstat");
        let loaded = load_records(
            &store,
            &range((2024, 1, 15), (2024, 1, 15)),
            &SnapshotParser::default(),
            None,
        );
        assert_eq!(loaded.records.len(), 1);
    }

    #[test]
    fn test_unreadable_snapshot_is_skipped() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lmstat_2024-01-15_10-00-00.txt", SNAPSHOT.as_bytes());
        let store = DirectorySnapshotStore::new(tmp.path(), "lmstat");
        let ghost = SnapshotId {
            timestamp: parse_timestamp("2024-01-15 10:05:00").unwrap(),
            path: tmp.path().join("lmstat_2024-01-15_10-05-00.txt"),
        };
        assert!(parse_snapshot(&store, &ghost, &SnapshotParser::default(), None).is_empty());
    }

    #[test]
    fn test_load_records_reports_progress() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lmstat_2024-01-15_10-00-00.txt", SNAPSHOT.as_bytes());
        write(tmp.path(), "lmstat_2024-01-15_10-05-00.txt", SNAPSHOT.as_bytes());
        let store = DirectorySnapshotStore::new(tmp.path(), "lmstat");

        let mut calls = Vec::new();
        let loaded = load_records_with_progress(
            &store,
            &range((2024, 1, 15), (2024, 1, 15)),
            &SnapshotParser::default(),
            None,
            |done, total| calls.push((done, total)),
        );
        assert_eq!(loaded.snapshot_times.len(), 2);
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(calls, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_records_from_rows_drops_bad_timestamps() {
        let rows = vec![
            RawCheckoutRow {
                ts: "2024-01-15 10:00:00".to_string(),
                feature: "CAD".to_string(),
                user: "acme-abcd".to_string(),
                company: None,
                host: "ws01".to_string(),
            },
            RawCheckoutRow {
                ts: "not a time".to_string(),
                feature: "CAD".to_string(),
                user: "beta-wxyz".to_string(),
                company: Some("BETA".to_string()),
                host: "ws02".to_string(),
            },
        ];
        let records = records_from_rows(rows);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].company, "acme");
    }
}
