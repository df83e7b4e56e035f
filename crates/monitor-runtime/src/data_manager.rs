//! TTL-cached data manager for snapshot loading.
//!
//! Loading a month of snapshots means reading thousands of files, while
//! changing a filter or the granularity only reruns the cheap aggregation
//! steps. [`DataManager`] keeps the parsed snapshots per date range with a
//! time-to-live and falls back to the previous cache entry when a load fails.
//! Snapshot reads are fail-soft, so a load only fails on a configuration
//! error and is not retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use monitor_core::error::{MonitorError, Result};
use monitor_core::models::DateRange;
use monitor_core::policy::PolicyTable;
use monitor_core::settings::AnalysisConfig;
use monitor_data::analysis::{analyze_loaded, load_snapshots, AnalysisRequest, AnalysisResult};
use monitor_data::reader::{LoadedSnapshots, SnapshotStore};

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Default cache TTL in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

#[derive(Debug)]
struct CacheEntry {
    loaded: Arc<LoadedSnapshots>,
    fetched_at: Instant,
}

// ── DataManager ───────────────────────────────────────────────────────────────

/// Snapshot cache in front of a [`SnapshotStore`].
pub struct DataManager<S> {
    store: S,
    policy: PolicyTable,
    config: AnalysisConfig,
    cache_ttl: Duration,
    cache: HashMap<DateRange, CacheEntry>,
    last_error: Option<String>,
}

impl<S: SnapshotStore> DataManager<S> {
    pub fn new(store: S, policy: PolicyTable, config: AnalysisConfig, cache_ttl_secs: u64) -> Self {
        Self {
            store,
            policy,
            config,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            cache: HashMap::new(),
            last_error: None,
        }
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    // ── Public API ────────────────────────────────────────────────────────

    /// Snapshots for `range`, from the cache while the entry is fresh.
    ///
    /// On failure the stale entry for the range is returned if there is one.
    pub fn get_snapshots<F>(
        &mut self,
        range: &DateRange,
        force_refresh: bool,
        mut on_progress: F,
    ) -> Option<Arc<LoadedSnapshots>>
    where
        F: FnMut(usize, usize),
    {
        if !force_refresh && self.is_cache_valid(range) {
            tracing::debug!(%range, "returning cached snapshots");
            return self.cache.get(range).map(|e| Arc::clone(&e.loaded));
        }

        match load_snapshots(&self.store, range, &self.policy, &self.config, &mut on_progress) {
            Ok(loaded) => {
                tracing::debug!(
                    %range,
                    snapshots = loaded.snapshot_times.len(),
                    records = loaded.records.len(),
                    "snapshot cache updated"
                );
                let loaded = Arc::new(loaded);
                self.evict_expired();
                self.cache.insert(
                    *range,
                    CacheEntry {
                        loaded: Arc::clone(&loaded),
                        fetched_at: Instant::now(),
                    },
                );
                self.last_error = None;
                Some(loaded)
            }
            Err(e) => {
                tracing::warn!(error = %e, "load failed; falling back to cached snapshots");
                self.last_error = Some(e.to_string());
                self.cache.get(range).map(|e| Arc::clone(&e.loaded))
            }
        }
    }

    /// Run the analysis for `request` on cached or freshly loaded snapshots.
    pub fn analyze<F>(
        &mut self,
        request: &AnalysisRequest,
        force_refresh: bool,
        on_progress: F,
    ) -> Result<AnalysisResult>
    where
        F: FnMut(usize, usize),
    {
        self.config.validate()?;

        let load_start = Instant::now();
        let loaded = self
            .get_snapshots(&request.range, force_refresh, on_progress)
            .ok_or_else(|| {
                MonitorError::Config(
                    self.last_error
                        .clone()
                        .unwrap_or_else(|| "no snapshots available".to_string()),
                )
            })?;
        let load_time = load_start.elapsed().as_secs_f64();

        Ok(analyze_loaded(
            &loaded,
            request,
            &self.policy,
            &self.config,
            load_time,
        ))
    }

    /// Drop every cache entry.
    pub fn invalidate_cache(&mut self) {
        self.cache.clear();
        tracing::debug!("cache invalidated");
    }

    /// Age of the cache entry for `range`, or `None` if it was never loaded.
    pub fn cache_age(&self, range: &DateRange) -> Option<Duration> {
        self.cache.get(range).map(|e| e.fetched_at.elapsed())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    // ── Private helpers ───────────────────────────────────────────────────

    fn is_cache_valid(&self, range: &DateRange) -> bool {
        self.cache
            .get(range)
            .is_some_and(|e| e.fetched_at.elapsed() < self.cache_ttl)
    }

    fn evict_expired(&mut self) {
        let ttl = self.cache_ttl;
        let before = self.cache.len();
        self.cache.retain(|_, e| e.fetched_at.elapsed() < ttl);
        if self.cache.len() < before {
            tracing::debug!(evicted = before - self.cache.len(), "expired cache entries dropped");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use monitor_data::reader::DirectorySnapshotStore;
    use tempfile::TempDir;

    const SNAPSHOT: &str = "Users of CAD:  (Total of 10 licenses issued;  Total of 1 licenses in use)\n\n    acme-jdoe ws01 /dev/pts/1 (v1) (lic01/27000 101), start Mon 1/15 9:02\n";

    fn day() -> DateRange {
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        DateRange::new(d, d).unwrap()
    }

    fn make_manager(ttl_secs: u64) -> (DataManager<DirectorySnapshotStore>, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("lmstat_2024-01-15_10-00-00.txt"), SNAPSHOT).unwrap();
        let config = AnalysisConfig {
            raw_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = DirectorySnapshotStore::from_config(&config);
        (DataManager::new(store, PolicyTable::new(), config, ttl_secs), dir)
    }

    #[test]
    fn test_cache_miss_on_first_call() {
        let (mgr, _dir) = make_manager(30);
        assert!(!mgr.is_cache_valid(&day()));
        assert!(mgr.cache_age(&day()).is_none());
        assert!(mgr.last_error().is_none());
    }

    #[test]
    fn test_cache_valid_within_ttl() {
        let (mut mgr, dir) = make_manager(30);
        let first = mgr.get_snapshots(&day(), false, |_, _| {}).unwrap();
        assert_eq!(first.records.len(), 1);

        // A new file is not seen while the entry is fresh.
        std::fs::write(dir.path().join("lmstat_2024-01-15_10-05-00.txt"), SNAPSHOT).unwrap();
        let second = mgr.get_snapshots(&day(), false, |_, _| {}).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(mgr.cache_age(&day()).unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn test_cache_expired_reloads() {
        let (mut mgr, dir) = make_manager(0);
        mgr.get_snapshots(&day(), false, |_, _| {});
        assert!(!mgr.is_cache_valid(&day()));

        std::fs::write(dir.path().join("lmstat_2024-01-15_10-05-00.txt"), SNAPSHOT).unwrap();
        let reloaded = mgr.get_snapshots(&day(), false, |_, _| {}).unwrap();
        assert_eq!(reloaded.snapshot_times.len(), 2);
    }

    #[test]
    fn test_force_refresh_bypasses_cache() {
        let (mut mgr, _dir) = make_manager(60);
        let first = mgr.get_snapshots(&day(), false, |_, _| {}).unwrap();
        let forced = mgr.get_snapshots(&day(), true, |_, _| {}).unwrap();
        assert!(!Arc::ptr_eq(&first, &forced));
    }

    #[test]
    fn test_invalidate_cache() {
        let (mut mgr, _dir) = make_manager(30);
        mgr.get_snapshots(&day(), false, |_, _| {});
        assert!(mgr.cache_age(&day()).is_some());

        mgr.invalidate_cache();
        assert!(mgr.cache_age(&day()).is_none());
    }

    #[test]
    fn test_progress_reported() {
        let (mut mgr, _dir) = make_manager(30);
        let mut calls = Vec::new();
        mgr.get_snapshots(&day(), false, |done, total| calls.push((done, total)));
        assert_eq!(calls, vec![(1, 1)]);
    }

    #[test]
    fn test_analyze_uses_cache() {
        let (mut mgr, _dir) = make_manager(30);
        let request = AnalysisRequest::new(day());
        let result = mgr.analyze(&request, false, |_, _| {}).unwrap();
        assert_eq!(result.metadata.records_selected, 1);
        assert_eq!(result.feature_stats[0].feature, "CAD");
        assert!(mgr.cache_age(&day()).is_some());
    }

    #[test]
    fn test_expired_entries_evicted_on_insert() {
        let (mut mgr, _dir) = make_manager(0);
        let other = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
        )
        .unwrap();

        mgr.get_snapshots(&day(), false, |_, _| {});
        mgr.get_snapshots(&other, false, |_, _| {});
        assert!(mgr.cache_age(&day()).is_none());
        assert!(mgr.cache_age(&other).is_some());
        assert_eq!(mgr.cache.len(), 1);
    }

    #[test]
    fn test_fresh_entries_kept_on_insert() {
        let (mut mgr, _dir) = make_manager(60);
        let other = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
        )
        .unwrap();

        mgr.get_snapshots(&day(), false, |_, _| {});
        mgr.get_snapshots(&other, false, |_, _| {});
        assert_eq!(mgr.cache.len(), 2);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = AnalysisConfig {
            raw_dir: dir.path().to_path_buf(),
            user_pattern: "([unclosed".to_string(),
            ..Default::default()
        };
        let store = DirectorySnapshotStore::from_config(&config);
        let mut mgr = DataManager::new(store, PolicyTable::new(), config, 30);

        assert!(mgr.get_snapshots(&day(), false, |_, _| {}).is_none());
        assert!(mgr.last_error().is_some());
        assert!(mgr
            .analyze(&AnalysisRequest::new(day()), false, |_, _| {})
            .is_err());
    }
}
