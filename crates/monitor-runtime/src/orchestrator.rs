//! Background analysis worker.
//!
//! Runs [`DataManager::analyze`] on tokio's blocking pool and forwards
//! progress and the final result through an `mpsc` channel, so the caller's
//! event loop stays responsive while thousands of snapshot files are read.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use monitor_data::analysis::{AnalysisRequest, AnalysisResult};
use monitor_data::reader::SnapshotStore;

use crate::data_manager::DataManager;

// ── Public types ──────────────────────────────────────────────────────────────

/// Messages emitted by a running analysis.
#[derive(Debug)]
pub enum WorkerEvent {
    /// `done` of `total` snapshots have been read.
    Progress { done: usize, total: usize },
    Completed(Box<AnalysisResult>),
    Failed(String),
}

// ── AnalysisWorker ────────────────────────────────────────────────────────────

/// Runs analyses in the background against a shared [`DataManager`].
///
/// Successive runs share the manager's snapshot cache, so re-running with a
/// different filter or granularity over the same range skips the file reads.
pub struct AnalysisWorker<S> {
    manager: Arc<Mutex<DataManager<S>>>,
    channel_capacity: usize,
}

impl<S> Clone for AnalysisWorker<S> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            channel_capacity: self.channel_capacity,
        }
    }
}

impl<S> AnalysisWorker<S>
where
    S: SnapshotStore + Send + 'static,
{
    pub fn new(manager: DataManager<S>) -> Self {
        Self {
            manager: Arc::new(Mutex::new(manager)),
            channel_capacity: 64,
        }
    }

    /// Start one analysis run.
    ///
    /// Returns the event receiver and a handle that can abort the run. The
    /// last event is always `Completed` or `Failed` unless the run is
    /// aborted or the receiver dropped.
    pub fn start(
        &self,
        request: AnalysisRequest,
        force_refresh: bool,
    ) -> (mpsc::Receiver<WorkerEvent>, WorkerHandle) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let manager = Arc::clone(&self.manager);

        let handle = tokio::spawn(async move {
            let progress_tx = tx.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let mut manager = manager
                    .lock()
                    .map_err(|_| "data manager lock poisoned".to_string())?;
                manager
                    .analyze(&request, force_refresh, |done, total| {
                        // Progress is best effort; a full or closed channel drops it.
                        let _ = progress_tx.try_send(WorkerEvent::Progress { done, total });
                    })
                    .map_err(|e| e.to_string())
            })
            .await;

            let event = match outcome {
                Ok(Ok(result)) => {
                    tracing::info!(
                        records = result.metadata.records_selected,
                        features = result.feature_stats.len(),
                        "analysis completed"
                    );
                    WorkerEvent::Completed(Box::new(result))
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "analysis failed");
                    WorkerEvent::Failed(e)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "analysis task did not finish");
                    WorkerEvent::Failed(e.to_string())
                }
            };

            if tx.send(event).await.is_err() {
                tracing::debug!("worker receiver dropped before the result was sent");
            }
        });

        (rx, WorkerHandle { handle })
    }

    /// Run an analysis and wait for its result, ignoring progress.
    pub async fn run(
        &self,
        request: AnalysisRequest,
        force_refresh: bool,
    ) -> Result<AnalysisResult, String> {
        let (mut rx, _handle) = self.start(request, force_refresh);
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Progress { .. } => {}
                WorkerEvent::Completed(result) => return Ok(*result),
                WorkerEvent::Failed(e) => return Err(e),
            }
        }
        Err("analysis worker stopped without a result".to_string())
    }
}

// ── WorkerHandle ──────────────────────────────────────────────────────────────

/// Handle to a background analysis run.
///
/// Aborting stops event delivery; a snapshot load already running on the
/// blocking pool finishes and its result is discarded.
pub struct WorkerHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::NaiveDate;
    use monitor_core::models::DateRange;
    use monitor_core::policy::PolicyTable;
    use monitor_core::settings::AnalysisConfig;
    use monitor_data::reader::DirectorySnapshotStore;
    use tempfile::TempDir;

    const SNAPSHOT: &str = "Users of CAD:  (Total of 10 licenses issued;  Total of 2 licenses in use)\n\n    acme-jdoe ws01 /dev/pts/1 (v1) (lic01/27000 101), start Mon 1/15 9:02\n    beta-asmi ws02 /dev/pts/2 (v1) (lic01/27000 102), start Mon 1/15 9:10\n";

    fn day() -> DateRange {
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        DateRange::new(d, d).unwrap()
    }

    fn make_worker(user_pattern: Option<&str>) -> (AnalysisWorker<DirectorySnapshotStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        for stamp in ["10-00-00", "10-05-00"] {
            std::fs::write(dir.path().join(format!("lmstat_2024-01-15_{stamp}.txt")), SNAPSHOT)
                .unwrap();
        }
        let mut config = AnalysisConfig {
            raw_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        if let Some(p) = user_pattern {
            config.user_pattern = p.to_string();
        }
        let store = DirectorySnapshotStore::from_config(&config);
        let manager = DataManager::new(store, PolicyTable::new(), config, 60);
        (AnalysisWorker::new(manager), dir)
    }

    async fn collect(mut rx: mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap()
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_worker_reports_progress_then_result() {
        let (worker, _dir) = make_worker(None);
        let (rx, _handle) = worker.start(AnalysisRequest::new(day()), false);
        let events = collect(rx).await;

        let progress: Vec<(usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress { done, total } => Some((*done, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 2), (2, 2)]);

        match events.last() {
            Some(WorkerEvent::Completed(result)) => {
                assert_eq!(result.metadata.snapshots_loaded, 2);
                assert_eq!(result.feature_stats[0].peak_concurrent, 2);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_run_reuses_cache() {
        let (worker, dir) = make_worker(None);
        let first = worker.run(AnalysisRequest::new(day()), false).await.unwrap();
        assert_eq!(first.metadata.snapshots_loaded, 2);

        std::fs::write(dir.path().join("lmstat_2024-01-15_10-10-00.txt"), SNAPSHOT).unwrap();
        let cached = worker.run(AnalysisRequest::new(day()), false).await.unwrap();
        assert_eq!(cached.metadata.snapshots_loaded, 2);

        let fresh = worker.run(AnalysisRequest::new(day()), true).await.unwrap();
        assert_eq!(fresh.metadata.snapshots_loaded, 3);
    }

    #[tokio::test]
    async fn test_worker_reports_failure() {
        let (worker, _dir) = make_worker(Some("([unclosed"));
        let err = worker.run(AnalysisRequest::new(day()), false).await.unwrap_err();
        assert!(err.contains("user_pattern"));
    }

    #[tokio::test]
    async fn test_worker_abort() {
        let (worker, _dir) = make_worker(None);
        let (_rx, handle) = worker.start(AnalysisRequest::new(day()), false);
        handle.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }
}
