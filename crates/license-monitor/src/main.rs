mod bootstrap;
mod report;

use anyhow::{Context, Result};
use monitor_core::policy::PolicyTable;
use monitor_core::settings::{AnalysisConfig, Settings};
use monitor_core::time_utils::TimezoneHandler;
use monitor_data::analysis::AnalysisRequest;
use monitor_data::export::CsvExporter;
use monitor_data::reader::DirectorySnapshotStore;
use monitor_runtime::data_manager::{DataManager, DEFAULT_CACHE_TTL_SECS};
use monitor_runtime::orchestrator::{AnalysisWorker, WorkerEvent};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load_with_last_used();
    let home = settings.home_dir();

    bootstrap::ensure_directories(&home)?;
    bootstrap::setup_logging(&settings.log_level, settings.log_file.as_ref())?;

    tracing::info!("License Monitor v{} starting", env!("CARGO_PKG_VERSION"));

    let config = AnalysisConfig::load_from(&home.join("config.json"))
        .context("loading config.json")?
        .with_settings(&settings);
    config.validate()?;

    let today = TimezoneHandler::new(&config.timezone).now().date();
    let mut request = AnalysisRequest::new(settings.date_range(today)?);
    request.granularity = settings.explicit_granularity()?;
    request.filter = settings.record_filter();

    let policy = match &settings.policy_file {
        Some(path) => PolicyTable::load_options_file(path)
            .with_context(|| format!("loading policy file {}", path.display()))?,
        None => {
            tracing::info!("No policy file configured; utilization ratios are unavailable");
            PolicyTable::new()
        }
    };
    tracing::info!(
        "Range: {}, raw dir: {}, policy entries: {}",
        request.range,
        config.raw_dir.display(),
        policy.len()
    );

    let store = DirectorySnapshotStore::from_config(&config);
    let worker = AnalysisWorker::new(DataManager::new(
        store,
        policy,
        config,
        DEFAULT_CACHE_TTL_SECS,
    ));

    let (mut rx, handle) = worker.start(request, false);
    let mut result = None;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(WorkerEvent::Progress { done, total }) => {
                    if done == total || done % 100 == 0 {
                        tracing::info!("Read {done}/{total} snapshots");
                    }
                }
                Some(WorkerEvent::Completed(r)) => {
                    result = Some(*r);
                    break;
                }
                Some(WorkerEvent::Failed(e)) => anyhow::bail!("analysis failed: {e}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received; stopping analysis");
                handle.abort();
                return Ok(());
            }
        }
    }

    let result = result.context("analysis stopped without a result")?;
    print!("{}", report::render_report(&result, settings.top_users));

    let export_dir = settings.export_dir.clone().unwrap_or_else(|| {
        let period = if settings.start.is_some() {
            "custom"
        } else {
            settings.period.as_str()
        };
        bootstrap::default_report_dir(&home, period)
    });
    let written = CsvExporter::new().export_all(&result, &export_dir)?;
    println!("\nWrote {} files to {}", written.len(), export_dir.display());

    Ok(())
}
