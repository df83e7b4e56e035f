use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use clap::{CommandFactory, Parser};
use serde::{Deserialize, Serialize};

use crate::calculations::UtilizationThresholds;
use crate::error::{MonitorError, Result};
use crate::models::{DateRange, Granularity, QuickPeriod, RecordFilter, UserMatching};

/// Default username shape: `<company>-<four letters>`.
pub const DEFAULT_USER_PATTERN: &str = r"^[a-z0-9]+-[a-z]{4}$";

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// License usage analytics over license-server status snapshots
#[derive(Parser, Debug, Clone)]
#[command(
    name = "license-monitor",
    about = "License usage analytics over license-server status snapshots",
    version
)]
pub struct Settings {
    /// First day of the report (YYYY-MM-DD); defaults to `end` minus the period
    #[arg(long, value_parser = parse_date_arg)]
    pub start: Option<NaiveDate>,

    /// Last day of the report (YYYY-MM-DD); defaults to today
    #[arg(long, value_parser = parse_date_arg)]
    pub end: Option<NaiveDate>,

    /// Preset period used when --start is not given
    #[arg(long, default_value = "monthly", value_parser = ["weekly", "monthly", "quarterly", "yearly"])]
    pub period: String,

    /// Time-bin width for the usage timeline
    #[arg(long, default_value = "auto", value_parser = ["auto", "5min", "hourly", "daily", "weekly", "monthly"])]
    pub granularity: String,

    /// Installation directory holding raw/, reports/ and config.json
    #[arg(long, env = "LICENSE_MONITOR_HOME")]
    pub home: Option<PathBuf>,

    /// Directory of raw snapshot files (defaults to <home>/raw/lmstat)
    #[arg(long, env = "RAW_LMSTAT_DIR")]
    pub raw_dir: Option<PathBuf>,

    /// Snapshot filename prefix; empty accepts any prefix
    #[arg(long, default_value = "lmstat")]
    pub file_prefix: String,

    /// FlexLM options file with MAX/GROUP entitlements
    #[arg(long, env = "OPTIONS_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Only these features (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub features: Option<Vec<String>>,

    /// Only these companies (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub companies: Option<Vec<String>>,

    /// Only these users (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub users: Option<Vec<String>>,

    /// Keep users that do not look like <company>-xxxx
    #[arg(long)]
    pub permissive_users: bool,

    /// Timezone of the license server clock (auto-detected if not specified)
    #[arg(long, default_value = "auto")]
    pub timezone: String,

    /// Write CSV reports into this directory
    #[arg(long)]
    pub export_dir: Option<PathBuf>,

    /// Rows shown in the per-user table
    #[arg(long, default_value = "20")]
    pub top_users: usize,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Clear saved configuration
    #[arg(long)]
    pub clear: bool,
}

fn parse_date_arg(s: &str) -> Result<NaiveDate> {
    crate::time_utils::parse_date(s).ok_or_else(|| MonitorError::TimestampParse(s.to_string()))
}

// ── LastUsedParams ─────────────────────────────────────────────────────────────

/// Persisted last-used parameters saved to `~/.license-monitor/last_used.json`.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct LastUsedParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_prefix: Option<String>,
}

impl LastUsedParams {
    /// `~/.license-monitor/last_used.json`.
    pub fn config_path() -> PathBuf {
        Self::config_path_in(&dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
    }

    pub fn config_path_in(base_dir: &Path) -> PathBuf {
        base_dir.join(".license-monitor").join("last_used.json")
    }

    /// Returns `Default` when the file is absent or cannot be parsed.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    /// Atomically write params to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> std::result::Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }

    pub fn clear_at(path: &Path) -> std::result::Result<(), std::io::Error> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Parse CLI arguments, fill unset values from the last run and persist
    /// the merged result.
    pub fn load_with_last_used() -> Self {
        Self::load_with_last_used_impl(
            std::env::args_os().collect(),
            &LastUsedParams::config_path(),
        )
    }

    /// Same as [`Settings::load_with_last_used`] with explicit args and
    /// config path.
    pub fn load_with_last_used_impl(
        args: Vec<std::ffi::OsString>,
        config_path: &Path,
    ) -> Self {
        let matches = Settings::command().get_matches_from(args.clone());
        let mut settings = Settings::parse_from(args);

        if settings.clear {
            let _ = LastUsedParams::clear_at(config_path);
            return Self::resolve_auto_values(settings);
        }

        let last = LastUsedParams::load_from(config_path);

        // CLI always wins; env-provided paths also beat persisted ones.
        if !is_arg_explicitly_set(&matches, "period") {
            if let Some(v) = last.period {
                settings.period = v;
            }
        }
        if !is_arg_explicitly_set(&matches, "granularity") {
            if let Some(v) = last.granularity {
                settings.granularity = v;
            }
        }
        if !is_arg_explicitly_set(&matches, "timezone") {
            if let Some(v) = last.timezone {
                settings.timezone = v;
            }
        }
        if !is_arg_explicitly_set(&matches, "file_prefix") {
            if let Some(v) = last.file_prefix {
                settings.file_prefix = v;
            }
        }
        if settings.raw_dir.is_none() {
            settings.raw_dir = last.raw_dir;
        }
        if settings.policy_file.is_none() {
            settings.policy_file = last.policy_file;
        }

        settings = Self::resolve_auto_values(settings);

        let _ = LastUsedParams::from(&settings).save_to(config_path);

        settings
    }

    fn resolve_auto_values(mut settings: Settings) -> Settings {
        if settings.timezone == "auto" {
            settings.timezone = crate::time_utils::get_system_timezone();
        }
        if settings.debug {
            settings.log_level = "DEBUG".to_string();
        }
        settings
    }

    /// Report range: `--start..=--end`, or the preset period ending on
    /// `--end` (default `today`).
    pub fn date_range(&self, today: NaiveDate) -> Result<DateRange> {
        let end = self.end.unwrap_or(today);
        match self.start {
            Some(start) => DateRange::new(start, end),
            None => {
                let period: QuickPeriod = self.period.parse()?;
                DateRange::new(end - Duration::days(period.days()), end)
            }
        }
    }

    /// `None` for `auto`.
    pub fn explicit_granularity(&self) -> Result<Option<Granularity>> {
        if self.granularity == "auto" {
            return Ok(None);
        }
        self.granularity.parse().map(Some)
    }

    pub fn record_filter(&self) -> RecordFilter {
        fn to_set(values: &Option<Vec<String>>) -> Option<BTreeSet<String>> {
            values.as_ref().map(|v| {
                v.iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
        }
        RecordFilter {
            features: to_set(&self.features),
            companies: to_set(&self.companies),
            users: to_set(&self.users),
        }
    }

    /// Installation directory; `~/.license-monitor` when not configured.
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".license-monitor")
        })
    }

    pub fn resolved_raw_dir(&self) -> PathBuf {
        self.raw_dir
            .clone()
            .unwrap_or_else(|| self.home_dir().join("raw").join("lmstat"))
    }
}

impl From<&Settings> for LastUsedParams {
    fn from(s: &Settings) -> Self {
        LastUsedParams {
            period: Some(s.period.clone()),
            granularity: Some(s.granularity.clone()),
            timezone: Some(s.timezone.clone()),
            raw_dir: s.raw_dir.clone(),
            policy_file: s.policy_file.clone(),
            file_prefix: Some(s.file_prefix.clone()),
        }
    }
}

/// Returns `true` when `name` was supplied explicitly on the command line
/// (not via default value or environment variable).
fn is_arg_explicitly_set(matches: &clap::ArgMatches, name: &str) -> bool {
    matches.value_source(name) == Some(clap::parser::ValueSource::CommandLine)
}

// ── AnalysisConfig ─────────────────────────────────────────────────────────────

/// Day-span cut-offs for automatic granularity selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GranularityThresholds {
    pub five_minute_max_days: i64,
    pub hourly_max_days: i64,
    pub daily_max_days: i64,
    pub weekly_max_days: i64,
}

impl Default for GranularityThresholds {
    fn default() -> Self {
        Self {
            five_minute_max_days: 7,
            hourly_max_days: 31,
            daily_max_days: 93,
            weekly_max_days: 365,
        }
    }
}

impl GranularityThresholds {
    pub fn select(&self, span_days: i64) -> Granularity {
        if span_days <= self.five_minute_max_days {
            Granularity::FiveMinute
        } else if span_days <= self.hourly_max_days {
            Granularity::Hourly
        } else if span_days <= self.daily_max_days {
            Granularity::Daily
        } else if span_days <= self.weekly_max_days {
            Granularity::Weekly
        } else {
            Granularity::Monthly
        }
    }
}

/// Everything the analysis pipeline needs to know, passed explicitly.
///
/// Can be read from `<home>/config.json`; missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub raw_dir: PathBuf,
    /// Snapshot filename prefix; empty accepts any.
    pub file_prefix: String,
    pub user_pattern: String,
    pub user_matching: UserMatching,
    /// Used when fewer than two snapshots are loaded.
    pub default_sampling_interval_minutes: f64,
    pub min_sampling_interval_minutes: f64,
    pub max_sampling_interval_minutes: f64,
    /// Gaps up to `multiplier × interval` keep a session open.
    pub session_gap_multiplier: f64,
    pub granularity_thresholds: GranularityThresholds,
    pub utilization_thresholds: UtilizationThresholds,
    /// IANA name of the license server's clock.
    pub timezone: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("raw").join("lmstat"),
            file_prefix: "lmstat".to_string(),
            user_pattern: DEFAULT_USER_PATTERN.to_string(),
            user_matching: UserMatching::Strict,
            default_sampling_interval_minutes: 5.0,
            min_sampling_interval_minutes: 1.0,
            max_sampling_interval_minutes: 60.0,
            session_gap_multiplier: 2.5,
            granularity_thresholds: GranularityThresholds::default(),
            utilization_thresholds: UtilizationThresholds::default(),
            timezone: "UTC".to_string(),
        }
    }
}

impl AnalysisConfig {
    /// Read a JSON config file; absent files yield defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| MonitorError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay CLI settings on `self`.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.raw_dir = settings.resolved_raw_dir();
        self.file_prefix = settings.file_prefix.clone();
        self.timezone = settings.timezone.clone();
        if settings.permissive_users {
            self.user_matching = UserMatching::Permissive;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        regex::Regex::new(&self.user_pattern)
            .map_err(|e| MonitorError::Config(format!("invalid user_pattern: {e}")))?;
        if self.min_sampling_interval_minutes <= 0.0
            || self.min_sampling_interval_minutes > self.max_sampling_interval_minutes
        {
            return Err(MonitorError::Config(format!(
                "invalid sampling interval bounds [{}, {}]",
                self.min_sampling_interval_minutes, self.max_sampling_interval_minutes
            )));
        }
        if self.session_gap_multiplier <= 0.0 {
            return Err(MonitorError::Config(
                "session_gap_multiplier must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamp a detected sampling interval into the configured bounds.
    pub fn clamp_interval(&self, minutes: f64) -> f64 {
        minutes.clamp(
            self.min_sampling_interval_minutes,
            self.max_sampling_interval_minutes,
        )
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
