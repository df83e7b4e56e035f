//! License-server status text to [`CheckoutRecord`]s.
//!
//! The relevant part of a snapshot looks like:
//!
//! ```text
//! Users of CAD:  (Total of 10 licenses issued;  Total of 2 licenses in use)
//!
//!   "CAD" v2024.1, vendor: acme
//!   floating license
//!
//!     acme-abcd ws01 /dev/pts/1 (v2024.1) (lic01/27000 101), start Mon 1/15 9:02
//!       acme-abcd ws01 reservation detail
//! ```
//!
//! Only lines indented by exactly four spaces and containing ` start ` are
//! checkouts; deeper indentation is detail belonging to the line above.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::debug;

use monitor_core::error::{MonitorError, Result};
use monitor_core::models::{CheckoutRecord, UserMatching};
use monitor_core::policy::company_of_user;
use monitor_core::settings::{AnalysisConfig, DEFAULT_USER_PATTERN};

/// Company assigned in permissive mode when a user has no `-` separator.
pub const UNKNOWN_COMPANY: &str = "unknown";

const CHECKOUT_INDENT: usize = 4;

// ── SnapshotParser ────────────────────────────────────────────────────────────

/// Parses one snapshot document. Cheap to clone and share across threads.
#[derive(Debug, Clone)]
pub struct SnapshotParser {
    user_re: Regex,
    matching: UserMatching,
}

impl Default for SnapshotParser {
    fn default() -> Self {
        Self {
            user_re: Regex::new(DEFAULT_USER_PATTERN).expect("regex is valid"),
            matching: UserMatching::Strict,
        }
    }
}

impl SnapshotParser {
    pub fn new(user_pattern: &str, matching: UserMatching) -> Result<Self> {
        let user_re = Regex::new(user_pattern)
            .map_err(|e| MonitorError::Config(format!("invalid user_pattern: {e}")))?;
        Ok(Self { user_re, matching })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        Self::new(&config.user_pattern, config.user_matching)
    }

    /// Extract every checkout in `text`, stamped with `timestamp`.
    ///
    /// With `user_filter` only listed users are kept and their company comes
    /// from the map. Without it the parser's [`UserMatching`] decides.
    /// A user seen twice for the same feature yields one record.
    pub fn parse(
        &self,
        text: &str,
        timestamp: NaiveDateTime,
        user_filter: Option<&HashMap<String, String>>,
    ) -> Vec<CheckoutRecord> {
        let mut records = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut current_feature: Option<String> = None;

        for raw in text.lines() {
            let line = raw.trim_end();

            if let Some(feature) = parse_feature_header(line) {
                current_feature = Some(feature);
                continue;
            }
            let Some(feature) = current_feature.as_deref() else {
                continue;
            };

            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('"') {
                continue;
            }
            if !is_checkout_line(line) {
                continue;
            }

            let mut tokens = trimmed.split_whitespace();
            let (Some(user), Some(host)) = (tokens.next(), tokens.next()) else {
                continue;
            };

            let Some(company) = self.resolve_company(user, user_filter) else {
                continue;
            };

            if seen.insert((feature.to_string(), user.to_string())) {
                records.push(CheckoutRecord::new(timestamp, feature, user, company, host));
            }
        }

        debug!(
            "Parsed {} checkouts from snapshot {}",
            records.len(),
            timestamp
        );
        records
    }

    fn resolve_company(
        &self,
        user: &str,
        user_filter: Option<&HashMap<String, String>>,
    ) -> Option<String> {
        if let Some(filter) = user_filter {
            return filter.get(user).cloned();
        }
        match self.matching {
            UserMatching::Strict => self
                .user_re
                .is_match(user)
                .then(|| company_of_user(user).to_string()),
            UserMatching::Permissive => Some(if user.contains('-') {
                company_of_user(user).to_string()
            } else {
                UNKNOWN_COMPANY.to_string()
            }),
        }
    }
}

/// `Users of <feature>:  (Total of N licenses issued; ...)` gives `<feature>`.
fn parse_feature_header(line: &str) -> Option<String> {
    let rest = line.strip_prefix("Users of ")?;
    if !line.contains("licenses issued") {
        return None;
    }
    let (feature, _) = rest.split_once(':')?;
    let feature = feature.trim();
    (!feature.is_empty()).then(|| feature.to_string())
}

fn is_checkout_line(line: &str) -> bool {
    let indent = line.len() - line.trim_start_matches(' ').len();
    indent == CHECKOUT_INDENT && line.contains(" start ")
}
