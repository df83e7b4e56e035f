//! Per-user license entitlements and the ceilings derived from them.
//!
//! Entitlements come from a FlexLM options file:
//!
//! ```text
//! GROUP acme_design acme-abcd acme-efgh
//! MAX 10 CAD GROUP acme_design
//! MAX 5  CAD USER beta-wxyz
//! ```
//!
//! A `GROUP` rule attributes its members to the company named by the group
//! prefix before `_`; a `USER` rule uses the username prefix before `-`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};

/// Maximum concurrent checkouts of `feature` granted to `user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub user: String,
    pub company: String,
    pub feature: String,
    pub policy_max: u32,
}

impl PolicyEntry {
    pub fn new(
        user: impl Into<String>,
        company: impl Into<String>,
        feature: impl Into<String>,
        policy_max: u32,
    ) -> Self {
        Self {
            user: user.into(),
            company: company.into(),
            feature: feature.into(),
            policy_max,
        }
    }
}

/// Company of a username such as `acme-abcd` (`acme`).
pub fn company_of_user(user: &str) -> &str {
    user.split('-').next().unwrap_or(user)
}

/// Company of a group name such as `acme_design` (`acme`).
pub fn company_of_group(group: &str) -> &str {
    group.split('_').next().unwrap_or(group)
}

// ── PolicyTable ───────────────────────────────────────────────────────────────

/// Entitlements keyed by `(user, feature)`; a later entry replaces an earlier one.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    entries: BTreeMap<(String, String), PolicyEntry>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = PolicyEntry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    /// Insert or replace the entry for `(user, feature)`, returning the old one.
    pub fn insert(&mut self, entry: PolicyEntry) -> Option<PolicyEntry> {
        self.entries
            .insert((entry.user.clone(), entry.feature.clone()), entry)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PolicyEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Features that carry at least one entitlement.
    pub fn features(&self) -> BTreeSet<String> {
        self.entries().map(|e| e.feature.clone()).collect()
    }

    /// `user -> company` for every user that appears in the table.
    ///
    /// Used as the parser's user filter so only entitled users are counted.
    pub fn user_companies(&self) -> HashMap<String, String> {
        self.entries()
            .map(|e| (e.user.clone(), e.company.clone()))
            .collect()
    }

    /// Per-feature ceilings over `users` (all users when `None`).
    pub fn ceilings_for_users(&self, users: Option<&BTreeSet<String>>) -> BTreeMap<String, u32> {
        policy_ceiling_for_users(self.entries(), users)
    }

    /// `(company, feature) -> max policy within that company`.
    pub fn company_ceilings(&self) -> BTreeMap<(String, String), u32> {
        company_feature_max(self.entries(), None)
    }

    /// Load and parse an options file. Undecodable bytes are replaced.
    pub fn load_options_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MonitorError::DataPathNotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| MonitorError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::parse_options(&String::from_utf8_lossy(&bytes));
        debug!(
            "Loaded {} policy entries from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Parse options-file text. Malformed `MAX` lines are skipped with a
    /// warning; directives other than `GROUP` and `MAX` are ignored.
    pub fn parse_options(text: &str) -> Self {
        let mut table = Self::new();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts[0] {
                "GROUP" if parts.len() >= 2 => {
                    let members = parts[2..].iter().map(|u| u.to_string()).collect();
                    groups.insert(parts[1].to_string(), members);
                }
                "MAX" => match parse_max_rule(&parts, idx + 1) {
                    Ok(rule) => table.apply_rule(rule, &groups),
                    Err(e) => warn!("Skipping policy rule: {}", e),
                },
                _ => {}
            }
        }
        table
    }

    fn apply_rule(&mut self, rule: MaxRule<'_>, groups: &HashMap<String, Vec<String>>) {
        match rule.target {
            RuleTarget::User(user) => {
                self.insert(PolicyEntry::new(
                    user,
                    company_of_user(user),
                    rule.feature,
                    rule.count,
                ));
            }
            RuleTarget::Group(group) => {
                let Some(members) = groups.get(group).filter(|m| !m.is_empty()) else {
                    debug!("MAX rule references unknown or empty group {}", group);
                    return;
                };
                let company = company_of_group(group);
                for user in members {
                    self.insert(PolicyEntry::new(
                        user.as_str(),
                        company,
                        rule.feature,
                        rule.count,
                    ));
                }
            }
        }
    }
}

// ── Ceiling aggregation ───────────────────────────────────────────────────────

/// Effective per-feature ceiling for a set of users.
///
/// Entries are grouped by `(company, feature)`; within a company the largest
/// entitlement applies, and the ceilings of all companies present in the
/// selection are summed. `users = None` considers every entry.
pub fn policy_ceiling_for_users<'a>(
    entries: impl IntoIterator<Item = &'a PolicyEntry>,
    users: Option<&BTreeSet<String>>,
) -> BTreeMap<String, u32> {
    let mut ceilings: BTreeMap<String, u32> = BTreeMap::new();
    for ((_, feature), max) in company_feature_max(entries, users) {
        *ceilings.entry(feature).or_insert(0) += max;
    }
    ceilings
}

fn company_feature_max<'a>(
    entries: impl IntoIterator<Item = &'a PolicyEntry>,
    users: Option<&BTreeSet<String>>,
) -> BTreeMap<(String, String), u32> {
    let mut per_company: BTreeMap<(String, String), u32> = BTreeMap::new();
    for entry in entries {
        if users.is_some_and(|set| !set.contains(&entry.user)) {
            continue;
        }
        let slot = per_company
            .entry((entry.company.clone(), entry.feature.clone()))
            .or_insert(0);
        *slot = (*slot).max(entry.policy_max);
    }
    per_company
}

// ── Rule parsing ──────────────────────────────────────────────────────────────

struct MaxRule<'a> {
    count: u32,
    feature: &'a str,
    target: RuleTarget<'a>,
}

enum RuleTarget<'a> {
    User(&'a str),
    Group(&'a str),
}

/// `MAX <count> <feature> USER|GROUP <target>`
fn parse_max_rule<'a>(parts: &[&'a str], line: usize) -> Result<MaxRule<'a>> {
    let err = |message: &str| MonitorError::PolicyParse {
        line,
        message: message.to_string(),
    };
    if parts.len() < 5 {
        return Err(err("expected MAX <count> <feature> USER|GROUP <name>"));
    }
    let count = parts[1]
        .parse::<u32>()
        .map_err(|_| err(&format!("invalid count {:?}", parts[1])))?;
    let target = match parts[3] {
        "USER" => RuleTarget::User(parts[4]),
        "GROUP" => RuleTarget::Group(parts[4]),
        other => return Err(err(&format!("unsupported target kind {:?}", other))),
    };
    Ok(MaxRule {
        count,
        feature: parts[2],
        target,
    })
}
