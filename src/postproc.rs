//! Substitution pass over captured content.
//!
//! Rules run over the whole run ledger, collectors in registration order and
//! each collector's rules in declaration order. Content that cannot be
//! rewritten is never shipped as-is: it is overwritten with a marker of the
//! same size, or dropped if even that fails.

use std::borrow::Cow;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::archive::{StagingArchive, StagingError};
use crate::collectors::specs::SubstitutionRule;
use crate::constants::REDACTION_FAILURE_MARKER;
use crate::models::CapturedItem;

/// Replacement count for one rule of one collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCount {
    pub scope: String,
    pub pattern: String,
    pub replacements: u64,
}

/// The rules one collector declared.
#[derive(Debug, Clone)]
pub struct CollectorRules {
    pub collector: String,
    pub rules: Vec<SubstitutionRule>,
}

#[derive(Debug, Default)]
pub struct PostprocReport {
    /// One entry per collector with rules, in the order given
    pub counts: Vec<(String, Vec<RuleCount>)>,
    /// Items whose content could not be redacted
    pub alerts: Vec<CapturedItem>,
    pub files_rewritten: usize,
}

impl PostprocReport {
    pub fn counts_for(&self, collector: &str) -> &[RuleCount] {
        self.counts
            .iter()
            .find(|(name, _)| name == collector)
            .map(|(_, counts)| counts.as_slice())
            .unwrap_or(&[])
    }
}

/// Same-length content that says redaction failed.
fn failure_marker(len: u64) -> Vec<u8> {
    REDACTION_FAILURE_MARKER
        .iter()
        .copied()
        .cycle()
        .take(len as usize)
        .collect()
}

/// Apply every rule to every item it scopes.
///
/// Returns an error only when a file that could not be redacted could not be
/// withheld either.
pub fn apply(
    staging: &StagingArchive,
    rule_sets: &[CollectorRules],
    items: &[CapturedItem],
) -> Result<PostprocReport, StagingError> {
    let mut report = PostprocReport {
        counts: rule_sets
            .iter()
            .map(|set| {
                let counts = set
                    .rules
                    .iter()
                    .map(|rule| RuleCount {
                        scope: rule.scope.to_string(),
                        pattern: rule.pattern.as_str().to_string(),
                        replacements: 0,
                    })
                    .collect();
                (set.collector.clone(), counts)
            })
            .collect(),
        ..Default::default()
    };

    let total_rules: usize = rule_sets.iter().map(|set| set.rules.len()).sum();
    if total_rules == 0 {
        return Ok(report);
    }
    info!("Applying {} substitution rules", total_rules);

    for item in items {
        let archive_path = match &item.archive_path {
            Some(path) => path,
            None => continue,
        };

        let applicable: Vec<(usize, usize)> = rule_sets
            .iter()
            .enumerate()
            .flat_map(|(set_idx, set)| {
                set.rules
                    .iter()
                    .enumerate()
                    .filter(|(_, rule)| rule.applies_to(item))
                    .map(move |(rule_idx, _)| (set_idx, rule_idx))
            })
            .collect();
        if applicable.is_empty() {
            continue;
        }

        let original = match staging.read_captured(archive_path) {
            Ok(content) => content,
            Err(e) => {
                withhold(staging, item, archive_path, &e.to_string(), &mut report)?;
                continue;
            }
        };

        let mut content = Cow::Borrowed(original.as_slice());
        for (set_idx, rule_idx) in applicable {
            let rule = &rule_sets[set_idx].rules[rule_idx];
            let found = rule.pattern.find_iter(&content).count() as u64;
            if found == 0 {
                continue;
            }
            let replaced = rule.pattern.replace_all(&content, rule.replacement.as_bytes()).into_owned();
            content = Cow::Owned(replaced);
            report.counts[set_idx].1[rule_idx].replacements += found;
            debug!(
                "[{}] {} replacements of {} in {}",
                rule_sets[set_idx].collector, found, rule.scope, archive_path
            );
        }

        if let Cow::Owned(rewritten) = content {
            match staging.replace_captured(archive_path, &rewritten) {
                Ok(()) => report.files_rewritten += 1,
                Err(e) => withhold(staging, item, archive_path, &e.to_string(), &mut report)?,
            }
        }
    }

    info!("Substitution rewrote {} files", report.files_rewritten);
    Ok(report)
}

/// Replace unredactable content with the failure marker, or drop it.
fn withhold(
    staging: &StagingArchive,
    item: &CapturedItem,
    archive_path: &str,
    reason: &str,
    report: &mut PostprocReport,
) -> Result<(), StagingError> {
    warn!("Redaction of {} failed: {}", archive_path, reason);
    let marker = failure_marker(staging.captured_len(archive_path));

    let message = match staging.replace_captured(archive_path, &marker) {
        Ok(()) => format!("redaction failed, content withheld: {}", reason),
        Err(e) => {
            error!("Cannot withhold {}: {}, removing it", archive_path, e);
            staging.release(archive_path)?;
            format!("redaction failed, file removed: {}", reason)
        }
    };
    report
        .alerts
        .push(CapturedItem::alert(&item.origin_collector, archive_path, message));
    Ok(())
}
