use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collectors::descriptor::Descriptor;
use crate::collectors::options::OptionValue;
use crate::config::{Compression, RunConfig};
use crate::models::{CapturedItem, CollectorState, ItemKind};
use crate::policy::HostPolicy;
use crate::postproc::RuleCount;

/// Host identity as recorded in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostInfo {
    pub hostname: String,
    pub family: String,
    pub version: Option<String>,
    pub arch: String,
    pub kernel: Option<String>,
    pub in_container: bool,
}

impl HostInfo {
    pub fn probe(policy: &dyn HostPolicy) -> Self {
        Self {
            hostname: policy.hostname(),
            family: policy.family().as_str().to_string(),
            version: policy.distribution_version(),
            arch: policy.architecture(),
            kernel: policy.kernel_version(),
            in_container: policy.in_container(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionInfo {
    pub requested: Compression,
    pub used: Compression,
}

/// One collector's record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorRecord {
    pub name: String,
    pub state: CollectorState,
    pub options: BTreeMap<String, OptionValue>,
    pub alerts: Vec<String>,
    pub custom_text: Vec<String>,
    pub items: Vec<CapturedItem>,
    pub failures: Vec<String>,
    pub substitutions: Vec<RuleCount>,
}

impl CollectorRecord {
    pub fn from_descriptor(descriptor: &Descriptor, substitutions: &[RuleCount]) -> Self {
        let mut alerts = descriptor.specs.alerts.clone();
        alerts.extend(
            descriptor
                .items
                .iter()
                .filter(|item| item.kind == ItemKind::Alert)
                .map(|item| match &item.error {
                    Some(message) => format!("{}: {}", item.source_ref, message),
                    None => item.source_ref.clone(),
                }),
        );

        Self {
            name: descriptor.name.clone(),
            state: descriptor.state,
            options: descriptor.options.clone(),
            alerts,
            custom_text: descriptor.specs.custom_text.clone(),
            items: descriptor.items.clone(),
            failures: descriptor.failures.clone(),
            substitutions: substitutions.to_vec(),
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.iter().filter(|i| i.kind != ItemKind::Alert).count()
    }

    pub fn failed_item_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.kind != ItemKind::Alert && i.failed())
            .count()
    }
}

/// The structured record of one run, written as `sos_reports/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub tool: String,
    pub tool_version: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub host: HostInfo,
    pub config: RunConfig,
    pub compression: CompressionInfo,
    pub collectors: Vec<CollectorRecord>,
}

impl Manifest {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize manifest")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse manifest")
    }

    pub fn collector(&self, name: &str) -> Option<&CollectorRecord> {
        self.collectors.iter().find(|c| c.name == name)
    }

    /// Every item of every collector, ordered by `(collector, archive_path)`.
    pub fn sorted_items(&self) -> Vec<&CapturedItem> {
        let mut items: Vec<&CapturedItem> = self.collectors.iter().flat_map(|c| c.items.iter()).collect();
        items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        items
    }

    pub fn failed_collectors(&self) -> Vec<&str> {
        self.collectors
            .iter()
            .filter(|c| c.state == CollectorState::Failed)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Family, StaticPolicy};

    fn sample() -> Manifest {
        let mut descriptor = Descriptor::new("host", 0, BTreeMap::new());
        descriptor.state = CollectorState::PostProcessed;
        descriptor.specs.alerts.push("declared alert".into());
        descriptor
            .items
            .push(CapturedItem::new("host", ItemKind::CopiedFile, "/etc/hosts").at("etc/hosts"));
        descriptor
            .items
            .push(CapturedItem::alert("host", "/etc/shadow", "matches a forbidden path, not captured"));

        let policy = StaticPolicy::new(Family::Debian);
        let now = Utc::now();
        Manifest {
            tool: "diag-collector".into(),
            tool_version: "0.1.0".into(),
            run_id: "run".into(),
            started_at: now,
            ended_at: now,
            host: HostInfo::probe(&policy),
            config: RunConfig::default(),
            compression: CompressionInfo { requested: Compression::Auto, used: Compression::Gzip },
            collectors: vec![CollectorRecord::from_descriptor(&descriptor, &[])],
        }
    }

    #[test]
    fn test_alerts_merge_declared_and_item_alerts() {
        let manifest = sample();
        let host = manifest.collector("host").unwrap();
        assert_eq!(host.alerts.len(), 2);
        assert!(host.alerts[1].starts_with("/etc/shadow: "));
        assert_eq!(host.item_count(), 1);
        assert_eq!(host.failed_item_count(), 0);
    }

    #[test]
    fn test_json_shape() {
        let manifest = sample();
        let value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(value["host"]["family"], "debian");
        assert_eq!(value["collectors"][0]["name"], "host");
        assert_eq!(value["collectors"][0]["state"], "PostProcessed");
        assert_eq!(value["collectors"][0]["items"][0]["archive_path"], "etc/hosts");
        assert!(value["config"].is_object());
    }

    #[test]
    fn test_parses_back() {
        let manifest = sample();
        let parsed = Manifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
        assert!(parsed.failed_collectors().is_empty());
    }
}
