//! Collector registry and the activation pipeline.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::{debug, info, warn};

use crate::collectors::builtin;
use crate::collectors::descriptor::{Collector, Descriptor};
use crate::collectors::options::OptionValue;
use crate::config::RunConfig;
use crate::controller::RunError;
use crate::models::CollectorState;
use crate::policy::HostPolicy;

/// One collector that survived the platform filter, with its effective
/// options and activation decision.
#[derive(Debug, Clone)]
pub struct PlannedCollector {
    pub collector: Collector,
    /// Registration position
    pub order: usize,
    pub active: bool,
    pub options: BTreeMap<String, OptionValue>,
}

/// The outcome of gating.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// Platform survivors in registration order
    pub entries: Vec<PlannedCollector>,
}

impl RunPlan {
    /// Active collectors, sorted by name.
    pub fn active(&self) -> Vec<&PlannedCollector> {
        let mut active: Vec<&PlannedCollector> = self.entries.iter().filter(|e| e.active).collect();
        active.sort_by(|a, b| a.collector.name().cmp(b.collector.name()));
        active
    }

    pub fn active_names(&self) -> Vec<String> {
        self.active().iter().map(|e| e.collector.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlannedCollector> {
        self.entries.iter().find(|e| e.collector.name() == name)
    }

    /// Fresh per-run descriptors, in registration order. Active collectors
    /// start `Enabled`, the rest stay `Registered`.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.entries
            .iter()
            .map(|entry| {
                let mut descriptor = Descriptor::new(entry.collector.name(), entry.order, entry.options.clone());
                if entry.active {
                    descriptor.state = CollectorState::Enabled;
                }
                descriptor
            })
            .collect()
    }
}

/// One row of `--list-collectors`.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub name: String,
    pub description: String,
    pub platforms: Vec<String>,
    pub profiles: Vec<String>,
    pub supported: bool,
    pub gates_satisfied: bool,
    pub default_enabled: bool,
}

impl ListingEntry {
    pub const HEADER: &'static str = "collector        status     gates    platforms        profiles                 description";

    pub fn status(&self) -> &'static str {
        if !self.supported {
            "n/a"
        } else if self.default_enabled && self.gates_satisfied {
            "enabled"
        } else {
            "inactive"
        }
    }

    /// The row as printed, columns aligned with [`ListingEntry::HEADER`].
    pub fn row(&self) -> String {
        let platforms = if self.platforms.is_empty() {
            "any".to_string()
        } else {
            self.platforms.join(",")
        };
        format!(
            "{:<16} {:<10} {:<8} {:<16} {:<24} {}",
            self.name,
            self.status(),
            if self.gates_satisfied { "ok" } else { "unmet" },
            platforms,
            self.profiles.join(","),
            self.description
        )
    }
}

/// All collectors known to this build.
pub struct Registry {
    collectors: Vec<Collector>,
}

impl Registry {
    /// Build a registry. Names must be unique.
    pub fn new(collectors: Vec<Collector>) -> Result<Self, RunError> {
        let mut seen = HashSet::new();
        for collector in &collectors {
            if !seen.insert(collector.name().to_string()) {
                return Err(RunError::Config(format!(
                    "collector '{}' registered twice",
                    collector.name()
                )));
            }
        }
        Ok(Self { collectors })
    }

    /// The built-in catalog.
    pub fn builtin() -> Self {
        Self { collectors: builtin::all() }
    }

    pub fn collectors(&self) -> &[Collector] {
        &self.collectors
    }

    pub fn get(&self, name: &str) -> Option<&Collector> {
        self.collectors.iter().find(|c| c.name() == name)
    }

    /// Profile tag to the sorted names of collectors carrying it.
    pub fn profiles(&self) -> BTreeMap<String, Vec<String>> {
        let mut profiles: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for collector in &self.collectors {
            for profile in &collector.info.profiles {
                profiles.entry(profile.clone()).or_default().push(collector.name().to_string());
            }
        }
        for names in profiles.values_mut() {
            names.sort();
        }
        profiles
    }

    pub fn listing(&self, policy: &dyn HostPolicy) -> Vec<ListingEntry> {
        let family = policy.family();
        let mut rows: Vec<ListingEntry> = self
            .collectors
            .iter()
            .map(|c| ListingEntry {
                name: c.name().to_string(),
                description: c.info.description.clone(),
                platforms: c.info.platforms.iter().map(|f| f.to_string()).collect(),
                profiles: c.info.profiles.iter().cloned().collect(),
                supported: c.info.supports(family),
                gates_satisfied: c.info.gates_satisfied(policy),
                default_enabled: c.info.default_enabled,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    fn check_known(&self, names: &[String], what: &str) -> Result<(), RunError> {
        for name in names {
            if self.get(name).is_none() {
                return Err(RunError::Config(format!("unknown collector '{}' in {}", name, what)));
            }
        }
        Ok(())
    }

    /// Resolve which collectors run and with which options.
    ///
    /// 1. Drop collectors whose platform tags match neither the host family
    ///    nor `independent`.
    /// 2. Enable `explicit || (!disabled && default_enabled && gates)`.
    /// 3. With profiles requested, keep only collectors in one of them;
    ///    explicitly enabled collectors are kept regardless.
    /// 4. Merge configured options over each collector's schema defaults.
    pub fn plan(&self, policy: &dyn HostPolicy, config: &RunConfig) -> Result<RunPlan, RunError> {
        self.check_known(&config.enable_collectors, "enable list")?;
        self.check_known(&config.disable_collectors, "disable list")?;

        let known_profiles: BTreeSet<&String> =
            self.collectors.iter().flat_map(|c| c.info.profiles.iter()).collect();
        for profile in &config.profiles {
            if !known_profiles.contains(profile) {
                return Err(RunError::Config(format!("unknown profile '{}'", profile)));
            }
        }

        let overrides = self.validate_options(config)?;
        let family = policy.family();
        let mut plan = RunPlan::default();

        for (order, collector) in self.collectors.iter().enumerate() {
            let name = collector.name();
            if !collector.info.supports(family) {
                if config.enable_collectors.iter().any(|n| n == name) {
                    warn!("[{}] explicitly enabled but not supported on {} hosts", name, family);
                }
                debug!("[{}] skipped: platform {} not supported", name, family);
                continue;
            }

            let explicit = config.enable_collectors.iter().any(|n| n == name);
            let disabled = config.disable_collectors.iter().any(|n| n == name);
            let mut active = explicit
                || (!disabled && collector.info.default_enabled && collector.info.gates_satisfied(policy));

            if active && !explicit && !config.profiles.is_empty() {
                active = collector.info.profiles.iter().any(|p| config.profiles.contains(p));
            }

            let mut options: BTreeMap<String, OptionValue> = collector
                .info
                .options
                .iter()
                .map(|o| (o.key.clone(), o.default.clone()))
                .collect();
            if let Some(values) = overrides.get(name) {
                for (key, value) in values {
                    options.insert(key.clone(), value.clone());
                }
            }

            debug!("[{}] active={} options={:?}", name, active, options);
            plan.entries.push(PlannedCollector {
                collector: collector.clone(),
                order,
                active,
                options,
            });
        }

        info!("Activated {} of {} collectors", plan.active().len(), self.collectors.len());
        Ok(plan)
    }

    /// Parse configured option overrides against each collector's schema.
    fn validate_options(
        &self,
        config: &RunConfig,
    ) -> Result<BTreeMap<String, BTreeMap<String, OptionValue>>, RunError> {
        let mut parsed: BTreeMap<String, BTreeMap<String, OptionValue>> = BTreeMap::new();

        for (collector_name, values) in config.options_by_collector() {
            let collector = match self.get(&collector_name) {
                Some(collector) => collector,
                None => {
                    let shown = if collector_name.is_empty() { "<none>" } else { collector_name.as_str() };
                    if config.ignore_unknown_options {
                        warn!("Ignoring options for unknown collector {}", shown);
                        continue;
                    }
                    return Err(RunError::Config(format!(
                        "options given for unknown collector '{}' ({})",
                        shown,
                        values.keys().cloned().collect::<Vec<_>>().join(", ")
                    )));
                }
            };

            for (key, raw) in values {
                let spec = match collector.info.option_spec(&key) {
                    Some(spec) => spec,
                    None => {
                        if config.ignore_unknown_options {
                            warn!("[{}] ignoring unknown option '{}'", collector_name, key);
                            continue;
                        }
                        return Err(RunError::Config(format!(
                            "unknown option '{}.{}'",
                            collector_name, key
                        )));
                    }
                };
                let value = spec.default.parse_like(&raw).map_err(|e| {
                    RunError::Config(format!("option '{}.{}': {}", collector_name, key, e))
                })?;
                parsed.entry(collector_name.clone()).or_default().insert(key, value);
            }
        }

        Ok(parsed)
    }
}
