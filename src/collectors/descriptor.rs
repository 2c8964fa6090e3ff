//! Collector definitions and their per-run descriptors.
//!
//! A [`Collector`] is plain data plus a setup function value. Cross-distro
//! variants of the same area are separate collectors that share helpers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::collectors::context::SetupContext;
use crate::collectors::options::{OptionSpec, OptionValue};
use crate::collectors::specs::SpecSet;
use crate::models::{CapturedItem, CollectorState, ItemKind};
use crate::policy::{Family, HostPolicy};

/// Setup and refine hooks share one shape.
pub type SetupFn = Arc<dyn Fn(&mut SetupContext<'_>) -> anyhow::Result<()> + Send + Sync>;

type CustomGate = Arc<dyn Fn(&dyn HostPolicy) -> bool + Send + Sync>;

/// A predicate deciding whether a collector is relevant to this host.
#[derive(Clone)]
pub enum Gate {
    FileExists(String),
    PackageInstalled(String),
    ExecutableAvailable(String),
    Custom(String, CustomGate),
}

impl Gate {
    pub fn custom<F>(label: &str, check: F) -> Self
    where
        F: Fn(&dyn HostPolicy) -> bool + Send + Sync + 'static,
    {
        Gate::Custom(label.to_string(), Arc::new(check))
    }

    pub fn evaluate(&self, policy: &dyn HostPolicy) -> bool {
        match self {
            Gate::FileExists(path) => policy.file_exists(path),
            Gate::PackageInstalled(name) => policy.package_installed(name),
            Gate::ExecutableAvailable(name) => policy.executable_available(name),
            Gate::Custom(_, check) => check(policy),
        }
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::FileExists(path) => write!(f, "file:{}", path),
            Gate::PackageInstalled(name) => write!(f, "package:{}", name),
            Gate::ExecutableAvailable(name) => write!(f, "executable:{}", name),
            Gate::Custom(label, _) => write!(f, "custom:{}", label),
        }
    }
}

/// Static metadata of a collector.
#[derive(Debug, Clone)]
pub struct CollectorInfo {
    pub name: String,
    pub description: String,
    pub platforms: BTreeSet<Family>,
    pub profiles: BTreeSet<String>,
    pub gates: Vec<Gate>,
    pub options: Vec<OptionSpec>,
    pub default_enabled: bool,
}

impl CollectorInfo {
    /// True if the collector runs on `family`.
    pub fn supports(&self, family: Family) -> bool {
        self.platforms.contains(&family) || self.platforms.contains(&Family::Independent)
    }

    /// Any gate matches; no gates always matches.
    pub fn gates_satisfied(&self, policy: &dyn HostPolicy) -> bool {
        self.gates.is_empty() || self.gates.iter().any(|gate| gate.evaluate(policy))
    }

    pub fn option_spec(&self, key: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|o| o.key == key)
    }
}

/// A registered collector: metadata, a setup hook and an optional refine
/// hook that runs after a collection wave.
#[derive(Clone)]
pub struct Collector {
    pub info: CollectorInfo,
    pub(crate) setup: SetupFn,
    pub(crate) refine: Option<SetupFn>,
}

impl Collector {
    /// A collector with no gates, no profiles and the `independent`
    /// platform tag.
    pub fn new<F>(name: &str, description: &str, setup: F) -> Self
    where
        F: Fn(&mut SetupContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            info: CollectorInfo {
                name: name.to_ascii_lowercase(),
                description: description.to_string(),
                platforms: BTreeSet::from([Family::Independent]),
                profiles: BTreeSet::new(),
                gates: Vec::new(),
                options: Vec::new(),
                default_enabled: true,
            },
            setup: Arc::new(setup),
            refine: None,
        }
    }

    /// Replace the platform tags.
    pub fn platforms(mut self, families: &[Family]) -> Self {
        self.info.platforms = families.iter().copied().collect();
        self
    }

    pub fn profiles(mut self, profiles: &[&str]) -> Self {
        self.info.profiles.extend(profiles.iter().map(|p| p.to_string()));
        self
    }

    pub fn gate(mut self, gate: Gate) -> Self {
        self.info.gates.push(gate);
        self
    }

    pub fn option(mut self, option: OptionSpec) -> Self {
        self.info.options.push(option);
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.info.default_enabled = false;
        self
    }

    pub fn with_refine<F>(mut self, refine: F) -> Self
    where
        F: Fn(&mut SetupContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.refine = Some(Arc::new(refine));
        self
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn has_refine(&self) -> bool {
        self.refine.is_some()
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("info", &self.info)
            .field("refine", &self.refine.is_some())
            .finish()
    }
}

/// Per-run state of one collector.
#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
    pub name: String,
    /// Position in the registry, used for postproc ordering
    #[serde(skip)]
    pub order: usize,
    pub state: CollectorState,
    pub options: BTreeMap<String, OptionValue>,
    #[serde(skip)]
    pub specs: SpecSet,
    pub failures: Vec<String>,
    pub items: Vec<CapturedItem>,
}

impl Descriptor {
    pub fn new(name: &str, order: usize, options: BTreeMap<String, OptionValue>) -> Self {
        Self {
            name: name.to_string(),
            order,
            state: CollectorState::Registered,
            options,
            specs: SpecSet::default(),
            failures: Vec::new(),
            items: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, CollectorState::Registered | CollectorState::Failed)
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = CollectorState::Failed;
        self.failures.push(reason.into());
    }

    /// A collector whose every item failed counts as failed. Collectors
    /// with no items are judged by setup alone.
    pub fn all_items_failed(&self) -> bool {
        let mut relevant = self.items.iter().filter(|i| i.kind != ItemKind::Alert).peekable();
        relevant.peek().is_some() && relevant.all(|i| i.failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::StaticPolicy;

    #[test]
    fn test_builder_defaults() {
        let collector = Collector::new("Host", "host identity", |_| Ok(()));
        assert_eq!(collector.name(), "host");
        assert!(collector.info.default_enabled);
        assert!(collector.info.supports(Family::Debian));
        assert!(!collector.has_refine());
    }

    #[test]
    fn test_platform_filter() {
        let collector = Collector::new("rpm", "", |_| Ok(())).platforms(&[Family::RedHat, Family::Suse]);
        assert!(collector.info.supports(Family::RedHat));
        assert!(!collector.info.supports(Family::Debian));
        assert!(!collector.info.supports(Family::Independent));
    }

    #[test]
    fn test_gates_any_of() {
        let policy = StaticPolicy::new(Family::Debian).with_executable("dpkg");
        let collector = Collector::new("dpkg", "", |_| Ok(()))
            .gate(Gate::PackageInstalled("nonexistent-pkg-xyz".into()))
            .gate(Gate::ExecutableAvailable("dpkg".into()));
        assert!(collector.info.gates_satisfied(&policy));

        let gated = Collector::new("x", "", |_| Ok(()))
            .gate(Gate::PackageInstalled("nonexistent-pkg-xyz".into()));
        assert!(!gated.info.gates_satisfied(&policy));

        let custom = Collector::new("y", "", |_| Ok(()))
            .gate(Gate::custom("debian-family", |p| p.family() == Family::Debian));
        assert!(custom.info.gates_satisfied(&policy));
        assert_eq!(custom.info.gates[0].to_string(), "custom:debian-family");
    }

    #[test]
    fn test_all_items_failed() {
        let mut descriptor = Descriptor::new("x", 0, BTreeMap::new());
        assert!(!descriptor.all_items_failed());

        descriptor.items.push(CapturedItem::alert("x", "/etc/gone", "no match"));
        assert!(!descriptor.all_items_failed());

        let mut failed = CapturedItem::new("x", ItemKind::CopiedFile, "/etc/a").at("etc/a");
        failed.error = Some("cannot open".into());
        descriptor.items.push(failed);
        assert!(descriptor.all_items_failed());

        descriptor.items.push(CapturedItem::new("x", ItemKind::CopiedFile, "/etc/b").at("etc/b"));
        assert!(!descriptor.all_items_failed());
    }
}
