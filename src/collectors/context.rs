//! The surface a collector sees during setup.
//!
//! Setup declares specs; it does not touch the host. The only host view is
//! the read-only [`HostPolicy`], and the only captured content a collector
//! can read back is its own, from the staging tree, during a refine round.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use log::debug;

use crate::archive::paths;
use crate::archive::StagingArchive;
use crate::collectors::options::OptionValue;
use crate::collectors::specs::{
    CommandSpec, CopySpec, JournalQuery, Scope, SpecSet, StringSpec, SubstitutionRule,
};
use crate::config::RunConfig;
use crate::constants::{JOURNAL_MIN_SIZE_MB, MIB, STRINGS_DIR};
use crate::models::{CapturedItem, ItemKind};
use crate::policy::HostPolicy;

/// Run-wide defaults applied to specs as they are declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecDefaults {
    pub log_size: Option<u64>,
    pub all_logs: bool,
    pub command_timeout_s: u64,
}

impl SpecDefaults {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            log_size: config.log_size_bytes(),
            all_logs: config.all_logs,
            command_timeout_s: config.command_timeout_s,
        }
    }

    /// Cap for a copy spec that did not set its own.
    pub fn copy_limit(&self, log: bool) -> Option<u64> {
        if log && self.all_logs {
            None
        } else {
            self.log_size
        }
    }

    /// Cap for journal excerpts: at least `JOURNAL_MIN_SIZE_MB`.
    pub fn journal_limit(&self) -> Option<u64> {
        if self.all_logs {
            return None;
        }
        self.log_size.map(|size| size.max(JOURNAL_MIN_SIZE_MB * MIB))
    }
}

/// What a refine hook can see of the previous wave.
#[derive(Clone, Copy)]
pub struct PriorWave<'a> {
    pub items: &'a [CapturedItem],
    pub staging: &'a StagingArchive,
}

pub struct SetupContext<'a> {
    collector: &'a str,
    options: &'a BTreeMap<String, OptionValue>,
    policy: &'a dyn HostPolicy,
    defaults: SpecDefaults,
    round: usize,
    prior: Option<PriorWave<'a>>,
    specs: SpecSet,
    errors: Vec<String>,
}

impl<'a> SetupContext<'a> {
    pub fn new(
        collector: &'a str,
        options: &'a BTreeMap<String, OptionValue>,
        policy: &'a dyn HostPolicy,
        defaults: SpecDefaults,
    ) -> Self {
        Self {
            collector,
            options,
            policy,
            defaults,
            round: 0,
            prior: None,
            specs: SpecSet::default(),
            errors: Vec::new(),
        }
    }

    /// Context for refine round `round` (1-based).
    pub fn for_refine(mut self, round: usize, prior: PriorWave<'a>) -> Self {
        self.round = round;
        self.prior = Some(prior);
        self
    }

    pub fn collector(&self) -> &str {
        self.collector
    }

    pub fn policy(&self) -> &dyn HostPolicy {
        self.policy
    }

    /// 0 during setup, N during the Nth refine round
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    pub fn option_bool(&self, name: &str) -> bool {
        self.option(name).map(OptionValue::as_bool).unwrap_or(false)
    }

    pub fn option_int(&self, name: &str) -> Option<i64> {
        self.option(name).and_then(OptionValue::as_int)
    }

    pub fn option_str(&self, name: &str) -> Option<String> {
        self.option(name).map(|v| v.to_string())
    }

    pub fn add_copy_spec(&mut self, pattern: &str) {
        self.add_copy_spec_with(CopySpec::new(pattern));
    }

    pub fn add_copy_specs(&mut self, patterns: &[&str]) {
        for pattern in patterns {
            self.add_copy_spec(pattern);
        }
    }

    /// Declare a copy spec with explicit settings. A spec without its own
    /// size limit gets the run default.
    pub fn add_copy_spec_with(&mut self, mut spec: CopySpec) {
        if spec.size_limit.is_none() {
            spec.size_limit = self.defaults.copy_limit(spec.log);
        }
        debug!("[{}] copy spec {}", self.collector, spec.pattern);
        self.specs.copy_specs.push(spec);
    }

    pub fn add_forbidden_path(&mut self, glob: &str) {
        self.specs.forbidden_paths.push(glob.to_string());
    }

    pub fn add_forbidden_paths(&mut self, globs: &[&str]) {
        for glob in globs {
            self.add_forbidden_path(glob);
        }
    }

    pub fn add_cmd_output(&mut self, argv: &[&str]) {
        self.add_cmd(CommandSpec::new(argv.iter().copied()));
    }

    pub fn add_cmd(&mut self, mut spec: CommandSpec) {
        if spec.argv.is_empty() {
            self.errors.push("command spec with empty argv".to_string());
            return;
        }
        if spec.timeout_s.is_none() {
            spec.timeout_s = Some(self.defaults.command_timeout_s);
        }
        self.specs.command_specs.push(spec);
    }

    /// Synthetic content, stored under `sos_strings/<collector>/`.
    pub fn add_string_as_file(&mut self, content: &str, archive_path: &str) {
        match paths::normalize(archive_path) {
            Ok(relative) => self.specs.string_specs.push(StringSpec {
                content: content.to_string(),
                archive_path: format!("{}/{}/{}", STRINGS_DIR, self.collector, relative),
            }),
            Err(e) => self.errors.push(format!("string spec {}: {}", archive_path, e)),
        }
    }

    pub fn add_journal(&mut self, query: JournalQuery) {
        let spec = query.to_command(self.defaults.journal_limit());
        self.add_cmd(spec);
    }

    pub fn add_alert(&mut self, text: &str) {
        self.specs.alerts.push(text.to_string());
    }

    pub fn add_custom_text(&mut self, html: &str) {
        self.specs.custom_text.push(html.to_string());
    }

    /// Register a substitution. A rule that does not compile is recorded
    /// as a configuration error for the run.
    pub fn add_postproc_substitution(&mut self, scope: Scope, pattern: &str, replacement: &str) {
        match SubstitutionRule::compile(scope, pattern, replacement) {
            Ok(rule) => self.specs.postproc_rules.push(rule),
            Err(e) => self.errors.push(format!("substitution rule: {}", e)),
        }
    }

    /// Items this collector captured in earlier waves. Empty during setup.
    pub fn captured(&self) -> &[CapturedItem] {
        self.prior.map(|p| p.items).unwrap_or(&[])
    }

    /// Read back one of this collector's captured files from the staging
    /// tree. Only available in refine rounds.
    pub fn read_captured(&self, archive_path: &str) -> Result<Vec<u8>> {
        let prior = self
            .prior
            .ok_or_else(|| anyhow!("captured content is not available during setup"))?;
        if !prior.items.iter().any(|i| i.archive_path.as_deref() == Some(archive_path)) {
            return Err(anyhow!("{} was not captured by {}", archive_path, self.collector));
        }
        Ok(prior.staging.read_captured(archive_path)?)
    }

    /// The archive path of this collector's output for a command whose
    /// program basename is `program`, if one was captured.
    pub fn command_output(&self, program: &str) -> Option<&str> {
        self.captured()
            .iter()
            .filter(|i| i.kind == ItemKind::CommandOutput)
            .filter(|i| i.error.is_none())
            .find(|i| {
                i.source_ref
                    .split_whitespace()
                    .next()
                    .map(|p| p.rsplit('/').next().unwrap_or(p) == program)
                    .unwrap_or(false)
            })
            .and_then(|i| i.archive_path.as_deref())
    }

    pub fn into_parts(self) -> (SpecSet, Vec<String>) {
        (self.specs, self.errors)
    }
}
