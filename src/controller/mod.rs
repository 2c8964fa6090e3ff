//! Run orchestration.
//!
//! Phases run strictly in sequence: permission check, gating, staging
//! creation, serial setup, collection waves (the first one plus refine
//! rounds), substitution, and finalization. Everything between staging
//! creation and the archive rename is undone on failure unless the
//! configuration asks for the tree to be kept.

pub mod error;
pub mod signals;

pub use error::RunError;

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::{default_output_path, FinalArchive, StagingArchive, StagingError};
use crate::collectors::context::{PriorWave, SetupContext, SpecDefaults};
use crate::collectors::descriptor::{Descriptor, SetupFn};
use crate::collectors::options::OptionValue;
use crate::collectors::registry::{Registry, RunPlan};
use crate::collectors::specs::SpecSet;
use crate::config::RunConfig;
use crate::constants::{MANIFEST_FILE, RUN_LOG_FILE, TOOL_NAME, VERSION_FILE};
use crate::models::{CapturedItem, CollectorState};
use crate::policy::HostPolicy;
use crate::postproc::{self, CollectorRules};
use crate::privileges::check_privileges;
use crate::report::{CollectorRecord, CompressionInfo, HostInfo, IndexRenderer, Manifest, ReportRenderer};
use crate::scheduler::process::SetupScope;
use crate::scheduler::{Scheduler, WaveJob};
use crate::security::validate_output_path;
use signals::TeardownSlot;

/// A run that produced an archive.
#[derive(Debug)]
pub struct RunOutcome {
    pub manifest: Manifest,
    pub archive: FinalArchive,
}

impl RunOutcome {
    /// `0` when every collector succeeded, `2` when any failed.
    pub fn exit_code(&self) -> i32 {
        if self.manifest.failed_collectors().is_empty() {
            0
        } else {
            2
        }
    }

    pub fn item_count(&self) -> usize {
        self.manifest.collectors.iter().map(|c| c.item_count()).sum()
    }

    pub fn failed_item_count(&self) -> usize {
        self.manifest.collectors.iter().map(|c| c.failed_item_count()).sum()
    }
}

/// Result of calling one setup or refine hook.
enum HookOutcome {
    Declared(SpecSet),
    Failed(String),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Archive base name, restricted to `[-a-zA-Z.0-9]`.
pub fn archive_name(config: &RunConfig, hostname: &str, now: DateTime<Local>) -> String {
    let raw = config
        .name
        .clone()
        .unwrap_or_else(|| format!("{}-{}", hostname, now.format("%Y%m%d%H%M%S")));
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        TOOL_NAME.to_string()
    } else {
        cleaned
    }
}

fn staging_error(e: StagingError) -> RunError {
    RunError::Staging(e.to_string())
}

fn distribute(descriptors: &mut [Descriptor], items: Vec<CapturedItem>) {
    for item in items {
        match descriptors.iter_mut().find(|d| d.name == item.origin_collector) {
            Some(descriptor) => descriptor.items.push(item),
            None => warn!("Item from unknown collector {} dropped", item.origin_collector),
        }
    }
}

pub struct Controller {
    config: RunConfig,
    registry: Registry,
    policy: Arc<dyn HostPolicy>,
    renderer: Box<dyn ReportRenderer>,
    run_log: Option<PathBuf>,
    teardown: TeardownSlot,
}

impl Controller {
    pub fn new(config: RunConfig, registry: Registry, policy: Arc<dyn HostPolicy>) -> Self {
        Self {
            config,
            registry,
            policy,
            renderer: Box::new(IndexRenderer),
            run_log: None,
            teardown: TeardownSlot::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Box<dyn ReportRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// The tool's own log file, shipped as `sos_logs/sos.log`.
    pub fn with_run_log(mut self, path: &Path) -> Self {
        self.run_log = Some(path.to_path_buf());
        self
    }

    /// Shared with the signal handler so a forced exit can remove staging.
    pub fn with_teardown(mut self, teardown: TeardownSlot) -> Self {
        self.teardown = teardown;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute one complete run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome, RunError> {
        let started_at = Utc::now();
        let start = Instant::now();

        check_privileges(self.config.require_root)?;
        if let Some(output) = &self.config.output_path {
            validate_output_path(output).map_err(|e| RunError::Config(format!("{:#}", e)))?;
        }

        let plan = self.registry.plan(self.policy.as_ref(), &self.config)?;
        info!("Active collectors: {}", plan.active_names().join(", "));

        let name = archive_name(&self.config, &self.policy.hostname(), Local::now());
        let staging = Arc::new(StagingArchive::create(&self.config.staging_base, &name).map_err(staging_error)?);
        self.teardown.set(staging.private_dir().to_path_buf());
        info!("Staging tree at {}", staging.root().display());

        let deadline_hit = Arc::new(AtomicBool::new(false));
        let deadline = self.config.deadline_s.map(|secs| {
            let cancel = cancel.clone();
            let hit = Arc::clone(&deadline_hit);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        warn!("Global deadline of {}s reached, cancelling", secs);
                        hit.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        });

        let result = self
            .execute(&plan, &name, Arc::clone(&staging), &cancel, &deadline_hit, started_at)
            .await;

        if let Some(handle) = deadline {
            handle.abort();
        }

        match result {
            Ok(outcome) => {
                self.teardown.clear();
                info!("Run finished in {:?}", start.elapsed());
                Ok(outcome)
            }
            Err(e) => {
                error!("Run failed: {}", e);
                if self.config.preserve_staging_on_failure {
                    warn!("Staging tree preserved at {}", staging.root().display());
                } else if let Err(cleanup) = staging.remove_tree() {
                    error!("Failed to remove staging tree: {}", cleanup);
                }
                self.teardown.clear();
                Err(e)
            }
        }
    }

    fn check_cancelled(&self, cancel: &CancellationToken, deadline_hit: &AtomicBool) -> Result<(), RunError> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        if deadline_hit.load(Ordering::SeqCst) {
            Err(RunError::Aborted("global deadline reached".into()))
        } else {
            Err(RunError::Aborted("interrupted".into()))
        }
    }

    async fn execute(
        &self,
        plan: &RunPlan,
        name: &str,
        staging: Arc<StagingArchive>,
        cancel: &CancellationToken,
        deadline_hit: &AtomicBool,
        started_at: DateTime<Utc>,
    ) -> Result<RunOutcome, RunError> {
        let defaults = SpecDefaults::from_config(&self.config);
        let mut descriptors = plan.descriptors();

        // Setup
        for descriptor in descriptors.iter_mut().filter(|d| d.state == CollectorState::Enabled) {
            let entry = match plan.get(&descriptor.name) {
                Some(entry) => entry,
                None => continue,
            };
            let options = descriptor.options.clone();
            match self.run_hook(&entry.collector.setup, &descriptor.name, &options, defaults, None)? {
                HookOutcome::Declared(specs) => {
                    debug!(
                        "[{}] declared {} copy, {} command and {} string specs",
                        descriptor.name,
                        specs.copy_specs.len(),
                        specs.command_specs.len(),
                        specs.string_specs.len()
                    );
                    descriptor.specs = specs;
                    descriptor.state = CollectorState::SetupDone;
                }
                HookOutcome::Failed(reason) => {
                    warn!("[{}] {}", descriptor.name, reason);
                    descriptor.items.push(CapturedItem::alert(&descriptor.name, "setup", reason.clone()));
                    descriptor.fail(reason);
                }
            }
        }
        for descriptor in &descriptors {
            self.register_forbidden(&staging, &descriptor.name, &descriptor.specs)?;
        }
        self.check_cancelled(cancel, deadline_hit)?;

        // Collect
        let scheduler = Scheduler::new(
            Arc::clone(&staging),
            &self.config.sysroot,
            self.config.effective_workers(),
            Duration::from_secs(self.config.command_timeout_s),
            cancel.clone(),
        );
        let jobs: Vec<WaveJob> = descriptors
            .iter()
            .filter(|d| d.state == CollectorState::SetupDone)
            .map(|d| WaveJob::from_specs(&d.name, &d.specs))
            .collect();
        let items = scheduler.run_wave(jobs).await.map_err(staging_error)?;
        self.check_cancelled(cancel, deadline_hit)?;
        distribute(&mut descriptors, items);
        for descriptor in descriptors.iter_mut().filter(|d| d.state == CollectorState::SetupDone) {
            descriptor.state = CollectorState::Collected;
        }

        // Refine
        for round in 1..=self.config.max_refine_rounds {
            let jobs = self.refine_round(plan, &mut descriptors, &staging, defaults, round)?;
            if jobs.is_empty() {
                break;
            }
            info!("Refine round {} runs {} collectors", round, jobs.len());
            let items = scheduler.run_wave(jobs).await.map_err(staging_error)?;
            self.check_cancelled(cancel, deadline_hit)?;
            distribute(&mut descriptors, items);
        }

        for descriptor in descriptors.iter_mut().filter(|d| d.state == CollectorState::Collected) {
            if descriptor.all_items_failed() {
                warn!("[{}] every captured item failed", descriptor.name);
                descriptor.fail("every captured item failed");
            }
        }

        // Substitution
        let rule_sets: Vec<CollectorRules> = descriptors
            .iter()
            .filter(|d| !d.specs.postproc_rules.is_empty())
            .map(|d| CollectorRules {
                collector: d.name.clone(),
                rules: d.specs.postproc_rules.clone(),
            })
            .collect();
        let ledger: Vec<CapturedItem> = descriptors.iter().flat_map(|d| d.items.iter().cloned()).collect();
        let substitutions = postproc::apply(&staging, &rule_sets, &ledger).map_err(staging_error)?;
        distribute(&mut descriptors, substitutions.alerts.clone());
        for descriptor in descriptors.iter_mut().filter(|d| d.state == CollectorState::Collected) {
            descriptor.state = CollectorState::PostProcessed;
        }
        self.check_cancelled(cancel, deadline_hit)?;

        // Finalize
        let compression = self.config.compression.resolve();
        if compression != self.config.compression {
            info!(
                "Compression {} resolved to {}",
                self.config.compression.as_str(),
                compression.as_str()
            );
        }
        let manifest = Manifest {
            tool: TOOL_NAME.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            run_id: Uuid::new_v4().to_string(),
            started_at,
            ended_at: Utc::now(),
            host: HostInfo::probe(self.policy.as_ref()),
            config: self.config.clone(),
            compression: CompressionInfo {
                requested: self.config.compression,
                used: compression,
            },
            collectors: descriptors
                .iter()
                .map(|d| CollectorRecord::from_descriptor(d, substitutions.counts_for(&d.name)))
                .collect(),
        };

        self.write_tool_files(&staging, &manifest)?;
        let output = self
            .config
            .output_path
            .clone()
            .unwrap_or_else(|| default_output_path(&self.config.staging_base, name, compression));
        let archive = staging
            .finalize(&output, compression)
            .await
            .map_err(|e| RunError::Staging(format!("{:#}", e)))?;

        Ok(RunOutcome { manifest, archive })
    }

    fn write_tool_files(&self, staging: &StagingArchive, manifest: &Manifest) -> Result<(), RunError> {
        let version = format!("{} {}\n", TOOL_NAME, env!("CARGO_PKG_VERSION"));
        staging.write_internal(VERSION_FILE, version.as_bytes()).map_err(staging_error)?;

        let json = manifest.to_json().map_err(|e| RunError::Staging(format!("{:#}", e)))?;
        staging.write_internal(MANIFEST_FILE, json.as_bytes()).map_err(staging_error)?;

        if let Err(e) = self.renderer.render(manifest, staging) {
            warn!("Report rendering failed: {:#}", e);
        }

        if let Some(log_path) = &self.run_log {
            match std::fs::read(log_path) {
                Ok(content) => {
                    staging.write_internal(RUN_LOG_FILE, &content).map_err(staging_error)?;
                }
                Err(e) => warn!("Could not copy run log {}: {}", log_path.display(), e),
            }
        }
        Ok(())
    }

    fn register_forbidden(&self, staging: &StagingArchive, collector: &str, specs: &SpecSet) -> Result<(), RunError> {
        for glob in &specs.forbidden_paths {
            match staging.add_forbidden(glob) {
                Ok(()) => debug!("[{}] forbidding {}", collector, glob),
                Err(e) if e.is_fatal() => return Err(staging_error(e)),
                Err(e) => return Err(RunError::Config(format!("[{}] {}", collector, e))),
            }
        }
        Ok(())
    }

    /// Call every refine hook for `round`. Returns the jobs for the next
    /// wave; empty when no collector declared more work.
    fn refine_round(
        &self,
        plan: &RunPlan,
        descriptors: &mut [Descriptor],
        staging: &StagingArchive,
        defaults: SpecDefaults,
        round: usize,
    ) -> Result<Vec<WaveJob>, RunError> {
        let mut jobs = Vec::new();
        for descriptor in descriptors.iter_mut().filter(|d| d.state == CollectorState::Collected) {
            let hook = match plan.get(&descriptor.name).and_then(|e| e.collector.refine.as_ref()) {
                Some(hook) => hook,
                None => continue,
            };

            let prior = PriorWave { items: &descriptor.items, staging };
            let outcome = self.run_hook(hook, &descriptor.name, &descriptor.options, defaults, Some((round, prior)))?;
            match outcome {
                HookOutcome::Declared(specs) => {
                    self.register_forbidden(staging, &descriptor.name, &specs)?;
                    if specs.has_work() {
                        jobs.push(WaveJob::from_specs(&descriptor.name, &specs));
                    }
                    descriptor.specs.absorb(specs);
                }
                HookOutcome::Failed(reason) => {
                    warn!("[{}] refine round {}: {}", descriptor.name, round, reason);
                    descriptor
                        .items
                        .push(CapturedItem::alert(&descriptor.name, "refine", reason.clone()));
                    descriptor.fail(reason);
                }
            }
        }
        Ok(jobs)
    }

    /// Run a hook with subprocess creation blocked. Panics and errors fail
    /// the collector; declaration errors (a rule that does not compile)
    /// fail the run.
    fn run_hook<'a>(
        &'a self,
        hook: &SetupFn,
        name: &'a str,
        options: &'a BTreeMap<String, OptionValue>,
        defaults: SpecDefaults,
        refine: Option<(usize, PriorWave<'a>)>,
    ) -> Result<HookOutcome, RunError> {
        let _scope = SetupScope::enter();
        let mut ctx = SetupContext::new(name, options, self.policy.as_ref(), defaults);
        if let Some((round, prior)) = refine {
            ctx = ctx.for_refine(round, prior);
        }

        let called = catch_unwind(AssertUnwindSafe(|| hook(&mut ctx)));
        match called {
            Ok(Ok(())) => {
                let (specs, errors) = ctx.into_parts();
                if !errors.is_empty() {
                    return Err(RunError::Config(format!("[{}] {}", name, errors.join("; "))));
                }
                Ok(HookOutcome::Declared(specs))
            }
            Ok(Err(e)) => Ok(HookOutcome::Failed(format!("setup failed: {:#}", e))),
            Err(payload) => Ok(HookOutcome::Failed(format!(
                "setup panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}
