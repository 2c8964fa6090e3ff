//! Executing one wave of declared specs with a bounded worker pool.
//!
//! A blocking producer expands copy specs into tasks and feeds them, along
//! with command and string tasks, into a queue `QUEUE_DEPTH_FACTOR * W`
//! deep. `W` async workers drain it. Copies run on the blocking pool,
//! commands as child processes. Results come back over a crossbeam channel
//! and are merged once the wave has drained.

pub(crate) mod capture;
pub mod command;
pub(crate) mod expand;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Sender};
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::archive::{CopyOptions, StagingArchive, StagingError};
use crate::collectors::specs::{CommandSpec, CopySpec, SpecSet, StringSpec};
use crate::constants::QUEUE_DEPTH_FACTOR;
use crate::models::CapturedItem;
use command::CommandRunner;
use expand::{Expander, SeenSources};

/// One unit of work for a worker.
#[derive(Debug)]
pub enum Task {
    Copy {
        collector: Arc<str>,
        /// Full path on this machine, sysroot included
        source: PathBuf,
        /// Path as the inspected host sees it
        source_ref: String,
        archive_path: String,
        size_limit: Option<u64>,
        mode: Option<u32>,
    },
    Link {
        collector: Arc<str>,
        source_ref: String,
        link_text: String,
        archive_path: String,
    },
    Command {
        collector: Arc<str>,
        spec: CommandSpec,
    },
    Str {
        collector: Arc<str>,
        spec: StringSpec,
    },
}

impl Task {
    fn collector(&self) -> &str {
        match self {
            Task::Copy { collector, .. }
            | Task::Link { collector, .. }
            | Task::Command { collector, .. }
            | Task::Str { collector, .. } => collector,
        }
    }

    fn source_ref(&self) -> String {
        match self {
            Task::Copy { source_ref, .. } | Task::Link { source_ref, .. } => source_ref.clone(),
            Task::Command { spec, .. } => spec.command_line(),
            Task::Str { spec, .. } => spec.archive_path.clone(),
        }
    }
}

/// The executable part of one collector's declarations for a wave.
#[derive(Debug, Clone)]
pub struct WaveJob {
    pub collector: String,
    pub copy_specs: Vec<CopySpec>,
    pub command_specs: Vec<CommandSpec>,
    pub string_specs: Vec<StringSpec>,
}

impl WaveJob {
    pub fn from_specs(collector: &str, specs: &SpecSet) -> Self {
        Self {
            collector: collector.to_string(),
            copy_specs: specs.copy_specs.clone(),
            command_specs: specs.command_specs.clone(),
            string_specs: specs.string_specs.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.copy_specs.is_empty() && self.command_specs.is_empty() && self.string_specs.is_empty()
    }
}

/// State every worker of a wave reads.
struct Shared {
    staging: Arc<StagingArchive>,
    runner: CommandRunner,
    cancel: CancellationToken,
    fatal: Mutex<Option<StagingError>>,
}

impl Shared {
    fn record_fatal(&self, e: StagingError) {
        error!("Fatal staging error, cancelling the run: {}", e);
        if let Ok(mut slot) = self.fatal.lock() {
            if slot.is_none() {
                *slot = Some(e);
            }
        }
        self.cancel.cancel();
    }

    fn take_fatal(&self) -> Option<StagingError> {
        self.fatal.lock().ok().and_then(|mut slot| slot.take())
    }
}

pub struct Scheduler {
    staging: Arc<StagingArchive>,
    sysroot: PathBuf,
    workers: usize,
    default_timeout: Duration,
    cancel: CancellationToken,
    /// Sources planned by earlier waves
    seen: Mutex<SeenSources>,
}

impl Scheduler {
    pub fn new(
        staging: Arc<StagingArchive>,
        sysroot: &Path,
        workers: usize,
        default_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            staging,
            sysroot: sysroot.to_path_buf(),
            workers: workers.max(1),
            default_timeout,
            cancel,
            seen: Mutex::new(SeenSources::default()),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every job to completion, or until the run is cancelled.
    ///
    /// Per-task failures are recorded on the returned items. Only a fatal
    /// staging error fails the wave; it cancels the run token first so the
    /// rest of the pipeline stops too.
    pub async fn run_wave(&self, jobs: Vec<WaveJob>) -> Result<Vec<CapturedItem>, StagingError> {
        let jobs: Vec<WaveJob> = jobs.into_iter().filter(|job| !job.is_empty()).collect();
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let depth = QUEUE_DEPTH_FACTOR * self.workers;
        info!("Starting wave for {} collectors with {} workers", jobs.len(), self.workers);

        let (task_tx, task_rx) = mpsc::channel::<Task>(depth);
        let (result_tx, result_rx) = unbounded::<CapturedItem>();

        let shared = Arc::new(Shared {
            staging: Arc::clone(&self.staging),
            runner: CommandRunner::new(&self.sysroot, self.default_timeout, self.cancel.clone()),
            cancel: self.cancel.clone(),
            fatal: Mutex::new(None),
        });

        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let workers = (0..self.workers)
            .map(|id| {
                let rx = Arc::clone(&task_rx);
                let shared = Arc::clone(&shared);
                let results = result_tx.clone();
                tokio::spawn(async move { worker(id, rx, shared, results).await })
            })
            .collect::<Vec<_>>();

        let seen = self.seen.lock().map(|mut seen| std::mem::take(&mut *seen)).unwrap_or_default();
        let mut expander = Expander::new(
            &self.sysroot,
            Arc::clone(&self.staging),
            task_tx,
            result_tx,
            self.cancel.clone(),
            seen,
        );
        let producer = tokio::task::spawn_blocking(move || {
            produce(&mut expander, jobs);
            expander.into_seen()
        });

        for (id, joined) in join_all(workers).await.into_iter().enumerate() {
            if let Err(e) = joined {
                warn!("Worker {} ended abnormally: {}", id, e);
            }
        }
        // Unblocks a producer still waiting on a full queue
        drop(task_rx);
        match producer.await {
            Ok(seen) => {
                debug!("{} sources planned so far", seen.len());
                if let Ok(mut slot) = self.seen.lock() {
                    *slot = seen;
                }
            }
            Err(e) => warn!("Task producer ended abnormally: {}", e),
        }

        if let Some(fatal) = shared.take_fatal() {
            return Err(fatal);
        }

        let mut items: Vec<CapturedItem> = result_rx.try_iter().collect();
        items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        info!("Wave finished: {} items in {:?}", items.len(), start.elapsed());
        Ok(items)
    }
}

/// Commands and strings go first so long-running commands start early;
/// copy specs are expanded lazily behind them.
fn produce(expander: &mut Expander, jobs: Vec<WaveJob>) {
    let mut copies = Vec::new();
    for job in jobs {
        let collector: Arc<str> = Arc::from(job.collector.as_str());
        for spec in job.command_specs {
            expander.push(Task::Command { collector: Arc::clone(&collector), spec });
        }
        for spec in job.string_specs {
            expander.push(Task::Str { collector: Arc::clone(&collector), spec });
        }
        copies.push((collector, job.copy_specs));
    }
    for (collector, specs) in copies {
        for spec in &specs {
            expander.expand(&collector, spec);
        }
    }
}

async fn worker(
    id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    shared: Arc<Shared>,
    results: Sender<CapturedItem>,
) {
    loop {
        let task = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => None,
                task = queue.recv() => task,
            }
        };
        let task = match task {
            Some(task) => task,
            None => break,
        };

        let collector = task.collector().to_string();
        let source_ref = task.source_ref();
        match execute(&shared, task).await {
            Ok(items) => {
                for item in items {
                    let _ = results.send(item);
                }
            }
            Err(e) if !e.is_fatal() => {
                debug!("[{}] {} not captured: {}", collector, source_ref, e);
                let _ = results.send(CapturedItem::alert(&collector, source_ref, e.to_string()));
            }
            Err(e) => {
                shared.record_fatal(e);
                break;
            }
        }
    }
    debug!("Worker {} finished", id);
}

async fn execute(shared: &Shared, task: Task) -> Result<Vec<CapturedItem>, StagingError> {
    match task {
        Task::Copy { collector, source, source_ref, archive_path, size_limit, mode } => {
            let staging = Arc::clone(&shared.staging);
            let origin = Arc::clone(&collector);
            let shown = source_ref.clone();
            let copied = tokio::task::spawn_blocking(move || {
                let opts = CopyOptions { size_limit, mode_hint: mode };
                staging.add_file(&origin, &source, &archive_path, opts)
            })
            .await;

            let mut item = match copied {
                Ok(result) => result?,
                Err(e) => {
                    return Ok(vec![CapturedItem::alert(&collector, shown, format!("copy task failed: {}", e))]);
                }
            };
            item.source_ref = source_ref;
            let mut items = Vec::new();
            if item.truncated {
                items.push(CapturedItem::alert(
                    &collector,
                    item.source_ref.clone(),
                    format!("file truncated to its last {} bytes", size_limit.unwrap_or(0)),
                ));
            }
            items.insert(0, item);
            Ok(items)
        }
        Task::Link { collector, source_ref, link_text, archive_path } => {
            Ok(vec![shared.staging.add_link(&collector, &source_ref, &link_text, &archive_path)?])
        }
        Task::Command { collector, spec } => shared.runner.run(&shared.staging, &collector, &spec).await,
        Task::Str { collector, spec } => {
            if shared.staging.is_forbidden(&spec.archive_path) {
                return Ok(vec![CapturedItem::alert(
                    &collector,
                    spec.archive_path,
                    "string path is forbidden, not written",
                )]);
            }
            Ok(vec![shared.staging.add_string(&collector, spec.content.as_bytes(), &spec.archive_path)?])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemKind;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _base: TempDir,
        root: PathBuf,
        staging: Arc<StagingArchive>,
    }

    fn fixture() -> Fixture {
        let base = TempDir::new().unwrap();
        let root = base.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("var/log")).unwrap();
        fs::write(root.join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();
        fs::write(root.join("var/log/messages"), "0123456789abcdef").unwrap();
        let staging = Arc::new(StagingArchive::create(&base.path().join("tmp"), "h").unwrap());
        Fixture { _base: base, root, staging }
    }

    fn scheduler(f: &Fixture, workers: usize, cancel: CancellationToken) -> Scheduler {
        Scheduler::new(Arc::clone(&f.staging), &f.root, workers, Duration::from_secs(30), cancel)
    }

    fn job(name: &str) -> WaveJob {
        WaveJob {
            collector: name.to_string(),
            copy_specs: Vec::new(),
            command_specs: Vec::new(),
            string_specs: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wave_runs_every_kind() {
        let f = fixture();
        let mut a = job("a");
        a.copy_specs.push(CopySpec::new("/etc/hosts"));
        a.copy_specs.push(CopySpec::new("/var/log/messages").size_limit(4));
        a.command_specs.push(CommandSpec::new(["echo", "hello"]));
        let mut b = job("b");
        b.string_specs.push(StringSpec {
            content: "synthetic\n".into(),
            archive_path: "sos_strings/b/note".into(),
        });

        let items = scheduler(&f, 2, CancellationToken::new()).run_wave(vec![a, b]).await.unwrap();

        let hosts = items.iter().find(|i| i.archive_path.as_deref() == Some("etc/hosts")).unwrap();
        assert_eq!(hosts.kind, ItemKind::CopiedFile);
        assert_eq!(hosts.source_ref, "/etc/hosts");
        assert_eq!(f.staging.read_captured("etc/hosts").unwrap(), b"127.0.0.1 localhost\n");

        let messages = items.iter().find(|i| i.archive_path.as_deref() == Some("var/log/messages")).unwrap();
        assert!(messages.truncated);
        assert_eq!(f.staging.read_captured("var/log/messages").unwrap(), b"cdef");

        assert!(items.iter().any(|i| i.kind == ItemKind::CommandOutput && i.exit_status == Some(0)));
        assert!(items.iter().any(|i| i.kind == ItemKind::StringFile && i.origin_collector == "b"));
    }

    #[tokio::test]
    async fn test_forbidden_string_path_is_an_alert() {
        let f = fixture();
        f.staging.add_forbidden("sos_strings/b/*").unwrap();
        let mut b = job("b");
        b.string_specs.push(StringSpec {
            content: "x".into(),
            archive_path: "sos_strings/b/note".into(),
        });
        let items = scheduler(&f, 1, CancellationToken::new()).run_wave(vec![b]).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ItemKind::Alert);
        assert!(!f.staging.contains("sos_strings/b/note"));
    }

    #[tokio::test]
    async fn test_cancelled_wave_starts_nothing() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut a = job("a");
        a.copy_specs.push(CopySpec::new("/etc/hosts"));
        a.command_specs.push(CommandSpec::new(["echo", "never"]));

        let items = scheduler(&f, 2, cancel).run_wave(vec![a]).await.unwrap();
        assert!(items.iter().all(|i| i.kind == ItemKind::Alert));
        assert!(!f.staging.contains("etc/hosts"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_many_files_with_small_queue() {
        let f = fixture();
        let dir = f.root.join("usr/share/data");
        fs::create_dir_all(&dir).unwrap();
        for n in 0..200 {
            fs::write(dir.join(format!("f{:03}", n)), format!("{}\n", n)).unwrap();
        }
        let mut a = job("a");
        a.copy_specs.push(CopySpec::new("/usr/share/data"));

        let items = scheduler(&f, 1, CancellationToken::new()).run_wave(vec![a]).await.unwrap();
        assert_eq!(items.iter().filter(|i| i.kind == ItemKind::CopiedFile).count(), 200);
    }

    #[tokio::test]
    async fn test_path_named_in_two_waves_is_copied_once() {
        let f = fixture();
        let scheduler = scheduler(&f, 2, CancellationToken::new());

        let mut a = job("a");
        a.copy_specs.push(CopySpec::new("/etc/hosts"));
        let first = scheduler.run_wave(vec![a]).await.unwrap();
        assert_eq!(first.iter().filter(|i| i.kind == ItemKind::CopiedFile).count(), 1);

        let mut b = job("b");
        b.copy_specs.push(CopySpec::new("/etc/hosts"));
        let second = scheduler.run_wave(vec![b]).await.unwrap();
        assert!(second.iter().all(|i| i.kind != ItemKind::CopiedFile));

        assert!(f.staging.contains("etc/hosts"));
        assert!(!f.staging.contains("etc/hosts_2"));
    }

    #[tokio::test]
    async fn test_empty_jobs_are_skipped() {
        let f = fixture();
        let items = scheduler(&f, 2, CancellationToken::new()).run_wave(vec![job("idle")]).await.unwrap();
        assert!(items.is_empty());
    }
}
