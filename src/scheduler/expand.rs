//! Turning copy specs into concrete copy tasks.
//!
//! Runs on a blocking thread and feeds the bounded task queue, so a large
//! recursive tree is expanded no faster than workers drain it.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel::Sender;
use glob::{glob_with, MatchOptions, Pattern};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::archive::paths::{self, apply_rename, host_to_archive};
use crate::archive::StagingArchive;
use crate::collectors::specs::CopySpec;
use crate::models::CapturedItem;
use crate::scheduler::Task;

/// Node types that are never copied
fn special_kind(file_type: &fs::FileType) -> Option<&'static str> {
    if file_type.is_fifo() {
        Some("fifo")
    } else if file_type.is_socket() {
        Some("socket")
    } else if file_type.is_block_device() {
        Some("block device")
    } else if file_type.is_char_device() {
        Some("character device")
    } else {
        None
    }
}

/// Sources already planned during this run. Outlives a single wave so a
/// path a later collector names again is not copied a second time.
#[derive(Debug, Default)]
pub(crate) struct SeenSources {
    /// `(dev, inode)` of every symlink already planned
    links: HashSet<(u64, u64)>,
    /// Host paths already queued for copying
    sources: HashSet<PathBuf>,
}

impl SeenSources {
    pub(crate) fn len(&self) -> usize {
        self.sources.len()
    }
}

/// Producer side of one collection wave.
pub(crate) struct Expander {
    sysroot: PathBuf,
    staging: Arc<StagingArchive>,
    tasks: mpsc::Sender<Task>,
    notes: Sender<CapturedItem>,
    cancel: CancellationToken,
    seen: SeenSources,
    closed: bool,
}

/// What one copy spec resolves against.
struct SpecScope<'a> {
    collector: &'a Arc<str>,
    spec: &'a CopySpec,
}

impl Expander {
    pub(crate) fn new(
        sysroot: &Path,
        staging: Arc<StagingArchive>,
        tasks: mpsc::Sender<Task>,
        notes: Sender<CapturedItem>,
        cancel: CancellationToken,
        seen: SeenSources,
    ) -> Self {
        Self {
            sysroot: sysroot.to_path_buf(),
            staging,
            tasks,
            notes,
            cancel,
            seen,
            closed: false,
        }
    }

    /// Close the queue and hand back what was planned, for the next wave.
    pub(crate) fn into_seen(self) -> SeenSources {
        self.seen
    }

    /// False once the queue is gone or the run was cancelled.
    fn open(&self) -> bool {
        !self.closed && !self.cancel.is_cancelled()
    }

    /// Queue a task, blocking while the queue is full.
    pub(crate) fn push(&mut self, task: Task) {
        if !self.open() {
            return;
        }
        if self.tasks.blocking_send(task).is_err() {
            debug!("Task queue closed, stopping expansion");
            self.closed = true;
        }
    }

    fn note(&self, item: CapturedItem) {
        let _ = self.notes.send(item);
    }

    /// Host path, as the host sees it, of a path found under the sysroot.
    fn host_path(&self, full: &Path) -> PathBuf {
        match full.strip_prefix(&self.sysroot) {
            Ok(relative) => Path::new("/").join(relative),
            Err(_) => full.to_path_buf(),
        }
    }

    fn full_path(&self, host: &Path) -> PathBuf {
        self.sysroot.join(host.strip_prefix("/").unwrap_or(host))
    }

    fn archive_path(&self, host: &Path, spec: &CopySpec) -> Result<String, paths::PathError> {
        let archive = host_to_archive(host, Path::new("/"))?;
        Ok(match &spec.rename {
            Some(rename) => apply_rename(&archive, rename),
            None => archive,
        })
    }

    fn forbidden(&self, scope: &SpecScope<'_>, host: &Path) -> bool {
        if self.staging.is_forbidden(&host.to_string_lossy()) {
            debug!("[{}] {} is forbidden, dropped", scope.collector, host.display());
            self.note(CapturedItem::alert(
                scope.collector,
                host.to_string_lossy(),
                "matches a forbidden path, not captured",
            ));
            return true;
        }
        false
    }

    /// Expand one copy spec.
    pub(crate) fn expand(&mut self, collector: &Arc<str>, spec: &CopySpec) {
        let scope = SpecScope { collector, spec };
        let pattern = format!(
            "{}/{}",
            Pattern::escape(&self.sysroot.to_string_lossy()).trim_end_matches('/'),
            spec.pattern.trim_start_matches('/')
        );

        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let matches = match glob_with(&pattern, options) {
            Ok(matches) => matches,
            Err(e) => {
                warn!("[{}] malformed glob {}: {}", collector, spec.pattern, e);
                self.note(CapturedItem::alert(
                    collector,
                    spec.pattern.clone(),
                    format!("malformed glob, no matches: {}", e),
                ));
                return;
            }
        };

        let mut count = 0usize;
        for entry in matches {
            if !self.open() {
                return;
            }
            match entry {
                Ok(full) => {
                    count += 1;
                    let host = self.host_path(&full);
                    self.visit(&scope, &host, true);
                }
                Err(e) => debug!("[{}] glob entry unreadable: {}", collector, e),
            }
        }
        if count == 0 {
            debug!("[{}] {} matched nothing", collector, spec.pattern);
        }
    }

    /// Plan one host path. `descend` is false for paths reached through a
    /// symlink, whose directories are not walked.
    fn visit(&mut self, scope: &SpecScope<'_>, host: &Path, descend: bool) {
        if !self.open() || self.forbidden(scope, host) {
            return;
        }

        let full = self.full_path(host);
        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(_) => {
                // Let the copy record the error on its own item
                self.queue_copy(scope, host, None);
                return;
            }
        };
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            self.visit_link(scope, host, &full, (meta.dev(), meta.ino()));
        } else if file_type.is_dir() {
            if descend {
                self.walk(scope, host, &full);
            }
        } else if let Some(kind) = special_kind(&file_type) {
            self.note(CapturedItem::alert(
                scope.collector,
                host.to_string_lossy(),
                format!("{} not copied", kind),
            ));
        } else {
            self.queue_copy(scope, host, Some(meta.mode()));
        }
    }

    fn queue_copy(&mut self, scope: &SpecScope<'_>, host: &Path, mode: Option<u32>) {
        if !self.seen.sources.insert(host.to_path_buf()) {
            return;
        }
        let archive_path = match self.archive_path(host, scope.spec) {
            Ok(path) => path,
            Err(e) => {
                self.note(CapturedItem::alert(scope.collector, host.to_string_lossy(), e.to_string()));
                return;
            }
        };
        if self.staging.is_forbidden(&archive_path) {
            self.note(CapturedItem::alert(
                scope.collector,
                host.to_string_lossy(),
                "archive path matches a forbidden path, not captured",
            ));
            return;
        }

        let task = Task::Copy {
            collector: Arc::clone(scope.collector),
            source: self.full_path(host),
            source_ref: host.to_string_lossy().to_string(),
            archive_path,
            size_limit: scope.spec.size_limit,
            mode,
        };
        self.push(task);
    }

    fn visit_link(&mut self, scope: &SpecScope<'_>, host: &Path, full: &Path, key: (u64, u64)) {
        if !self.seen.links.insert(key) {
            return;
        }
        if !self.seen.sources.insert(host.to_path_buf()) {
            return;
        }

        let raw = match fs::read_link(full) {
            Ok(raw) => raw,
            Err(e) => {
                self.note(CapturedItem::alert(
                    scope.collector,
                    host.to_string_lossy(),
                    format!("cannot read link: {}", e),
                ));
                return;
            }
        };

        let target_host = if raw.is_absolute() {
            raw.clone()
        } else {
            host.parent().unwrap_or_else(|| Path::new("/")).join(&raw)
        };
        let target_host = match paths::normalize(&target_host.to_string_lossy()) {
            Ok(normalized) => PathBuf::from(format!("/{}", normalized)),
            Err(e) => {
                self.note(CapturedItem::alert(
                    scope.collector,
                    host.to_string_lossy(),
                    format!("link target {} unusable: {}", raw.display(), e),
                ));
                return;
            }
        };

        let (link_archive, target_archive) = match (
            self.archive_path(host, scope.spec),
            self.archive_path(&target_host, scope.spec),
        ) {
            (Ok(link), Ok(target)) => (link, target),
            (Err(e), _) | (_, Err(e)) => {
                self.note(CapturedItem::alert(scope.collector, host.to_string_lossy(), e.to_string()));
                return;
            }
        };

        self.push(Task::Link {
            collector: Arc::clone(scope.collector),
            source_ref: host.to_string_lossy().to_string(),
            link_text: paths::relative_link_target(&link_archive, &target_archive),
            archive_path: link_archive,
        });

        // A dangling link is kept as a link; there is nothing to copy
        if let Err(e) = fs::symlink_metadata(self.full_path(&target_host)) {
            debug!(
                "[{}] {} points at missing {}: {}",
                scope.collector,
                host.display(),
                target_host.display(),
                e
            );
            return;
        }

        // The target follows the link unless it is a directory
        self.visit(scope, &target_host, false);
    }

    fn walk(&mut self, scope: &SpecScope<'_>, host: &Path, full: &Path) {
        let mut entries = WalkDir::new(full).follow_links(false).min_depth(1).into_iter();

        while let Some(entry) = entries.next() {
            if !self.open() {
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(|p| self.host_path(p)).unwrap_or_else(|| host.to_path_buf());
                    self.note(CapturedItem::alert(
                        scope.collector,
                        path.to_string_lossy(),
                        format!("cannot read directory entry: {}", e),
                    ));
                    continue;
                }
            };

            let child = self.host_path(entry.path());
            if entry.file_type().is_dir() {
                if self.forbidden(scope, &child) {
                    entries.skip_current_dir();
                }
                continue;
            }
            self.visit(scope, &child, false);
        }
    }
}
