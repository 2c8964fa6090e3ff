use std::collections::HashSet;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use glob::{MatchOptions, Pattern};
use log::{debug, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::paths::{self, PathError};
use crate::constants::{COMMANDS_DIR, DEFAULT_BUFFER_SIZE, LOGS_DIR, REPORTS_DIR, STRINGS_DIR};
use crate::models::{CapturedItem, ItemKind};

/// Errors raised by the staging archive.
///
/// Only I/O against the staging tree and a poisoned ledger are fatal to the
/// run; everything else is a property of one item.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("invalid archive path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("path is forbidden: {0}")]
    Forbidden(String),
    #[error("archive path conflicts with an existing entry: {0}")]
    Conflict(String),
    #[error("not a captured item: {0}")]
    NotCaptured(String),
    #[error("staging I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("staging ledger lock poisoned")]
    Poisoned,
}

impl StagingError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StagingError::Io { .. } | StagingError::Poisoned)
    }

    fn io(path: &Path, source: io::Error) -> Self {
        StagingError::Io { path: path.to_path_buf(), source }
    }
}

/// Options for copying one host file into the tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    pub size_limit: Option<u64>,
    /// Source mode bits; owner read/write is always added
    pub mode_hint: Option<u32>,
}

struct ForbiddenGlob {
    raw: String,
    pattern: Pattern,
}

#[derive(Default)]
struct Ledger {
    paths: HashSet<String>,
    forbidden: Vec<ForbiddenGlob>,
}

const FORBIDDEN_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// The on-disk scratch tree that becomes the archive.
///
/// Every mutation reserves its path through one internal ledger, so callers
/// on any worker thread get unique, normalized archive paths without locking
/// of their own.
pub struct StagingArchive {
    private_dir: PathBuf,
    root: PathBuf,
    name: String,
    ledger: Mutex<Ledger>,
}

impl StagingArchive {
    /// Create `<base>/<private>/<name>` with mode 0700 plus the fixed
    /// top-level directories.
    pub fn create(base: &Path, name: &str) -> Result<Self, StagingError> {
        fs::create_dir_all(base).map_err(|e| StagingError::io(base, e))?;

        let private_dir = base.join(format!(".diag-collector-{}", Uuid::new_v4()));
        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder
            .create(&private_dir)
            .map_err(|e| StagingError::io(&private_dir, e))?;

        let root = private_dir.join(name);
        builder.create(&root).map_err(|e| StagingError::io(&root, e))?;
        for dir in [LOGS_DIR, REPORTS_DIR, COMMANDS_DIR, STRINGS_DIR] {
            let path = root.join(dir);
            builder.create(&path).map_err(|e| StagingError::io(&path, e))?;
        }

        debug!("Created staging tree at {}", root.display());
        Ok(Self {
            private_dir,
            root,
            name: name.to_string(),
            ledger: Mutex::new(Ledger::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Process-private directory that holds the tree
    pub fn private_dir(&self) -> &Path {
        &self.private_dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_path(&self, archive_path: &str) -> PathBuf {
        self.root.join(archive_path)
    }

    fn ledger(&self) -> Result<MutexGuard<'_, Ledger>, StagingError> {
        self.ledger.lock().map_err(|_| StagingError::Poisoned)
    }

    /// Register a forbidden glob. Patterns are host paths; relative ones are
    /// taken from the host root.
    pub fn add_forbidden(&self, glob: &str) -> Result<(), StagingError> {
        let raw = format!("/{}", glob.trim().trim_start_matches('/').trim_end_matches('/'));
        let pattern = Pattern::new(&raw)
            .map_err(|e| StagingError::Forbidden(format!("{}: {}", glob, e)))?;
        let mut ledger = self.ledger()?;
        if !ledger.forbidden.iter().any(|f| f.raw == raw) {
            ledger.forbidden.push(ForbiddenGlob { raw, pattern });
        }
        Ok(())
    }

    pub fn forbidden_patterns(&self) -> Vec<String> {
        match self.ledger() {
            Ok(ledger) => ledger.forbidden.iter().map(|f| f.raw.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// True if `path`, or any directory above it, matches a forbidden glob.
    /// Accepts host paths (`/etc/shadow`) and archive paths (`etc/shadow`).
    pub fn is_forbidden(&self, path: &str) -> bool {
        let ledger = match self.ledger() {
            Ok(ledger) => ledger,
            Err(_) => return true,
        };
        if ledger.forbidden.is_empty() {
            return false;
        }

        let candidate = format!("/{}", path.trim_start_matches('/').trim_end_matches('/'));
        let mut prefixes: Vec<&str> = candidate
            .match_indices('/')
            .skip(1)
            .map(|(i, _)| &candidate[..i])
            .collect();
        prefixes.push(&candidate);

        prefixes.iter().any(|prefix| {
            ledger
                .forbidden
                .iter()
                .any(|f| f.pattern.matches_with(prefix, FORBIDDEN_MATCH))
        })
    }

    fn taken(ledger: &Ledger, root: &Path, candidate: &str) -> bool {
        ledger.paths.contains(candidate) || root.join(candidate).symlink_metadata().is_ok()
    }

    /// The path `archive_path` would be stored at, after normalization and
    /// `_N` collision suffixing. Does not reserve it.
    pub fn resolve_collision(&self, archive_path: &str) -> Result<String, StagingError> {
        let normalized = paths::normalize(archive_path)?;
        let ledger = self.ledger()?;
        Ok(Self::first_free(&ledger, &self.root, &normalized))
    }

    fn first_free(ledger: &Ledger, root: &Path, normalized: &str) -> String {
        if !Self::taken(ledger, root, normalized) {
            return normalized.to_string();
        }
        (2..)
            .map(|n| paths::collision_candidate(normalized, n))
            .find(|candidate| !Self::taken(ledger, root, candidate))
            .unwrap_or_else(|| normalized.to_string())
    }

    /// Claim a unique archive path.
    pub fn reserve(&self, archive_path: &str) -> Result<String, StagingError> {
        let normalized = paths::normalize(archive_path)?;
        let mut ledger = self.ledger()?;
        let unique = Self::first_free(&ledger, &self.root, &normalized);
        if unique != normalized {
            debug!("Archive path {} taken, using {}", normalized, unique);
        }
        ledger.paths.insert(unique.clone());
        Ok(unique)
    }

    /// Drop a reservation and whatever was written at it.
    pub fn release(&self, archive_path: &str) -> Result<(), StagingError> {
        let mut ledger = self.ledger()?;
        ledger.paths.remove(archive_path);
        let full = self.full_path(archive_path);
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagingError::io(&full, e)),
        }
    }

    pub fn contains(&self, archive_path: &str) -> bool {
        self.ledger()
            .map(|ledger| ledger.paths.contains(archive_path))
            .unwrap_or(false)
    }

    fn ensure_parent(&self, archive_path: &str, full: &Path) -> Result<(), StagingError> {
        let parent = match full.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };
        match fs::create_dir_all(parent) {
            Ok(()) => Ok(()),
            Err(_) if parent.ancestors().any(|a| a.is_file() || a.is_symlink()) => {
                Err(StagingError::Conflict(archive_path.to_string()))
            }
            Err(e) => Err(StagingError::io(parent, e)),
        }
    }

    /// Reserve a path and create its parent directories; rolls the
    /// reservation back if the directories cannot be made.
    fn prepare(&self, archive_path: &str) -> Result<(String, PathBuf), StagingError> {
        let reserved = self.reserve(archive_path)?;
        let full = self.full_path(&reserved);
        if let Err(e) = self.ensure_parent(&reserved, &full) {
            if let Ok(mut ledger) = self.ledger() {
                ledger.paths.remove(&reserved);
            }
            return Err(e);
        }
        Ok((reserved, full))
    }

    fn write_placeholder(full: &Path) -> Result<(), StagingError> {
        File::create(full).map(|_| ()).map_err(|e| StagingError::io(full, e))
    }

    /// Copy a host file into the tree.
    ///
    /// Sources that cannot be read leave a zero-byte placeholder and an item
    /// with `error` set. A source larger than `size_limit` is tail-captured:
    /// only its last `size_limit` bytes are kept and the item is marked
    /// truncated.
    pub fn add_file(
        &self,
        origin: &str,
        src: &Path,
        archive_path: &str,
        opts: CopyOptions,
    ) -> Result<CapturedItem, StagingError> {
        let (reserved, full) = self.prepare(archive_path)?;
        let mut item = CapturedItem::new(origin, ItemKind::CopiedFile, src.to_string_lossy()).at(&reserved);

        let meta = match fs::metadata(src) {
            Ok(meta) => meta,
            Err(e) => {
                Self::write_placeholder(&full)?;
                item.error = Some(format!("cannot stat source: {}", e));
                return Ok(item);
            }
        };

        if meta.permissions().mode() & 0o444 == 0 {
            Self::write_placeholder(&full)?;
            item.error = Some(format!("source unreadable (mode {:o})", meta.permissions().mode() & 0o7777));
            return Ok(item);
        }

        let mut source = match File::open(src) {
            Ok(file) => file,
            Err(e) => {
                Self::write_placeholder(&full)?;
                item.error = Some(format!("cannot open source: {}", e));
                return Ok(item);
            }
        };

        let size = meta.len();
        let mut remaining = opts.size_limit;
        if let Some(limit) = opts.size_limit {
            if size > limit {
                if let Err(e) = source.seek(SeekFrom::Start(size - limit)) {
                    Self::write_placeholder(&full)?;
                    item.error = Some(format!("cannot seek source: {}", e));
                    return Ok(item);
                }
                item.truncated = true;
                remaining = Some(limit);
            }
        }

        let mut dest = File::create(&full).map_err(|e| StagingError::io(&full, e))?;
        let mut reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, source);
        let mut buffer = vec![0u8; DEFAULT_BUFFER_SIZE];

        loop {
            let want = match remaining {
                Some(0) => break,
                Some(left) => std::cmp::min(left, buffer.len() as u64) as usize,
                None => buffer.len(),
            };
            let read = match reader.read(&mut buffer[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    item.error = Some(format!("read failed after {} bytes: {}", item.bytes_written, e));
                    break;
                }
            };
            dest.write_all(&buffer[..read]).map_err(|e| StagingError::io(&full, e))?;
            item.bytes_written += read as u64;
            if let Some(left) = remaining.as_mut() {
                *left -= read as u64;
            }
        }

        if let Some(mode) = opts.mode_hint {
            let mode = (mode & 0o777) | 0o600;
            if let Err(e) = fs::set_permissions(&full, fs::Permissions::from_mode(mode)) {
                warn!("Failed to set mode on {}: {}", full.display(), e);
            }
        }

        Ok(item)
    }

    /// Write synthetic content.
    pub fn add_string(&self, origin: &str, content: &[u8], archive_path: &str) -> Result<CapturedItem, StagingError> {
        let (reserved, full) = self.prepare(archive_path)?;
        fs::write(&full, content).map_err(|e| StagingError::io(&full, e))?;

        let mut item = CapturedItem::new(origin, ItemKind::StringFile, "string").at(&reserved);
        item.bytes_written = content.len() as u64;
        Ok(item)
    }

    /// Create a symlink whose relative `link_text` must resolve inside the
    /// tree. A link that would escape is not created; an alert item is
    /// returned instead.
    pub fn add_link(
        &self,
        origin: &str,
        source_ref: &str,
        link_text: &str,
        archive_path: &str,
    ) -> Result<CapturedItem, StagingError> {
        let (reserved, full) = self.prepare(archive_path)?;
        if !paths::link_stays_inside(&reserved, link_text) {
            self.release(&reserved)?;
            return Ok(CapturedItem::alert(
                origin,
                source_ref,
                format!("link target {} escapes the archive, link dropped", link_text),
            ));
        }

        std::os::unix::fs::symlink(link_text, &full).map_err(|e| StagingError::io(&full, e))?;
        Ok(CapturedItem::new(origin, ItemKind::CopiedSymlink, source_ref).at(&reserved))
    }

    /// Reserve a path and open a fresh file there for a subprocess to write.
    pub fn create_output(&self, archive_path: &str) -> Result<(String, File), StagingError> {
        let (reserved, full) = self.prepare(archive_path)?;
        let file = File::create(&full).map_err(|e| StagingError::io(&full, e))?;
        Ok((reserved, file))
    }

    /// Write a tool-owned file (manifest, report, version) into the tree.
    pub fn write_internal(&self, archive_path: &str, content: &[u8]) -> Result<String, StagingError> {
        let (reserved, full) = self.prepare(archive_path)?;
        fs::write(&full, content).map_err(|e| StagingError::io(&full, e))?;
        Ok(reserved)
    }

    /// Read/write handle on already captured content.
    pub fn open_captured(&self, archive_path: &str) -> Result<File, StagingError> {
        if !self.contains(archive_path) {
            return Err(StagingError::NotCaptured(archive_path.to_string()));
        }
        let full = self.full_path(archive_path);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&full)
            .map_err(|e| StagingError::io(&full, e))
    }

    pub fn read_captured(&self, archive_path: &str) -> Result<Vec<u8>, StagingError> {
        let mut file = self.open_captured(archive_path)?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .map_err(|e| StagingError::io(&self.full_path(archive_path), e))?;
        Ok(content)
    }

    /// Overwrite captured content in place.
    pub fn replace_captured(&self, archive_path: &str, content: &[u8]) -> Result<(), StagingError> {
        let mut file = self.open_captured(archive_path)?;
        let full = self.full_path(archive_path);
        file.set_len(0).map_err(|e| StagingError::io(&full, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| StagingError::io(&full, e))?;
        file.write_all(content).map_err(|e| StagingError::io(&full, e))?;
        Ok(())
    }

    pub fn captured_len(&self, archive_path: &str) -> u64 {
        fs::symlink_metadata(self.full_path(archive_path))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Delete the whole private directory.
    pub fn remove_tree(&self) -> Result<(), StagingError> {
        match fs::remove_dir_all(&self.private_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagingError::io(&self.private_dir, e)),
        }
    }
}
