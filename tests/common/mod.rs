//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use diag_collector::collectors::{Collector, Registry};
use diag_collector::config::{Compression, RunConfig};
use diag_collector::controller::Controller;
use diag_collector::policy::{Family, StaticPolicy};

/// A fake host root next to a scratch directory for staging and output.
pub struct Host {
    _base: TempDir,
    pub root: PathBuf,
    pub tmp: PathBuf,
}

impl Host {
    pub fn new() -> Self {
        let base = TempDir::new().unwrap();
        let root = base.path().join("root");
        let tmp = base.path().join("tmp");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&tmp).unwrap();
        Self { _base: base, root, tmp }
    }

    /// Write `content` at host path `path` (absolute, as the host sees it).
    pub fn file(&self, path: &str, content: impl AsRef<[u8]>) -> &Self {
        let full = self.root.join(path.trim_start_matches('/'));
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
        self
    }

    pub fn symlink(&self, path: &str, target: &str) -> &Self {
        let full = self.root.join(path.trim_start_matches('/'));
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(target, full).unwrap();
        self
    }

    pub fn output(&self) -> PathBuf {
        self.tmp.join("out.tar")
    }

    pub fn config(&self) -> RunConfig {
        RunConfig {
            name: Some("web01".into()),
            sysroot: self.root.clone(),
            staging_base: self.tmp.clone(),
            output_path: Some(self.output()),
            compression: Compression::None,
            require_root: false,
            workers: Some(4),
            ..RunConfig::default()
        }
    }

    pub fn controller(&self, collectors: Vec<Collector>) -> Controller {
        self.controller_with(self.config(), collectors)
    }

    pub fn controller_with(&self, config: RunConfig, collectors: Vec<Collector>) -> Controller {
        let policy = Arc::new(StaticPolicy::new(Family::Debian).with_sysroot(&self.root));
        Controller::new(config, Registry::new(collectors).unwrap(), policy)
    }

    /// Entries left in the scratch directory other than the archive and
    /// its checksum.
    pub fn leftovers(&self) -> Vec<String> {
        fs::read_dir(&self.tmp)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != "out.tar" && n != "out.tar.sha256")
            .collect()
    }
}

/// What a tarball holds: regular file contents and symlink targets, keyed
/// by path below the top-level archive directory.
#[derive(Debug, Default)]
pub struct Contents {
    pub files: BTreeMap<String, Vec<u8>>,
    pub links: BTreeMap<String, String>,
    pub top: Option<String>,
}

impl Contents {
    pub fn text(&self, path: &str) -> String {
        String::from_utf8_lossy(&self.files[path]).to_string()
    }
}

pub fn read_tarball(path: &Path) -> Contents {
    let mut archive = tar::Archive::new(File::open(path).unwrap());
    let mut contents = Contents::default();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let full = entry.path().unwrap().to_string_lossy().to_string();
        let (top, rest) = match full.split_once('/') {
            Some((top, rest)) => (top.to_string(), rest.trim_end_matches('/').to_string()),
            None => (full.trim_end_matches('/').to_string(), String::new()),
        };
        contents.top.get_or_insert(top);
        if rest.is_empty() {
            continue;
        }
        let header = entry.header().clone();
        if header.entry_type().is_symlink() {
            let target = entry.link_name().unwrap().unwrap().to_string_lossy().to_string();
            contents.links.insert(rest, target);
        } else if header.entry_type().is_file() {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            contents.files.insert(rest, data);
        }
    }
    contents
}
