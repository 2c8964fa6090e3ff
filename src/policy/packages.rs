//! Native package database queries, loaded once per run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::policy::Family;

/// Which package manager answers the `installed` question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Rpm,
    Dpkg,
    Unknown,
}

impl PackageManager {
    pub fn for_family(family: Family) -> Self {
        if family.uses_rpm() {
            PackageManager::Rpm
        } else if family.uses_dpkg() {
            PackageManager::Dpkg
        } else {
            PackageManager::Unknown
        }
    }

    /// Query command for the database under `sysroot`. A sysroot other than
    /// `/` points the tool at the mounted image instead of the live host.
    fn query_argv(&self, sysroot: &Path) -> Option<Vec<String>> {
        let foreign = sysroot != Path::new("/");
        let argv = match self {
            PackageManager::Rpm => {
                let mut argv = vec!["rpm".to_string(), "-qa".to_string()];
                if foreign {
                    argv.push("--root".to_string());
                    argv.push(sysroot.display().to_string());
                }
                argv.push("--queryformat".to_string());
                argv.push("%{NAME}|%{VERSION}\\n".to_string());
                argv
            }
            PackageManager::Dpkg => {
                let mut argv = vec!["dpkg-query".to_string()];
                if foreign {
                    argv.push(format!("--admindir={}", sysroot.join("var/lib/dpkg").display()));
                }
                argv.push("-W".to_string());
                argv.push("-f=${Package}|${Version}|${db:Status-Abbrev}\\n".to_string());
                argv
            }
            PackageManager::Unknown => return None,
        };
        Some(argv)
    }
}

/// Parse `name|version` lines emitted by the rpm query.
pub fn parse_rpm_listing(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| line.split('|').next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `name|version|status` lines emitted by dpkg-query, keeping only
/// packages whose status says they are installed (`ii` or held `hi`).
pub fn parse_dpkg_listing(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('|');
            let name = fields.next()?.trim();
            let _version = fields.next()?;
            let status = fields.next()?.trim();
            let installed = status.starts_with("ii") || status.starts_with("hi");
            (installed && !name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// Lazily loaded package set with per-name memoization.
#[derive(Debug)]
pub struct PackageDb {
    manager: PackageManager,
    sysroot: PathBuf,
    installed: OnceLock<HashSet<String>>,
    answers: Mutex<HashMap<String, bool>>,
}

impl PackageDb {
    pub fn new(manager: PackageManager, sysroot: &Path) -> Self {
        Self {
            manager,
            sysroot: sysroot.to_path_buf(),
            installed: OnceLock::new(),
            answers: Mutex::new(HashMap::new()),
        }
    }

    /// Build a database whose contents are already known.
    pub fn preloaded(manager: PackageManager, names: HashSet<String>) -> Self {
        let db = Self::new(manager, Path::new("/"));
        let _ = db.installed.set(names);
        db
    }

    pub fn manager(&self) -> PackageManager {
        self.manager
    }

    pub fn is_installed(&self, name: &str) -> bool {
        if let Ok(answers) = self.answers.lock() {
            if let Some(known) = answers.get(name) {
                return *known;
            }
        }

        let installed = self.installed().contains(name);
        if let Ok(mut answers) = self.answers.lock() {
            answers.insert(name.to_string(), installed);
        }
        installed
    }

    fn installed(&self) -> &HashSet<String> {
        self.installed.get_or_init(|| match self.load() {
            Ok(names) => {
                debug!("Loaded {} installed packages", names.len());
                names
            }
            Err(e) => {
                warn!("Package database unavailable, treating every package as absent: {:#}", e);
                HashSet::new()
            }
        })
    }

    fn load(&self) -> Result<HashSet<String>> {
        let argv = match self.manager.query_argv(&self.sysroot) {
            Some(argv) => argv,
            None => return Ok(HashSet::new()),
        };

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .context(format!("Failed to execute {}", argv[0]))?;

        if !output.status.success() {
            bail!("{} exited with {}", argv[0], output.status);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(match self.manager {
            PackageManager::Rpm => parse_rpm_listing(&text),
            PackageManager::Dpkg => parse_dpkg_listing(&text),
            PackageManager::Unknown => HashSet::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rpm_listing() {
        let names = parse_rpm_listing("bash|5.1.8\nkernel|5.14.0\n\nopenssh-server|8.7p1\n");
        assert_eq!(names.len(), 3);
        assert!(names.contains("kernel"));
        assert!(names.contains("openssh-server"));
    }

    #[test]
    fn test_parse_dpkg_listing_skips_removed() {
        let listing = "bash|5.2-1|ii \nsystemd|252|hi \nold-pkg|1.0|rc \nbroken\n";
        let names = parse_dpkg_listing(listing);
        assert!(names.contains("bash"));
        assert!(names.contains("systemd"));
        assert!(!names.contains("old-pkg"));
        assert!(!names.contains("broken"));
    }

    #[test]
    fn test_manager_for_family() {
        assert_eq!(PackageManager::for_family(Family::RedHat), PackageManager::Rpm);
        assert_eq!(PackageManager::for_family(Family::Debian), PackageManager::Dpkg);
        assert_eq!(PackageManager::for_family(Family::Independent), PackageManager::Unknown);
    }

    #[test]
    fn test_unknown_manager_reports_nothing_installed() {
        let db = PackageDb::new(PackageManager::Unknown, Path::new("/"));
        assert!(!db.is_installed("bash"));
    }

    #[test]
    fn test_query_targets_live_host_by_default() {
        let argv = PackageManager::Rpm.query_argv(Path::new("/")).unwrap();
        assert_eq!(argv[..2], ["rpm", "-qa"]);
        assert!(!argv.iter().any(|a| a == "--root"));

        let argv = PackageManager::Dpkg.query_argv(Path::new("/")).unwrap();
        assert!(!argv.iter().any(|a| a.starts_with("--admindir")));
        assert!(PackageManager::Unknown.query_argv(Path::new("/")).is_none());
    }

    #[test]
    fn test_query_follows_sysroot() {
        let sysroot = Path::new("/mnt/image");

        let argv = PackageManager::Rpm.query_argv(sysroot).unwrap();
        let root = argv.iter().position(|a| a == "--root").unwrap();
        assert_eq!(argv[root + 1], "/mnt/image");

        let argv = PackageManager::Dpkg.query_argv(sysroot).unwrap();
        assert_eq!(argv[0], "dpkg-query");
        assert!(argv.iter().any(|a| a == "--admindir=/mnt/image/var/lib/dpkg"));
    }

    #[test]
    fn test_preloaded_answers_are_memoized() {
        let names: HashSet<String> = ["systemd".to_string()].into_iter().collect();
        let db = PackageDb::preloaded(PackageManager::Rpm, names);
        assert!(db.is_installed("systemd"));
        assert!(db.is_installed("systemd"));
        assert!(!db.is_installed("nonexistent-pkg-xyz"));
        assert_eq!(db.answers.lock().unwrap().len(), 2);
    }
}
