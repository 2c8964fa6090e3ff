//! Host capability surface.
//!
//! Collectors and the registry never probe the host directly; they ask a
//! [`HostPolicy`]. The production implementation is [`LinuxPolicy`], which
//! reads release files and the native package database under the configured
//! sysroot. [`StaticPolicy`] answers from fixed data and is what tests and
//! dry runs against foreign trees use.

pub mod linux;
pub mod packages;
pub mod release;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};

pub use linux::LinuxPolicy;

/// Distribution family used for platform gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Independent,
    RedHat,
    Debian,
    Ubuntu,
    Suse,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Independent => "independent",
            Family::RedHat => "redhat",
            Family::Debian => "debian",
            Family::Ubuntu => "ubuntu",
            Family::Suse => "suse",
        }
    }

    /// Families whose package database is rpm
    pub fn uses_rpm(&self) -> bool {
        matches!(self, Family::RedHat | Family::Suse)
    }

    /// Families whose package database is dpkg
    pub fn uses_dpkg(&self) -> bool {
        matches!(self, Family::Debian | Family::Ubuntu)
    }

    /// Map an os-release `ID` or `ID_LIKE` token to a family.
    pub fn from_os_id(id: &str) -> Option<Family> {
        let id = id.trim().trim_matches('"').to_ascii_lowercase();
        match id.as_str() {
            "rhel" | "redhat" | "centos" | "fedora" | "rocky" | "almalinux" | "ol" => Some(Family::RedHat),
            "debian" | "raspbian" => Some(Family::Debian),
            "ubuntu" => Some(Family::Ubuntu),
            "suse" | "sles" | "sled" => Some(Family::Suse),
            other if other.starts_with("opensuse") => Some(Family::Suse),
            _ => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability questions the engine and collectors may ask about the host.
///
/// Every method is free of side effects visible to the caller, idempotent,
/// and callable from any thread.
#[cfg_attr(test, mockall::automock)]
pub trait HostPolicy: Send + Sync {
    fn family(&self) -> Family;
    fn distribution_version(&self) -> Option<String>;
    fn architecture(&self) -> String;
    /// True iff the native package database reports `name` as installed.
    fn package_installed(&self, name: &str) -> bool;
    /// True iff `name` resolves to an executable regular file.
    fn executable_available(&self, name: &str) -> bool;
    /// True iff `path` exists on the host, resolved under the sysroot.
    fn file_exists(&self, path: &str) -> bool;
    fn in_container(&self) -> bool;
    fn default_runlevel(&self) -> String;
    fn hostname(&self) -> String;
    fn kernel_version(&self) -> Option<String>;
}

/// Resolve a host-absolute path under `sysroot`.
pub fn under_sysroot(sysroot: &Path, path: &str) -> PathBuf {
    sysroot.join(path.trim_start_matches('/'))
}

/// A policy with fixed answers.
#[derive(Debug, Clone)]
pub struct StaticPolicy {
    pub family: Family,
    pub version: Option<String>,
    pub arch: String,
    pub hostname: String,
    pub kernel: Option<String>,
    pub packages: BTreeSet<String>,
    pub executables: BTreeSet<String>,
    pub sysroot: Option<PathBuf>,
    pub container: bool,
    pub runlevel: String,
}

impl StaticPolicy {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            version: None,
            arch: std::env::consts::ARCH.to_string(),
            hostname: "localhost".to_string(),
            kernel: None,
            packages: BTreeSet::new(),
            executables: BTreeSet::new(),
            sysroot: None,
            container: false,
            runlevel: crate::constants::DEFAULT_RUNLEVEL.to_string(),
        }
    }

    pub fn with_package(mut self, name: &str) -> Self {
        self.packages.insert(name.to_string());
        self
    }

    pub fn with_executable(mut self, name: &str) -> Self {
        self.executables.insert(name.to_string());
        self
    }

    /// Answer `file_exists` from a real directory tree
    pub fn with_sysroot(mut self, sysroot: &Path) -> Self {
        self.sysroot = Some(sysroot.to_path_buf());
        self
    }
}

impl HostPolicy for StaticPolicy {
    fn family(&self) -> Family {
        self.family
    }

    fn distribution_version(&self) -> Option<String> {
        self.version.clone()
    }

    fn architecture(&self) -> String {
        self.arch.clone()
    }

    fn package_installed(&self, name: &str) -> bool {
        self.packages.contains(name)
    }

    fn executable_available(&self, name: &str) -> bool {
        self.executables.contains(name)
    }

    fn file_exists(&self, path: &str) -> bool {
        match &self.sysroot {
            Some(root) => under_sysroot(root, path).exists(),
            None => false,
        }
    }

    fn in_container(&self) -> bool {
        self.container
    }

    fn default_runlevel(&self) -> String {
        self.runlevel.clone()
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn kernel_version(&self) -> Option<String> {
        self.kernel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_family_from_os_id() {
        assert_eq!(Family::from_os_id("rhel"), Some(Family::RedHat));
        assert_eq!(Family::from_os_id("\"centos\""), Some(Family::RedHat));
        assert_eq!(Family::from_os_id("debian"), Some(Family::Debian));
        assert_eq!(Family::from_os_id("ubuntu"), Some(Family::Ubuntu));
        assert_eq!(Family::from_os_id("opensuse-leap"), Some(Family::Suse));
        assert_eq!(Family::from_os_id("arch"), None);
    }

    #[test]
    fn test_package_db_kind() {
        assert!(Family::RedHat.uses_rpm());
        assert!(Family::Suse.uses_rpm());
        assert!(Family::Ubuntu.uses_dpkg());
        assert!(!Family::Independent.uses_rpm());
        assert!(!Family::Independent.uses_dpkg());
    }

    #[test]
    fn test_static_policy_answers() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("etc")).unwrap();
        std::fs::write(temp_dir.path().join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();

        let policy = StaticPolicy::new(Family::Debian)
            .with_package("openssh-server")
            .with_executable("ip")
            .with_sysroot(temp_dir.path());

        assert_eq!(policy.family(), Family::Debian);
        assert!(policy.package_installed("openssh-server"));
        assert!(!policy.package_installed("nonexistent-pkg-xyz"));
        assert!(policy.executable_available("ip"));
        assert!(policy.file_exists("/etc/hosts"));
        assert!(!policy.file_exists("/etc/shadow"));
    }
}
