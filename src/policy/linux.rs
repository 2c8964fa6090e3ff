use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info};
use sysinfo::{System, SystemExt};

use crate::constants::{CONTAINER_RUNTIMES, DEFAULT_SEARCH_PATH};
use crate::policy::packages::{PackageDb, PackageManager};
use crate::policy::release::{default_runlevel, Release};
use crate::policy::{under_sysroot, Family, HostPolicy};

/// Host policy backed by the running Linux system (or a tree mounted at
/// `sysroot`).
#[derive(Debug)]
pub struct LinuxPolicy {
    sysroot: PathBuf,
    release: Release,
    arch: String,
    hostname: String,
    kernel: Option<String>,
    runlevel: String,
    packages: PackageDb,
}

impl LinuxPolicy {
    /// Probe the host. Identity is fixed at construction; the package
    /// database is loaded on first use.
    pub fn detect(sysroot: &Path) -> Self {
        let release = Release::detect(sysroot);
        let system = System::new();
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        let policy = Self {
            sysroot: sysroot.to_path_buf(),
            arch: normalize_arch(env::consts::ARCH),
            hostname,
            kernel: system.kernel_version(),
            runlevel: default_runlevel(sysroot),
            packages: PackageDb::new(PackageManager::for_family(release.family), sysroot),
            release,
        };

        info!(
            "Host family {} version {} on {}",
            policy.release.family,
            policy.release.version.as_deref().unwrap_or("unknown"),
            policy.arch
        );
        policy
    }

    pub fn sysroot(&self) -> &Path {
        &self.sysroot
    }
}

/// Map Rust's architecture names onto the kernel's `uname -m` spelling.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le".to_string(),
        "powerpc64" => "ppc64".to_string(),
        "x86" => "i686".to_string(),
        "arm" => "armv7l".to_string(),
        other => other.to_string(),
    }
}

fn is_executable_file(path: &Path) -> bool {
    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Look `name` up the way a shell would: names containing a slash are used
/// as-is, bare names are searched in `search_path`.
pub fn find_executable(name: &str, search_path: &str, sysroot: &Path) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let candidate = under_sysroot(sysroot, name);
        return is_executable_file(&candidate).then_some(candidate);
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| under_sysroot(sysroot, dir).join(name))
        .find(|candidate| is_executable_file(candidate))
}

impl HostPolicy for LinuxPolicy {
    fn family(&self) -> Family {
        self.release.family
    }

    fn distribution_version(&self) -> Option<String> {
        self.release.version.clone()
    }

    fn architecture(&self) -> String {
        self.arch.clone()
    }

    fn package_installed(&self, name: &str) -> bool {
        self.packages.is_installed(name)
    }

    fn executable_available(&self, name: &str) -> bool {
        let search_path = env::var("PATH").unwrap_or_else(|_| DEFAULT_SEARCH_PATH.to_string());
        let found = find_executable(name, &search_path, &self.sysroot);
        debug!("Executable {} available: {}", name, found.is_some());
        found.is_some()
    }

    fn file_exists(&self, path: &str) -> bool {
        under_sysroot(&self.sysroot, path).exists()
    }

    fn in_container(&self) -> bool {
        if let Ok(runtime) = env::var("container") {
            if CONTAINER_RUNTIMES.contains(&runtime.as_str()) {
                return true;
            }
        }
        Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
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
