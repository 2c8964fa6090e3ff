//! Release-file parsing: distribution identity and default runlevel.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::constants::DEFAULT_RUNLEVEL;
use crate::policy::{under_sysroot, Family};

lazy_static! {
    static ref INITDEFAULT: Regex = Regex::new(r"(?m)^id:(\d):initdefault:").unwrap();
    static ref SYSTEMD_TARGET_RUNLEVEL: Regex = Regex::new(r"^runlevel(\d)\.target$").unwrap();
}

/// Legacy release files, checked when os-release is absent or unhelpful
const LEGACY_RELEASE_FILES: &[(&str, Family)] = &[
    ("/etc/redhat-release", Family::RedHat),
    ("/etc/SuSE-release", Family::Suse),
    ("/etc/debian_version", Family::Debian),
];

/// Parse the `KEY=value` lines of an os-release file.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

/// Identity of the distribution found under a sysroot.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub family: Family,
    pub version: Option<String>,
}

impl Release {
    /// Detect the distribution. Fails closed to `Independent`.
    pub fn detect(sysroot: &Path) -> Self {
        for candidate in ["/etc/os-release", "/usr/lib/os-release"] {
            if let Ok(content) = fs::read_to_string(under_sysroot(sysroot, candidate)) {
                let fields = parse_os_release(&content);
                if let Some(release) = Self::from_fields(&fields) {
                    debug!("Detected {} {:?} from {}", release.family, release.version, candidate);
                    return release;
                }
            }
        }

        for (path, family) in LEGACY_RELEASE_FILES {
            if under_sysroot(sysroot, path).is_file() {
                debug!("Detected {} from {}", family, path);
                return Release { family: *family, version: None };
            }
        }

        Release { family: Family::Independent, version: None }
    }

    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let version = fields.get("VERSION_ID").cloned();
        let from_id = fields.get("ID").and_then(|id| Family::from_os_id(id));
        let from_like = || {
            fields
                .get("ID_LIKE")
                .and_then(|like| like.split_whitespace().find_map(Family::from_os_id))
        };
        from_id
            .or_else(from_like)
            .map(|family| Release { family, version })
    }
}

/// Default runlevel: the systemd default target if it names a runlevel,
/// else the inittab `initdefault` entry, else `3`.
pub fn default_runlevel(sysroot: &Path) -> String {
    let target = under_sysroot(sysroot, "/etc/systemd/system/default.target");
    if let Ok(link) = fs::read_link(&target) {
        let name = link
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(caps) = SYSTEMD_TARGET_RUNLEVEL.captures(&name) {
            return caps[1].to_string();
        }
        match name.as_str() {
            "graphical.target" => return "5".to_string(),
            "multi-user.target" => return "3".to_string(),
            "rescue.target" => return "1".to_string(),
            _ => {}
        }
    }

    if let Ok(inittab) = fs::read_to_string(under_sysroot(sysroot, "/etc/inittab")) {
        if let Some(caps) = INITDEFAULT.captures(&inittab) {
            return caps[1].to_string();
        }
    }

    DEFAULT_RUNLEVEL.to_string()
}
