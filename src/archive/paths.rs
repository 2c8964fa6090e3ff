//! Archive path arithmetic: normalization, command-name mangling, collision
//! suffixes and relative symlink targets.
//!
//! Archive paths are `/`-separated, relative to the staging root, and never
//! contain `.` or `..` components once normalized.

use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::constants::MANGLED_NAME_MAX;

lazy_static! {
    static ref BIN_PREFIX: Regex = Regex::new(r"^/(usr/)?s?bin/").unwrap();
    static ref UNSAFE_RUN: Regex = Regex::new(r"[^A-Za-z0-9._/-]+").unwrap();
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("archive path is empty")]
    Empty,
    #[error("archive path contains a NUL byte")]
    NulByte,
    #[error("archive path escapes the staging root: {0}")]
    Traversal(String),
}

/// Normalize a path for use inside the archive.
///
/// Leading slashes are dropped, `.` components vanish and `..` collapses
/// against its parent. A `..` with nothing left to collapse is rejected.
pub fn normalize(path: &str) -> Result<String, PathError> {
    if path.contains('\0') {
        return Err(PathError::NulByte);
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathError::Traversal(path.to_string()));
                }
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Archive path of a host file, given the sysroot it was found under.
pub fn host_to_archive(host_path: &Path, sysroot: &Path) -> Result<String, PathError> {
    let relative = host_path.strip_prefix(sysroot).unwrap_or(host_path);
    normalize(&relative.to_string_lossy())
}

/// Apply a `(old, new)` prefix rename to an archive path.
pub fn apply_rename(archive_path: &str, rename: &(String, String)) -> String {
    let old = rename.0.trim_start_matches('/');
    let new = rename.1.trim_start_matches('/');
    if old.is_empty() {
        return archive_path.to_string();
    }
    match archive_path.strip_prefix(old) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || old.ends_with('/') => {
            format!("{}{}", new, rest)
        }
        _ => archive_path.to_string(),
    }
}

/// Turn a command line into a bounded, filesystem-safe file name.
///
/// `/usr/bin/`, `/usr/sbin/`, `/bin/` and `/sbin/` prefixes are stripped,
/// every run of characters outside `[A-Za-z0-9._/-]` becomes `_`, `/`
/// becomes `.`, the result is cut to 64 characters and stray `._-` are
/// trimmed from both ends.
pub fn mangle_command(command_line: &str) -> String {
    let stripped = BIN_PREFIX.replace(command_line.trim(), "");
    let safe = UNSAFE_RUN.replace_all(&stripped, "_");
    let dotted = safe.replace('/', ".");
    let bounded: String = dotted.chars().take(MANGLED_NAME_MAX).collect();
    let trimmed = bounded.trim_matches(|c| c == '.' || c == '_' || c == '-');
    if trimmed.is_empty() {
        "command".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The `n`th collision candidate for `archive_path` (`n >= 2`).
pub fn collision_candidate(archive_path: &str, n: usize) -> String {
    format!("{}_{}", archive_path, n)
}

/// Parent directory of an archive path, `""` for top-level entries.
pub fn parent(archive_path: &str) -> &str {
    archive_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Resolve the raw target of a symlink stored at `link_archive_path` to an
/// archive path. Absolute targets are taken relative to the archive root.
pub fn resolve_link_target(link_archive_path: &str, raw_target: &str) -> Result<String, PathError> {
    if raw_target.starts_with('/') {
        normalize(raw_target)
    } else {
        let dir = parent(link_archive_path);
        if dir.is_empty() {
            normalize(raw_target)
        } else {
            normalize(&format!("{}/{}", dir, raw_target))
        }
    }
}

/// Relative link text that leads from the directory holding
/// `link_archive_path` to `target_archive_path`.
pub fn relative_link_target(link_archive_path: &str, target_archive_path: &str) -> String {
    let from: Vec<&str> = parent(link_archive_path)
        .split('/')
        .filter(|p| !p.is_empty())
        .collect();
    let to: Vec<&str> = target_archive_path.split('/').filter(|p| !p.is_empty()).collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::with_capacity(from.len() - common + to.len() - common);
    parts.extend(std::iter::repeat("..").take(from.len() - common));
    parts.extend(&to[common..]);

    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// True if `link_text`, read relative to the directory of `link_archive_path`,
/// stays inside the archive root.
pub fn link_stays_inside(link_archive_path: &str, link_text: &str) -> bool {
    !link_text.starts_with('/') && resolve_link_target(link_archive_path, link_text).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/etc/hosts").unwrap(), "etc/hosts");
        assert_eq!(normalize("etc/./ssh//sshd_config").unwrap(), "etc/ssh/sshd_config");
        assert_eq!(normalize("etc/ssh/../hosts").unwrap(), "etc/hosts");
        assert_eq!(normalize("///var/log/"), Ok("var/log".to_string()));
    }

    #[test]
    fn test_normalize_rejects() {
        assert!(matches!(normalize("../etc/passwd"), Err(PathError::Traversal(_))));
        assert!(matches!(normalize("etc/../../x"), Err(PathError::Traversal(_))));
        assert_eq!(normalize("/"), Err(PathError::Empty));
        assert_eq!(normalize("a\0b"), Err(PathError::NulByte));
    }

    #[test]
    fn test_host_to_archive() {
        let sysroot = Path::new("/mnt/image");
        assert_eq!(
            host_to_archive(Path::new("/mnt/image/etc/hosts"), sysroot).unwrap(),
            "etc/hosts"
        );
        assert_eq!(
            host_to_archive(Path::new("/etc/hosts"), Path::new("/")).unwrap(),
            "etc/hosts"
        );
    }

    #[test]
    fn test_apply_rename() {
        let rename = ("/etc/app".to_string(), "/etc/app-renamed".to_string());
        assert_eq!(apply_rename("etc/app/conf", &rename), "etc/app-renamed/conf");
        assert_eq!(apply_rename("etc/app", &rename), "etc/app-renamed");
        assert_eq!(apply_rename("etc/application", &rename), "etc/application");
    }

    #[test]
    fn test_mangle_command() {
        assert_eq!(mangle_command("/usr/bin/ip -d address"), "ip_-d_address");
        assert_eq!(mangle_command("/sbin/lsmod"), "lsmod");
        assert_eq!(mangle_command("ls -lanR /etc/ssh"), "ls_-lanR_.etc.ssh");
        assert_eq!(mangle_command("journalctl --since '-1days'"), "journalctl_--since_-1days");
        assert_eq!(mangle_command("!!!"), "command");
    }

    #[test]
    fn test_mangle_long_command_is_bounded() {
        let long = format!("cat {}", "/very/deep/path".repeat(20));
        let mangled = mangle_command(&long);
        assert!(mangled.len() <= MANGLED_NAME_MAX);
        assert!(mangled.starts_with("cat_.very.deep"));
    }

    #[test]
    fn test_relative_link_target() {
        assert_eq!(relative_link_target("etc/localtime", "usr/share/zoneinfo/UTC"), "../usr/share/zoneinfo/UTC");
        assert_eq!(relative_link_target("etc/alt/java", "etc/alt/java-17"), "java-17");
        assert_eq!(relative_link_target("lsmod", "sos_commands/kernel/lsmod"), "sos_commands/kernel/lsmod");
    }

    #[test]
    fn test_resolve_link_target() {
        assert_eq!(resolve_link_target("etc/localtime", "/usr/share/zoneinfo/UTC").unwrap(), "usr/share/zoneinfo/UTC");
        assert_eq!(resolve_link_target("etc/alt/java", "../../opt/java").unwrap(), "opt/java");
        assert!(resolve_link_target("etc/alt", "../../../escape").is_err());
    }

    #[test]
    fn test_link_stays_inside() {
        assert!(link_stays_inside("etc/a", "b"));
        assert!(link_stays_inside("etc/a", "../usr/b"));
        assert!(!link_stays_inside("etc/a", "../../b"));
        assert!(!link_stays_inside("etc/a", "/usr/b"));
    }

    proptest! {
        #[test]
        fn prop_normalized_paths_never_escape(path in "[a-z./]{0,40}") {
            if let Ok(normalized) = normalize(&path) {
                prop_assert!(!normalized.starts_with('/'));
                prop_assert!(!normalized.split('/').any(|c| c == ".." || c == "." || c.is_empty()));
            }
        }

        #[test]
        fn prop_mangled_names_are_bounded_and_safe(line in ".{0,200}") {
            let mangled = mangle_command(&line);
            prop_assert!(!mangled.is_empty());
            prop_assert!(mangled.chars().count() <= MANGLED_NAME_MAX);
            prop_assert!(mangled.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)));
            prop_assert!(!mangled.starts_with(['.', '_', '-']));
        }

        #[test]
        fn prop_relative_link_resolves_back(
            link in "[a-c]{1,3}(/[a-c]{1,3}){0,3}",
            target in "[a-c]{1,3}(/[a-c]{1,3}){0,3}",
        ) {
            let text = relative_link_target(&link, &target);
            if text != "." {
                prop_assert_eq!(resolve_link_target(&link, &text).unwrap(), target);
            }
        }
    }
}
