//! File name sanitizing and archive destination checks.

use std::path::Path;

use anyhow::{bail, Result};

/// Directories an archive must never be written into.
const PSEUDO_FILESYSTEMS: &[&str] = &["/proc", "/sys", "/dev"];

/// Sanitize a collector-suggested file name.
///
/// Path separators and characters that are awkward in file names become
/// `_`, NUL bytes are dropped, and names made only of dots are prefixed so
/// they can never mean "here" or "parent".
///
/// # Arguments
///
/// * `filename` - The name to sanitize
///
/// # Returns
///
/// A single path component safe to create inside the staging tree
pub fn sanitize_filename(filename: &str) -> String {
    let mut sanitized = String::with_capacity(filename.len());

    for ch in filename.chars() {
        match ch {
            '/' | '\\' => sanitized.push('_'),
            '\0' => continue,
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => sanitized.push('_'),
            c if c.is_control() => sanitized.push('_'),
            c => sanitized.push(c),
        }
    }

    if sanitized.chars().all(|c| c == '.') {
        sanitized = format!("_{}", sanitized);
    }

    let trimmed = sanitized.trim_matches(|c| c == ' ').to_string();
    if trimmed.is_empty() || trimmed == "_" {
        return "unnamed".to_string();
    }
    trimmed
}

/// Check that `path` is a sensible place for the final archive.
///
/// Pseudo filesystems are refused, as is an existing directory (the caller
/// passes the archive file path, not its parent).
pub fn validate_output_path(path: &Path) -> Result<()> {
    let display = path.to_string_lossy();
    for pseudo in PSEUDO_FILESYSTEMS {
        if path.starts_with(pseudo) {
            bail!("Cannot write the archive into {}: {}", pseudo, display);
        }
    }

    if path.as_os_str().is_empty() || path.file_name().is_none() {
        bail!("Archive path has no file name: {}", display);
    }

    if path.is_dir() {
        bail!("Archive path is an existing directory: {}", display);
    }

    if let Some(parent) = path.parent() {
        if parent.exists() && !parent.is_dir() {
            bail!("Archive parent is not a directory: {}", parent.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("installed-rpms"), "installed-rpms");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("file<>:\"|?*.txt"), "file_______.txt");
        assert_eq!(sanitize_filename("file\0name"), "filename");
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename(".."), "_..");
        assert_eq!(sanitize_filename("  spaces  "), "spaces");
        assert!(!sanitize_filename("a/b\\c").contains('/'));
    }

    #[test]
    fn test_validate_output_path() {
        assert!(validate_output_path(Path::new("/proc/self/out.tar")).is_err());
        assert!(validate_output_path(Path::new("/sys/kernel/out.tar")).is_err());
        assert!(validate_output_path(Path::new("/var/tmp/out.tar.xz")).is_ok());

        let dir = TempDir::new().unwrap();
        assert!(validate_output_path(dir.path()).is_err());
        assert!(validate_output_path(&dir.path().join("host.tar")).is_ok());

        let file = dir.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_output_path(&file.join("host.tar")).is_err());
    }
}
