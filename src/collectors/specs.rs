//! Declarative specs a collector emits during setup.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use glob::Pattern;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde::{Serialize, Deserialize};

use crate::archive::paths::{self, mangle_command};
use crate::models::{CapturedItem, ItemKind};
use crate::security::sanitize_filename;

/// Files to copy from the host. The pattern is a glob resolved against the
/// host root when collection starts.
#[derive(Debug, Clone, PartialEq)]
pub struct CopySpec {
    pub pattern: String,
    pub size_limit: Option<u64>,
    pub rename: Option<(String, String)>,
    /// Log-labeled specs lose their size cap when all logs are requested
    pub log: bool,
}

impl CopySpec {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            size_limit: None,
            rename: None,
            log: false,
        }
    }

    pub fn size_limit(mut self, bytes: u64) -> Self {
        self.size_limit = Some(bytes);
        self
    }

    pub fn rename(mut self, old: &str, new: &str) -> Self {
        self.rename = Some((old.to_string(), new.to_string()));
        self
    }

    pub fn log(mut self) -> Self {
        self.log = true;
        self
    }
}

/// Where a command's standard error goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Interleaved into the primary output file
    #[default]
    Fold,
    /// Written to `<output>.stderr`
    Sibling,
    Discard,
}

/// A command whose output becomes one archive file.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub suggested_filename: Option<String>,
    pub root_symlink: Option<String>,
    /// `None` means the run's default timeout
    pub timeout_s: Option<u64>,
    /// `None` values remove the variable from the child environment
    pub env: BTreeMap<String, Option<String>>,
    pub working_dir: Option<PathBuf>,
    /// Enter the sysroot before exec when it is not `/`
    pub chroot: bool,
    pub stderr: StderrMode,
    pub size_limit: Option<u64>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            suggested_filename: None,
            root_symlink: None,
            timeout_s: None,
            env: BTreeMap::new(),
            working_dir: None,
            chroot: false,
            stderr: StderrMode::Fold,
            size_limit: None,
        }
    }

    pub fn suggest_filename(mut self, name: &str) -> Self {
        self.suggested_filename = Some(name.to_string());
        self
    }

    pub fn root_symlink(mut self, name: &str) -> Self {
        self.root_symlink = Some(name.to_string());
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_s = Some(secs);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        let value = if value.is_empty() { None } else { Some(value.to_string()) };
        self.env.insert(key.to_string(), value);
        self
    }

    pub fn unset_env(mut self, key: &str) -> Self {
        self.env.insert(key.to_string(), None);
        self
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn chroot(mut self, enter: bool) -> Self {
        self.chroot = enter;
        self
    }

    pub fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    pub fn size_limit(mut self, bytes: u64) -> Self {
        self.size_limit = Some(bytes);
        self
    }

    /// The command line as one string, quoting arguments that need it.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    format!("'{}'", arg.replace('\'', "'\\''"))
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Basename of `argv[0]`
    pub fn program_name(&self) -> &str {
        self.argv
            .first()
            .map(|p| p.rsplit('/').next().unwrap_or(p.as_str()))
            .unwrap_or("")
    }

    /// File name of the primary output inside `sos_commands/<collector>/`.
    pub fn output_name(&self) -> String {
        match &self.suggested_filename {
            Some(name) => sanitize_filename(name),
            None => mangle_command(&self.command_line()),
        }
    }
}

/// Synthetic file content.
#[derive(Debug, Clone, PartialEq)]
pub struct StringSpec {
    pub content: String,
    pub archive_path: String,
}

/// A journal excerpt request, lowered to a `journalctl` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalQuery {
    pub units: Vec<String>,
    pub identifier: Option<String>,
    pub since: Option<String>,
    pub lines: Option<u64>,
}

impl JournalQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.units.push(unit.to_string());
        self
    }

    pub fn identifier(mut self, identifier: &str) -> Self {
        self.identifier = Some(identifier.to_string());
        self
    }

    pub fn since(mut self, since: &str) -> Self {
        self.since = Some(since.to_string());
        self
    }

    pub fn lines(mut self, lines: u64) -> Self {
        self.lines = Some(lines);
        self
    }

    /// Lower to a single command spec.
    pub fn to_command(&self, size_limit: Option<u64>) -> CommandSpec {
        let mut argv: Vec<String> = vec!["journalctl".into(), "--no-pager".into()];
        for unit in &self.units {
            argv.push("--unit".into());
            argv.push(unit.clone());
        }
        if let Some(identifier) = &self.identifier {
            argv.push("--identifier".into());
            argv.push(identifier.clone());
        }
        if let Some(since) = &self.since {
            argv.push("--since".into());
            argv.push(since.clone());
        }
        if let Some(lines) = self.lines {
            argv.push("--lines".into());
            argv.push(lines.to_string());
        }

        let mut spec = CommandSpec::new(argv);
        spec.size_limit = size_limit;
        spec
    }
}

/// Which captured content a substitution applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Scope {
    /// One archive path, exactly
    Path(String),
    /// Glob over archive paths
    ArchivePath(String),
    /// Outputs of commands whose program basename (or output name) matches
    CommandName(String),
    /// Regex over archive paths
    PathRegex(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Path(p) => write!(f, "path:{}", p),
            Scope::ArchivePath(g) => write!(f, "glob:{}", g),
            Scope::CommandName(c) => write!(f, "command:{}", c),
            Scope::PathRegex(r) => write!(f, "regex:{}", r),
        }
    }
}

#[derive(Debug, Clone)]
enum ScopeMatcher {
    Exact(String),
    Glob(Pattern),
    Command(String),
    Regex(Regex),
}

/// A compiled substitution rule.
#[derive(Debug, Clone)]
pub struct SubstitutionRule {
    pub scope: Scope,
    matcher: ScopeMatcher,
    pub pattern: BytesRegex,
    pub replacement: String,
}

impl SubstitutionRule {
    /// Compile a rule. Errors describe which part failed to compile.
    pub fn compile(scope: Scope, pattern: &str, replacement: &str) -> Result<Self, String> {
        let matcher = match &scope {
            Scope::Path(p) => ScopeMatcher::Exact(
                paths::normalize(p).map_err(|e| format!("scope {}: {}", scope, e))?,
            ),
            Scope::ArchivePath(g) => ScopeMatcher::Glob(
                Pattern::new(g.trim_start_matches('/'))
                    .map_err(|e| format!("scope {}: {}", scope, e))?,
            ),
            Scope::CommandName(c) => ScopeMatcher::Command(c.clone()),
            Scope::PathRegex(r) => ScopeMatcher::Regex(
                Regex::new(r).map_err(|e| format!("scope {}: {}", scope, e))?,
            ),
        };
        let pattern = BytesRegex::new(pattern)
            .map_err(|e| format!("pattern '{}': {}", pattern, e))?;

        Ok(Self {
            scope,
            matcher,
            pattern,
            replacement: replacement.to_string(),
        })
    }

    /// Whether this rule applies to a captured item.
    pub fn applies_to(&self, item: &CapturedItem) -> bool {
        if !item.kind.has_content() {
            return false;
        }
        let archive_path = match &item.archive_path {
            Some(path) => path.as_str(),
            None => return false,
        };

        match &self.matcher {
            ScopeMatcher::Exact(p) => archive_path == p,
            ScopeMatcher::Glob(g) => g.matches(archive_path),
            ScopeMatcher::Regex(r) => r.is_match(archive_path),
            ScopeMatcher::Command(name) => {
                if item.kind != ItemKind::CommandOutput {
                    return false;
                }
                let program = item
                    .source_ref
                    .split_whitespace()
                    .next()
                    .map(|p| p.rsplit('/').next().unwrap_or(p))
                    .unwrap_or("");
                let file_name = archive_path.rsplit('/').next().unwrap_or(archive_path);
                program == name || file_name.starts_with(name.as_str())
            }
        }
    }
}

/// Everything one setup (or refine) call declared.
#[derive(Debug, Clone, Default)]
pub struct SpecSet {
    pub copy_specs: Vec<CopySpec>,
    pub forbidden_paths: Vec<String>,
    pub command_specs: Vec<CommandSpec>,
    pub string_specs: Vec<StringSpec>,
    pub postproc_rules: Vec<SubstitutionRule>,
    pub alerts: Vec<String>,
    pub custom_text: Vec<String>,
}

impl SpecSet {
    /// True if the set holds anything the scheduler would execute.
    pub fn has_work(&self) -> bool {
        !self.copy_specs.is_empty() || !self.command_specs.is_empty() || !self.string_specs.is_empty()
    }

    pub fn absorb(&mut self, other: SpecSet) {
        self.copy_specs.extend(other.copy_specs);
        self.forbidden_paths.extend(other.forbidden_paths);
        self.command_specs.extend(other.command_specs);
        self.string_specs.extend(other.string_specs);
        self.postproc_rules.extend(other.postproc_rules);
        self.alerts.extend(other.alerts);
        self.custom_text.extend(other.custom_text);
    }
}
