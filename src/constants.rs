//! Global constants for the diagnostic collector.
//!
//! This module centralizes hardcoded values so the engine, the CLI and the
//! tests agree on defaults.

// Buffer sizes
/// Default buffer size for file copies and hashing (1MB)
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Chunk size used when streaming the tarball through a compressor (512KB)
pub const COMPRESSION_CHUNK_SIZE: usize = 512 * 1024;

/// Read size for command output pipes (64KB)
pub const PIPE_CHUNK_SIZE: usize = 64 * 1024;

/// One mebibyte, the unit of every `*_mb` setting
pub const MIB: u64 = 1024 * 1024;

// Collection defaults
/// Default per-file size cap for copy specs, in MiB
pub const DEFAULT_LOG_SIZE_MB: u64 = 25;

/// Minimum cap applied to journal exports unless all logs are requested, in MiB
pub const JOURNAL_MIN_SIZE_MB: u64 = 100;

/// Default per-command timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Interval between SIGTERM and SIGKILL for a subprocess being torn down
pub const TERMINATE_GRACE_SECS: u64 = 2;

/// A second interrupt inside this window forces teardown without finalization
pub const SECOND_SIGNAL_WINDOW_SECS: u64 = 2;

/// Task queue capacity is this factor times the worker count
pub const QUEUE_DEPTH_FACTOR: usize = 4;

/// Lower bound on the worker pool size
pub const MIN_WORKERS: usize = 2;

/// Default number of refine waves after the first collection wave
pub const DEFAULT_REFINE_ROUNDS: usize = 2;

/// Longest file name produced by command mangling
pub const MANGLED_NAME_MAX: usize = 64;

// Archive layout
pub const LOGS_DIR: &str = "sos_logs";
pub const REPORTS_DIR: &str = "sos_reports";
pub const COMMANDS_DIR: &str = "sos_commands";
pub const STRINGS_DIR: &str = "sos_strings";

pub const MANIFEST_FILE: &str = "sos_reports/manifest.json";
pub const INDEX_TEXT_FILE: &str = "sos_reports/index.txt";
pub const INDEX_HTML_FILE: &str = "sos_reports/index.html";
pub const RUN_LOG_FILE: &str = "sos_logs/sos.log";
pub const VERSION_FILE: &str = "version.txt";

/// Written in place of content whose redaction failed
pub const REDACTION_FAILURE_MARKER: &[u8] = b"[content withheld: redaction failed]\n";

// Command environment
/// Search path used when the process has no PATH of its own
pub const DEFAULT_SEARCH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Values of the `container` environment variable that mark a container runtime
pub const CONTAINER_RUNTIMES: &[&str] = &["docker", "oci", "podman"];

/// Runlevel assumed when neither systemd nor inittab says otherwise
pub const DEFAULT_RUNLEVEL: &str = "3";

/// Tool name recorded in the manifest and version file
pub const TOOL_NAME: &str = "diag-collector";
