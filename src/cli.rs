use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Compression, RunConfig};

/// Command-line arguments for the diag-collector tool.
///
/// Every collection flag overlays the matching field of the YAML
/// configuration when given; unset flags leave the file (or default) value
/// alone.
#[derive(Parser, Debug)]
#[clap(name = "diag-collector", about = "Diagnostic data collector for UNIX-like hosts")]
pub struct Args {
    /// Path to configuration YAML file
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Destination archive path (default: <tmp-dir>/<name>.<ext>)
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Archive base name (default: <hostname>-<timestamp>)
    #[clap(long)]
    pub name: Option<String>,

    /// Archive compression
    #[clap(short = 'z', long, value_enum)]
    pub compression: Option<Compression>,

    /// Per-file size cap for copied files, in MiB (0 disables the cap)
    #[clap(long)]
    pub log_size: Option<u64>,

    /// Collect log files without size caps
    #[clap(long)]
    pub all_logs: bool,

    /// Only run collectors in these profiles (comma-separated)
    #[clap(short, long, value_delimiter = ',')]
    pub profiles: Vec<String>,

    /// Enable these collectors even if they would not run (comma-separated)
    #[clap(short, long, value_delimiter = ',')]
    pub enable: Vec<String>,

    /// Never run these collectors (comma-separated)
    #[clap(short = 'n', long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Collector option, `collector.option=value` (repeatable)
    #[clap(short = 'k', long = "option")]
    pub options: Vec<String>,

    /// Ignore options for unknown collectors or options
    #[clap(long)]
    pub ignore_unknown_options: bool,

    /// Number of concurrent workers
    #[clap(short = 'j', long)]
    pub workers: Option<usize>,

    /// Default per-command timeout in seconds
    #[clap(long)]
    pub timeout: Option<u64>,

    /// Abort the whole run after this many seconds
    #[clap(long)]
    pub deadline: Option<u64>,

    /// Directory the private staging tree is created in
    #[clap(long)]
    pub tmp_dir: Option<PathBuf>,

    /// Keep the staging tree when a run fails
    #[clap(long)]
    pub preserve_staging: bool,

    /// Host root to collect from (for mounted images)
    #[clap(long)]
    pub sysroot: Option<PathBuf>,

    /// Never prompt
    #[clap(long)]
    pub batch: bool,

    /// Only print warnings and errors
    #[clap(short, long)]
    pub quiet: bool,

    /// Verbose logging
    #[clap(short, long)]
    pub verbose: bool,

    /// Continue even without root privileges
    #[clap(long)]
    pub force: bool,

    /// List every collector with its activation status and exit
    #[clap(long)]
    pub list_collectors: bool,

    /// List profiles and their collectors and exit
    #[clap(long)]
    pub list_profiles: bool,

    /// Subcommands
    #[clap(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a default configuration file
    InitConfig {
        /// Path to output configuration file
        #[clap(default_value = "config.yaml")]
        path: PathBuf,
    },
}

impl Args {
    /// Overlay the flags that were given onto `config`.
    pub fn apply_to(&self, config: &mut RunConfig) -> Result<()> {
        if let Some(output) = &self.output {
            config.output_path = Some(output.clone());
        }
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(compression) = self.compression {
            config.compression = compression;
        }
        if let Some(size) = self.log_size {
            config.log_size_mb = size;
        }
        if let Some(workers) = self.workers {
            if workers == 0 {
                bail!("--workers must be at least 1");
            }
            config.workers = Some(workers);
        }
        if let Some(timeout) = self.timeout {
            config.command_timeout_s = timeout;
        }
        if let Some(deadline) = self.deadline {
            config.deadline_s = Some(deadline);
        }
        if let Some(dir) = &self.tmp_dir {
            config.staging_base = dir.clone();
        }
        if let Some(root) = &self.sysroot {
            config.sysroot = root.clone();
        }

        config.all_logs |= self.all_logs;
        config.ignore_unknown_options |= self.ignore_unknown_options;
        config.preserve_staging_on_failure |= self.preserve_staging;
        config.batch |= self.batch;
        config.quiet |= self.quiet;
        config.verbose |= self.verbose;
        if self.force {
            config.require_root = false;
        }

        config.profiles.extend(self.profiles.iter().cloned());
        config.enable_collectors.extend(self.enable.iter().cloned());
        config.disable_collectors.extend(self.skip.iter().cloned());

        for option in &self.options {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (option.trim(), "on"),
            };
            if !key.contains('.') {
                bail!("Collector option '{}' must be written collector.option=value", option);
            }
            config.collector_options.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }
}
