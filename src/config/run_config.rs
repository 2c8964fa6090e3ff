use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use log::{debug, info};
use serde::{Serialize, Deserialize};

use crate::constants::{
    DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_LOG_SIZE_MB, DEFAULT_REFINE_ROUNDS, MIB, MIN_WORKERS,
};

/// Archive compression requested for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Auto,
    None,
    Gzip,
    Xz,
    Zstd,
}

/// Preference order used for `auto` and for falling back from a codec that
/// was not compiled in.
const CODEC_PREFERENCE: [Compression; 4] = [
    Compression::Xz,
    Compression::Zstd,
    Compression::Gzip,
    Compression::None,
];

impl Compression {
    /// Whether this build can produce the codec.
    pub fn is_available(&self) -> bool {
        match self {
            Compression::Auto | Compression::None => true,
            Compression::Gzip => cfg!(feature = "gzip"),
            Compression::Xz => cfg!(feature = "xz"),
            Compression::Zstd => cfg!(feature = "zstd"),
        }
    }

    /// Resolve the request to a concrete codec, falling back to the next
    /// best available one.
    pub fn resolve(&self) -> Compression {
        let start = match self {
            Compression::Auto => 0,
            other => CODEC_PREFERENCE
                .iter()
                .position(|c| c == other)
                .unwrap_or(0),
        };
        CODEC_PREFERENCE[start..]
            .iter()
            .copied()
            .find(|c| c.is_available())
            .unwrap_or(Compression::None)
    }

    /// File name suffix of the finished archive
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Auto | Compression::None => "tar",
            Compression::Gzip => "tar.gz",
            Compression::Xz => "tar.xz",
            Compression::Zstd => "tar.zst",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Auto => "auto",
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }
}

/// Everything a run is parameterized by. Loaded from YAML, then overlaid by
/// command-line flags.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Destination archive path; derived from the archive name when unset
    pub output_path: Option<PathBuf>,
    /// Archive base name; `<hostname>-<timestamp>` when unset
    pub name: Option<String>,
    pub compression: Compression,
    /// Default per-file cap for copy specs, in MiB; 0 disables the cap
    pub log_size_mb: u64,
    /// Lift the size cap on log-labeled specs
    pub all_logs: bool,
    pub profiles: Vec<String>,
    pub enable_collectors: Vec<String>,
    pub disable_collectors: Vec<String>,
    /// `collector.option` to raw value
    pub collector_options: BTreeMap<String, String>,
    pub ignore_unknown_options: bool,
    pub workers: Option<usize>,
    pub command_timeout_s: u64,
    pub deadline_s: Option<u64>,
    pub staging_base: PathBuf,
    pub preserve_staging_on_failure: bool,
    pub batch: bool,
    pub quiet: bool,
    pub verbose: bool,
    /// Host root that copy specs resolve against
    pub sysroot: PathBuf,
    pub require_root: bool,
    pub max_refine_rounds: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            name: None,
            compression: Compression::Auto,
            log_size_mb: DEFAULT_LOG_SIZE_MB,
            all_logs: false,
            profiles: Vec::new(),
            enable_collectors: Vec::new(),
            disable_collectors: Vec::new(),
            collector_options: BTreeMap::new(),
            ignore_unknown_options: false,
            workers: None,
            command_timeout_s: DEFAULT_COMMAND_TIMEOUT_SECS,
            deadline_s: None,
            staging_base: std::env::temp_dir(),
            preserve_staging_on_failure: false,
            batch: false,
            quiet: false,
            verbose: false,
            sysroot: PathBuf::from("/"),
            require_root: true,
            max_refine_rounds: DEFAULT_REFINE_ROUNDS,
        }
    }
}

impl RunConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: RunConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML config")?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .context(format!("Failed to write config to {}", path.display()))?;

        info!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Create a default configuration YAML file
    pub fn create_default_config_file(path: &Path) -> Result<()> {
        RunConfig::default().save_to_yaml_file(path)
    }

    /// Worker pool size: `max(2, min(cpu_count, configured))`.
    pub fn effective_workers(&self) -> usize {
        let cpus = num_cpus::get();
        let configured = self.workers.unwrap_or(cpus);
        std::cmp::max(MIN_WORKERS, std::cmp::min(cpus, configured))
    }

    /// Per-file cap in bytes, `None` when caps are disabled.
    pub fn log_size_bytes(&self) -> Option<u64> {
        if self.log_size_mb == 0 {
            None
        } else {
            Some(self.log_size_mb.saturating_mul(MIB))
        }
    }

    /// Split `collector.option=value` style overrides into a per-collector map.
    pub fn options_by_collector(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut out: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (key, value) in &self.collector_options {
            let (collector, option) = match key.split_once('.') {
                Some((c, o)) => (c.to_string(), o.to_string()),
                None => (String::new(), key.clone()),
            };
            out.entry(collector).or_default().insert(option, value.clone());
        }
        out
    }
}

/// Load configuration from a path if provided, otherwise use defaults
pub fn load_or_default(config_path: Option<&Path>) -> Result<RunConfig> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            RunConfig::from_yaml_file(path)
        }
        None => {
            debug!("No configuration file given, using defaults");
            Ok(RunConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.compression, Compression::Auto);
        assert_eq!(config.log_size_mb, DEFAULT_LOG_SIZE_MB);
        assert_eq!(config.command_timeout_s, 300);
        assert_eq!(config.sysroot, PathBuf::from("/"));
        assert!(config.require_root);
        assert_eq!(config.max_refine_rounds, 2);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("run.yaml");

        let mut config = RunConfig::default();
        config.profiles = vec!["network".to_string()];
        config.collector_options.insert("networking.traceroute".to_string(), "on".to_string());
        config.save_to_yaml_file(&config_path).unwrap();

        let loaded = RunConfig::from_yaml_file(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "compression: gzip\nworkers: 3\n").unwrap();

        let config = RunConfig::from_yaml_file(temp_file.path()).unwrap();
        assert_eq!(config.compression, Compression::Gzip);
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.log_size_mb, DEFAULT_LOG_SIZE_MB);
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "compression: [not, a, codec]").unwrap();

        let result = RunConfig::from_yaml_file(temp_file.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to parse YAML"));
    }

    #[test]
    fn test_effective_workers_bounds() {
        let mut config = RunConfig::default();
        config.workers = Some(1);
        assert_eq!(config.effective_workers(), MIN_WORKERS);

        config.workers = Some(10_000);
        assert_eq!(config.effective_workers(), std::cmp::max(MIN_WORKERS, num_cpus::get()));
    }

    #[test]
    fn test_log_size_zero_disables_cap() {
        let mut config = RunConfig::default();
        assert_eq!(config.log_size_bytes(), Some(DEFAULT_LOG_SIZE_MB * MIB));
        config.log_size_mb = 0;
        assert_eq!(config.log_size_bytes(), None);
    }

    #[test]
    fn test_options_by_collector() {
        let mut config = RunConfig::default();
        config.collector_options.insert("networking.traceroute".into(), "true".into());
        config.collector_options.insert("logs.since".into(), "-2days".into());
        config.collector_options.insert("stray".into(), "1".into());

        let split = config.options_by_collector();
        assert_eq!(split["networking"]["traceroute"], "true");
        assert_eq!(split["logs"]["since"], "-2days");
        assert_eq!(split[""]["stray"], "1");
    }

    #[test]
    fn test_compression_resolution() {
        assert!(Compression::None.is_available());
        assert_eq!(Compression::None.resolve(), Compression::None);

        let auto = Compression::Auto.resolve();
        assert!(auto.is_available());
        assert_ne!(auto, Compression::Auto);

        for requested in [Compression::Gzip, Compression::Xz, Compression::Zstd] {
            let used = requested.resolve();
            assert!(used.is_available());
            if requested.is_available() {
                assert_eq!(used, requested);
            }
        }
    }
}
