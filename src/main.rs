use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use diag_collector::cli::{Args, Commands};
use diag_collector::collectors::{ListingEntry, Registry};
use diag_collector::config::{load_or_default, RunConfig};
use diag_collector::controller::signals::{self, TeardownSlot};
use diag_collector::controller::{Controller, RunOutcome};
use diag_collector::policy::{HostPolicy, LinuxPolicy};

fn main() {
    let args = Args::parse();
    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<i32> {
    if let Some(Commands::InitConfig { path }) = &args.command {
        initialize_logging(terminal_level(&args), None)?;
        info!("Creating default configuration file at {}", path.display());
        RunConfig::create_default_config_file(path)?;
        info!("Configuration created successfully");
        return Ok(0);
    }

    let mut config = load_or_default(args.config.as_deref())?;
    args.apply_to(&mut config)?;
    let registry = Registry::builtin();

    if args.list_collectors || args.list_profiles {
        initialize_logging(terminal_level(&args), None)?;
        let policy = LinuxPolicy::detect(&config.sysroot);
        if args.list_collectors {
            print_collectors(&registry, &policy);
        }
        if args.list_profiles {
            print_profiles(&registry);
        }
        return Ok(0);
    }

    let log_path = create_run_log(&config.staging_base)?;
    let log_file = OpenOptions::new()
        .append(true)
        .open(&log_path)
        .context(format!("Failed to open run log {}", log_path.display()))?;
    initialize_logging(terminal_level(&args), Some(log_file))?;

    info!("Starting diagnostic collection");
    let policy: Arc<dyn HostPolicy> = Arc::new(LinuxPolicy::detect(&config.sysroot));
    let quiet = config.quiet || config.batch;

    let runtime = Runtime::new().context("Failed to create async runtime")?;
    let code = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let teardown = TeardownSlot::default();
        let _signals = signals::install(cancel.clone(), teardown.clone())
            .context("Failed to install signal handlers")?;

        let controller = Controller::new(config, registry, policy)
            .with_run_log(&log_path)
            .with_teardown(teardown);

        Ok::<i32, anyhow::Error>(match controller.run(cancel).await {
            Ok(outcome) => {
                print_summary(&outcome, quiet);
                outcome.exit_code()
            }
            Err(e) => {
                error!("{}", e);
                e.exit_code()
            }
        })
    })?;

    if let Err(e) = fs::remove_file(&log_path) {
        warn!("Failed to remove run log {}: {}", log_path.display(), e);
    }
    Ok(code)
}

fn terminal_level(args: &Args) -> LevelFilter {
    if args.verbose {
        LevelFilter::Debug
    } else if args.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    }
}

/// Create the private file the run log is written to before it is copied
/// into the archive.
fn create_run_log(base: &Path) -> Result<PathBuf> {
    fs::create_dir_all(base).context(format!("Failed to create {}", base.display()))?;
    let path = base.join(format!(".diag-collector-{}.log", Uuid::new_v4()));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .context(format!("Failed to create run log {}", path.display()))?;
    Ok(path)
}

/// Terminal logging at `level`, plus a debug-level file logger when a run
/// log is given.
fn initialize_logging(level: LevelFilter, run_log: Option<File>) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];
    if let Some(file) = run_log {
        loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file));
    }
    CombinedLogger::init(loggers).context("Failed to initialize logger")?;
    Ok(())
}

fn print_collectors(registry: &Registry, policy: &dyn HostPolicy) {
    println!("{}", ListingEntry::HEADER);
    for entry in registry.listing(policy) {
        println!("{}", entry.row());
    }
}

fn print_profiles(registry: &Registry) {
    for (profile, collectors) in registry.profiles() {
        println!("{:<16} {}", profile, collectors.join(", "));
    }
}

fn print_summary(outcome: &RunOutcome, quiet: bool) {
    let failed = outcome.manifest.failed_collectors();
    let lines = vec![
        format!(
            "Collected {} items ({} with errors) from {} collectors",
            outcome.item_count(),
            outcome.failed_item_count(),
            outcome.manifest.collectors.len()
        ),
        if failed.is_empty() {
            "All collectors completed".to_string()
        } else {
            format!("Failed collectors: {}", failed.join(", "))
        },
        format!("Archive: {}", outcome.archive.path.display()),
        format!("SHA-256: {}", outcome.archive.checksum),
    ];
    for line in lines {
        if quiet {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }
}
