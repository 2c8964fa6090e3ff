//! # diag_collector
//!
//! A diagnostic data collector for UNIX-like hosts. A run gathers
//! configuration files, command output and logs from many independent
//! collectors into one compressed tarball that support staff can read.
//!
//! ## Overview
//!
//! Collectors are declarative: during setup each one states which files to
//! copy, which commands to run, which synthetic files to write and which
//! secrets to redact. The engine executes those declarations on a bounded
//! worker pool, applies redaction, writes a JSON manifest with every item's
//! outcome and compresses the staging tree into the final archive.
//!
//! ## Features
//!
//! - **Pluggable collectors**: a registry activated by platform, gates and profiles
//! - **Bounded concurrency**: commands and file copies share a worker pool
//! - **Command safety**: timeouts, process-group termination and output caps
//! - **Redaction**: per-collector regex substitutions before anything is archived
//! - **Reproducible output**: the manifest is ordered independently of scheduling
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use diag_collector::collectors::Registry;
//! use diag_collector::config::RunConfig;
//! use diag_collector::controller::Controller;
//! use diag_collector::policy::{HostPolicy, LinuxPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), diag_collector::controller::RunError> {
//! let config = RunConfig::default();
//! let policy: Arc<dyn HostPolicy> = Arc::new(LinuxPolicy::detect(&config.sysroot));
//! let controller = Controller::new(config, Registry::builtin(), policy);
//!
//! let outcome = controller.run(CancellationToken::new()).await?;
//! println!("{} -> {}", outcome.archive.path.display(), outcome.archive.checksum);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`cli`]: Command-line interface definitions and argument parsing
//! - [`config`]: Run configuration loaded from YAML and overlaid by flags
//! - [`collectors`]: Collector descriptors, setup context and the registry
//! - [`scheduler`]: Spec expansion, the worker pool and command execution
//! - [`archive`]: The staging tree and final compression
//! - [`postproc`]: Redaction of captured content
//! - [`report`]: Manifest and human-readable index
//! - [`controller`]: Run lifecycle, signals and exit codes
//! - [`policy`]: Host identity, package queries and sysroot handling
//!
//! ## Safety
//!
//! The only `unsafe` code is the `pre_exec` hook that places each child
//! command in its own process group (and chroots it when collecting from a
//! sysroot).

/// Command-line interface definitions and argument parsing
pub mod cli;

/// Core data models shared by the scheduler, post-processing and report
pub mod models;

/// Collector descriptors, setup context and registry
pub mod collectors;

/// Utility functions for hashing
pub mod utils;

/// Run configuration
pub mod config;

/// Privilege checks
pub mod privileges;

/// Application constants and configuration values
pub mod constants;

/// Security utilities for path validation and credential protection
pub mod security;

/// Host platform policy
pub mod policy;

/// Staging tree and final archive
pub mod archive;

/// Task scheduling and command execution
pub mod scheduler;

/// Redaction of captured content
pub mod postproc;

/// Manifest and index rendering
pub mod report;

/// Run lifecycle
pub mod controller;
