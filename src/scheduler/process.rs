//! The single place subprocesses are created.
//!
//! Collector setup must only declare commands. While a [`SetupScope`] is
//! alive on a thread, [`command`] refuses to build a process there, which
//! turns a collector spawning work of its own into an immediate, attributable
//! error instead of silent host I/O.
//!
//! Every command runs in its own process group. The groups still alive are
//! tracked here so a forced exit can kill them instead of orphaning them.

use std::cell::Cell;
use std::collections::HashSet;
use std::io;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::debug;
use thiserror::Error;

thread_local! {
    static IN_SETUP: Cell<bool> = Cell::new(false);
}

lazy_static! {
    static ref LIVE_GROUPS: ProcessGroups = ProcessGroups::default();
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("subprocess '{0}' requested during collector setup")]
    InSetup(String),
}

/// Marks the current thread as running collector setup until dropped.
pub struct SetupScope {
    previous: bool,
}

impl SetupScope {
    pub fn enter() -> Self {
        let previous = IN_SETUP.with(|flag| flag.replace(true));
        SetupScope { previous }
    }
}

impl Drop for SetupScope {
    fn drop(&mut self) {
        let previous = self.previous;
        IN_SETUP.with(|flag| flag.set(previous));
    }
}

pub fn in_setup_scope() -> bool {
    IN_SETUP.with(|flag| flag.get())
}

/// Build a command for `program`, unless called from inside setup.
pub fn command(program: &str) -> Result<tokio::process::Command, SpawnError> {
    if in_setup_scope() {
        return Err(SpawnError::InSetup(program.to_string()));
    }
    Ok(tokio::process::Command::new(program))
}

/// Send `signal` to the process group led by `pgid`.
pub(crate) fn signal_group(pgid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) with a negative pid addresses the process group the
    // child created with setpgid.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if rc != 0 {
        debug!("kill(-{}, {}) failed: {}", pgid, signal, io::Error::last_os_error());
    }
}

/// Process groups of commands that have not been reaped yet.
#[derive(Debug, Default)]
pub struct ProcessGroups {
    live: Mutex<HashSet<u32>>,
}

impl ProcessGroups {
    pub fn track(&self, pgid: u32) -> GroupGuard<'_> {
        if let Ok(mut live) = self.live.lock() {
            live.insert(pgid);
        }
        GroupGuard { groups: self, pgid }
    }

    pub fn len(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every tracked group. Returns how many were signalled.
    pub fn signal_all(&self, signal: libc::c_int) -> usize {
        let live: Vec<u32> = match self.live.lock() {
            Ok(live) => live.iter().copied().collect(),
            Err(_) => return 0,
        };
        for pgid in &live {
            signal_group(*pgid, signal);
        }
        live.len()
    }
}

/// Keeps a group registered until the child is reaped.
pub struct GroupGuard<'a> {
    groups: &'a ProcessGroups,
    pgid: u32,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut live) = self.groups.live.lock() {
            live.remove(&self.pgid);
        }
    }
}

/// Groups of every command this process is running.
pub fn live_groups() -> &'static ProcessGroups {
    &LIVE_GROUPS
}

pub(crate) fn track_group(pgid: u32) -> GroupGuard<'static> {
    LIVE_GROUPS.track(pgid)
}
