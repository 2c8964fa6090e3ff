//! SIGINT/SIGTERM handling.
//!
//! The first signal cancels the run token and lets the controller unwind.
//! A second one inside the window skips finalization. Running command
//! groups are killed and the staging tree is removed before the process
//! exits with status 3.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::SECOND_SIGNAL_WINDOW_SECS;
use crate::scheduler::process;

/// Where the staging tree lives, for a forced teardown.
#[derive(Debug, Clone, Default)]
pub struct TeardownSlot(Arc<Mutex<Option<PathBuf>>>);

impl TeardownSlot {
    pub fn set(&self, private_dir: PathBuf) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(private_dir);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = None;
        }
    }

    pub fn get(&self) -> Option<PathBuf> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Cancel,
    ForceExit,
}

/// Decides what each incoming signal means.
#[derive(Debug)]
pub struct SignalTracker {
    window: Duration,
    last: Option<Instant>,
}

impl SignalTracker {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn on_signal(&mut self, now: Instant) -> SignalAction {
        match self.last {
            Some(previous) if now.duration_since(previous) <= self.window => SignalAction::ForceExit,
            _ => {
                self.last = Some(now);
                SignalAction::Cancel
            }
        }
    }
}

/// Install the handler on the current runtime.
pub fn install(cancel: CancellationToken, teardown: TeardownSlot) -> std::io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let mut tracker = SignalTracker::new(Duration::from_secs(SECOND_SIGNAL_WINDOW_SECS));
        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            };
            match tracker.on_signal(Instant::now()) {
                SignalAction::Cancel => {
                    warn!("{} received, cancelling the run (repeat within {}s to abort immediately)", name, SECOND_SIGNAL_WINDOW_SECS);
                    cancel.cancel();
                }
                SignalAction::ForceExit => {
                    error!("Second {} received, aborting without finalization", name);
                    let killed = process::live_groups().signal_all(libc::SIGKILL);
                    if killed > 0 {
                        warn!("Killed {} running command process groups", killed);
                    }
                    if let Some(dir) = teardown.get() {
                        if let Err(e) = std::fs::remove_dir_all(&dir) {
                            error!("Failed to remove staging tree {}: {}", dir.display(), e);
                        }
                    }
                    std::process::exit(3);
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_signal_inside_window_forces_exit() {
        let mut tracker = SignalTracker::new(Duration::from_secs(2));
        let start = Instant::now();
        assert_eq!(tracker.on_signal(start), SignalAction::Cancel);
        assert_eq!(tracker.on_signal(start + Duration::from_millis(500)), SignalAction::ForceExit);
    }

    #[test]
    fn test_late_second_signal_only_cancels() {
        let mut tracker = SignalTracker::new(Duration::from_secs(2));
        let start = Instant::now();
        assert_eq!(tracker.on_signal(start), SignalAction::Cancel);
        assert_eq!(tracker.on_signal(start + Duration::from_secs(5)), SignalAction::Cancel);
        assert_eq!(tracker.on_signal(start + Duration::from_secs(6)), SignalAction::ForceExit);
    }

    #[test]
    fn test_teardown_slot() {
        let slot = TeardownSlot::default();
        assert!(slot.get().is_none());
        slot.set(PathBuf::from("/tmp/x"));
        assert_eq!(slot.clone().get(), Some(PathBuf::from("/tmp/x")));
        slot.clear();
        assert!(slot.get().is_none());
    }
}
