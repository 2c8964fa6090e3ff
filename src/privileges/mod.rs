use log::{info, warn};

use crate::controller::RunError;

/// Check if the process is running as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Get instructions for elevating privileges
pub fn get_elevation_instructions() -> &'static str {
    "Run with sudo: 'sudo diag-collector', or pass --force to collect what is readable"
}

/// Startup permission check.
///
/// With `require_root` a non-root run is refused before anything is
/// created. Without it the run proceeds and unreadable sources are recorded
/// as item errors.
pub fn check_privileges(require_root: bool) -> Result<(), RunError> {
    if is_root() {
        info!("Running as root");
        return Ok(());
    }
    if require_root {
        return Err(RunError::Permission(format!(
            "this tool must be run as root. {}",
            get_elevation_instructions()
        )));
    }
    warn!("Not running as root, some files and commands may be inaccessible");
    Ok(())
}
