use thiserror::Error;

/// Run-level failures, one variant per process exit code.
///
/// Per-task and per-collector problems never surface here; they are
/// recorded on captured items and descriptors instead.
#[derive(Debug, Error)]
pub enum RunError {
    /// Unknown collector, option or profile, a bad option value, or a
    /// substitution rule that does not compile
    #[error("configuration error: {0}")]
    Config(String),
    /// The staging tree could not be written, or the archive could not be
    /// produced
    #[error("staging failure: {0}")]
    Staging(String),
    /// Signal or deadline
    #[error("run aborted: {0}")]
    Aborted(String),
    #[error("permission denied: {0}")]
    Permission(String),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) => 1,
            RunError::Staging(_) | RunError::Aborted(_) => 3,
            RunError::Permission(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunError::Config("unknown collector 'nope'".into()).exit_code(), 1);
        assert_eq!(RunError::Staging("disk full".into()).exit_code(), 3);
        assert_eq!(RunError::Aborted("interrupted".into()).exit_code(), 3);
        assert_eq!(RunError::Permission("root required".into()).exit_code(), 4);
    }

    #[test]
    fn test_display() {
        let err = RunError::Config("unknown option 'host.bogus'".into());
        assert_eq!(err.to_string(), "configuration error: unknown option 'host.bogus'");
    }
}
