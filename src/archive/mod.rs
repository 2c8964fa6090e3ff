//! Staging tree and final archive.
//!
//! ## Components
//!
//! - **Paths**: normalization, command mangling, relative symlink targets
//! - **Staging**: the single mutation point for archive content, with the
//!   forbidden-path and size-limit rules enforced on entry
//! - **Compress**: tarball, codec selection and atomic placement

pub mod compress;
pub mod paths;
pub mod staging;

pub use compress::{default_output_path, FinalArchive};
pub use staging::{CopyOptions, StagingArchive, StagingError};
