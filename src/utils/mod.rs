//! Utility functions shared by the engine.
//!
//! ### Generating File Hashes
//!
//! ```no_run
//! use diag_collector::utils::hash::calculate_sha256;
//! use std::path::Path;
//!
//! # fn example() -> std::io::Result<()> {
//! let digest = calculate_sha256(Path::new("/var/tmp/host-20240101.tar.xz"))?;
//! println!("SHA-256: {}", digest);
//! # Ok(())
//! # }
//! ```

/// Cryptographic hash calculation utilities
pub mod hash;
