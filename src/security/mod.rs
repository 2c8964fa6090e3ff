//! Guards applied to things leaving the process: command lines written to
//! logs and the manifest, file names derived from collector input, and the
//! archive destination.

pub mod credential_scrubber;
pub mod path_validator;

pub use credential_scrubber::{scrub_command_line, scrub_credentials};
pub use path_validator::{sanitize_filename, validate_output_path};
