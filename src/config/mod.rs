//! Run configuration: YAML file, defaults, and the pieces the CLI overlays.

mod run_config;

pub use run_config::{
    Compression,
    RunConfig,
    load_or_default,
};
