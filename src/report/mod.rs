// Run manifest and the report index rendered from it.
pub mod manifest;
pub mod render;

pub use manifest::{CollectorRecord, CompressionInfo, HostInfo, Manifest};
pub use render::{IndexRenderer, ReportRenderer};
