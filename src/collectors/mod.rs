//! Collectors and the machinery that activates them.
//!
//! A collector is a declarative recipe: during setup it is handed a
//! [`SetupContext`](context::SetupContext) and declares the files to copy,
//! commands to run, synthetic strings to write and substitutions to apply.
//! It never performs I/O itself. The scheduler executes what was declared.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Registry                  │
//! │   platform filter → gates → profiles    │
//! ├─────────────────────────────────────────┤
//! │              RunPlan                    │
//! │   active collectors + merged options    │
//! ├─────────────────────────────────────────┤
//! │     setup(ctx) / refine(ctx, round)     │
//! │  ┌─────────┬──────────┬──────────┐      │
//! │  │  copy   │ command  │  string  │      │
//! │  │  specs  │  specs   │  specs   │      │
//! │  └─────────┴──────────┴──────────┘      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```no_run
//! use diag_collector::collectors::descriptor::Collector;
//! use diag_collector::collectors::registry::Registry;
//!
//! # fn example() -> Result<(), diag_collector::controller::RunError> {
//! let app = Collector::new("app", "application configuration", |ctx| {
//!     ctx.add_copy_spec("/etc/app/app.conf");
//!     ctx.add_cmd_output(&["app-ctl", "status"]);
//!     Ok(())
//! });
//! let registry = Registry::new(vec![app])?;
//! assert!(registry.get("app").is_some());
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod context;
pub mod descriptor;
pub mod options;
pub mod registry;
pub mod specs;

pub use context::SetupContext;
pub use descriptor::{Collector, Descriptor, Gate};
pub use registry::{ListingEntry, Registry, RunPlan};
