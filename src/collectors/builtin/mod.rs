//! The built-in collector catalog.
//!
//! Each collector is a short recipe: files to copy, commands to run and
//! substitutions to apply. The engine does everything else.

pub mod host;
pub mod kernel;
pub mod logs;
pub mod networking;
pub mod packages;
pub mod ssh;
pub mod systemd;

use crate::collectors::descriptor::Collector;

/// Every built-in collector, in registration order.
pub fn all() -> Vec<Collector> {
    vec![
        host::collector(),
        kernel::collector(),
        logs::collector(),
        networking::collector(),
        packages::rpm_collector(),
        packages::dpkg_collector(),
        ssh::collector(),
        systemd::collector(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::registry::Registry;
    use crate::collectors::context::{SetupContext, SpecDefaults};
    use crate::policy::{Family, StaticPolicy};
    use std::collections::BTreeMap;

    #[test]
    fn test_catalog_names_are_unique() {
        assert!(Registry::new(all()).is_ok());
    }

    #[test]
    fn test_every_setup_declares_work_without_errors() {
        let policy = StaticPolicy::new(Family::RedHat);
        let defaults = SpecDefaults { log_size: Some(25 << 20), all_logs: false, command_timeout_s: 300 };
        for collector in all() {
            let options: BTreeMap<_, _> = collector
                .info
                .options
                .iter()
                .map(|o| (o.key.clone(), o.default.clone()))
                .collect();
            let mut ctx = SetupContext::new(collector.name(), &options, &policy, defaults);
            (collector.setup)(&mut ctx).unwrap();
            let (specs, errors) = ctx.into_parts();
            assert!(errors.is_empty(), "{}: {:?}", collector.name(), errors);
            assert!(specs.has_work(), "{} declared nothing", collector.name());
        }
    }
}
