//! Package database listings, for rpm and dpkg families.
//!
//! Both collectors run the listing as a first-wave command. Their refine
//! hook reads that captured listing back from the archive and, when
//! `verify` is on, declares verification commands for the core packages it
//! finds there.

use std::collections::BTreeSet;

use log::debug;

use crate::collectors::context::SetupContext;
use crate::collectors::descriptor::{Collector, Gate};
use crate::collectors::options::OptionSpec;
use crate::collectors::specs::CommandSpec;
use crate::policy::Family;

/// Packages worth verifying when present
const CORE_PACKAGES: &[&str] = &[
    "bash", "coreutils", "glibc", "libc6", "kernel", "linux-image", "openssh-server",
    "openssh", "pam", "libpam-modules", "sudo", "systemd", "util-linux",
];

const VERIFY_LIMIT_DEFAULT: i64 = 10;

fn package_options(collector: Collector) -> Collector {
    collector
        .option(OptionSpec::new("verify", "verify core packages against the package database", false).slow())
        .option(OptionSpec::new("verify_limit", "maximum number of packages to verify", VERIFY_LIMIT_DEFAULT))
}

pub fn rpm_collector() -> Collector {
    let collector = Collector::new("packages-rpm", "rpm package listing and repositories", setup_rpm)
        .platforms(&[Family::RedHat, Family::Suse])
        .profiles(&["system", "packaging"])
        .gate(Gate::ExecutableAvailable("rpm".into()))
        .with_refine(|ctx| refine(ctx, "rpm", |name| vec!["rpm".into(), "-V".into(), name.into()]));
    package_options(collector)
}

pub fn dpkg_collector() -> Collector {
    let collector = Collector::new("packages-dpkg", "dpkg package listing and apt sources", setup_dpkg)
        .platforms(&[Family::Debian, Family::Ubuntu])
        .profiles(&["system", "packaging"])
        .gate(Gate::ExecutableAvailable("dpkg".into()))
        .with_refine(|ctx| refine(ctx, "dpkg-query", |name| vec!["dpkg".into(), "--verify".into(), name.into()]));
    package_options(collector)
}

fn setup_rpm(ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
    ctx.add_copy_specs(&["/etc/yum.conf", "/etc/yum.repos.d", "/etc/dnf/dnf.conf", "/etc/zypp/repos.d"]);
    ctx.add_cmd(
        CommandSpec::new(["rpm", "-qa", "--queryformat", "%{NAME}|%{VERSION}-%{RELEASE}\\n"])
            .suggest_filename("installed-rpms")
            .root_symlink("installed-rpms")
            .chroot(true),
    );
    Ok(())
}

fn setup_dpkg(ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
    ctx.add_copy_specs(&["/etc/apt/sources.list", "/etc/apt/sources.list.d", "/etc/apt/apt.conf.d", "/var/log/dpkg.log"]);
    ctx.add_cmd(
        CommandSpec::new(["dpkg-query", "-W", "-f", "${Package}|${Version}|${db:Status-Abbrev}\\n"])
            .suggest_filename("installed-debs")
            .root_symlink("installed-debs")
            .chroot(true),
    );
    Ok(())
}

/// Names from a `name|version[|status]` listing, skipping dpkg entries
/// that are not installed.
fn listed_packages(listing: &str) -> BTreeSet<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('|');
            let name = fields.next()?.trim();
            let _version = fields.next()?;
            match fields.next().map(str::trim) {
                Some(status) if !(status.starts_with("ii") || status.starts_with("hi")) => None,
                _ if name.is_empty() => None,
                _ => Some(name.to_string()),
            }
        })
        .collect()
}

fn refine<F>(ctx: &mut SetupContext<'_>, lister: &str, verify_argv: F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Vec<String>,
{
    // Only the first wave's listing is interesting
    if ctx.round() != 1 || !ctx.option_bool("verify") {
        return Ok(());
    }

    let listing_path = match ctx.command_output(lister).map(str::to_string) {
        Some(path) => path,
        None => {
            ctx.add_alert(&format!("no {} listing captured, package verification skipped", lister));
            return Ok(());
        }
    };
    let listing = ctx.read_captured(&listing_path)?;
    let installed = listed_packages(&String::from_utf8_lossy(&listing));

    let limit = ctx.option_int("verify_limit").unwrap_or(VERIFY_LIMIT_DEFAULT).max(0) as usize;
    let targets: Vec<&str> = CORE_PACKAGES
        .iter()
        .copied()
        .filter(|name| installed.contains(*name))
        .take(limit)
        .collect();
    debug!("[{}] verifying {:?}", ctx.collector(), targets);

    for name in targets {
        ctx.add_cmd(
            CommandSpec::new(verify_argv(name))
                .suggest_filename(&format!("verify-{}", name))
                .chroot(true),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::StagingArchive;
    use crate::collectors::context::{PriorWave, SpecDefaults};
    use crate::models::{CapturedItem, ItemKind};
    use crate::collectors::options::OptionValue;
    use crate::policy::StaticPolicy;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn defaults() -> SpecDefaults {
        SpecDefaults { log_size: None, all_logs: false, command_timeout_s: 300 }
    }

    #[test]
    fn test_listed_packages() {
        let rpm = "bash|5.1.8-6.el9\nsudo|1.9.5p2-9.el9\n\nbroken\n";
        assert_eq!(
            listed_packages(rpm),
            BTreeSet::from(["bash".to_string(), "sudo".to_string()])
        );

        let dpkg = "bash|5.1-6|ii \nold-kernel|5.10|rc \nsudo|1.9|hi \n";
        assert_eq!(
            listed_packages(dpkg),
            BTreeSet::from(["bash".to_string(), "sudo".to_string()])
        );
    }

    #[test]
    fn test_refine_declares_verification_from_listing() {
        let base = TempDir::new().unwrap();
        let staging = StagingArchive::create(base.path(), "h").unwrap();
        let item = staging
            .add_string("packages-rpm", b"bash|5.1\nsudo|1.9\nvim|9.0\n", "sos_commands/packages-rpm/installed-rpms")
            .unwrap();
        let mut listing = item;
        listing.kind = ItemKind::CommandOutput;
        listing.source_ref = "rpm -qa --queryformat %{NAME}|%{VERSION}-%{RELEASE}\\n".into();
        let items: Vec<CapturedItem> = vec![listing];

        let mut options = BTreeMap::new();
        options.insert("verify".to_string(), OptionValue::Bool(true));
        options.insert("verify_limit".to_string(), OptionValue::Int(10));
        let policy = StaticPolicy::new(Family::RedHat);

        let collector = rpm_collector();
        let refine_hook = collector.refine.clone().unwrap();
        let prior = PriorWave { items: &items, staging: &staging };
        let mut ctx = SetupContext::new("packages-rpm", &options, &policy, defaults()).for_refine(1, prior);
        refine_hook(&mut ctx).unwrap();

        let (specs, errors) = ctx.into_parts();
        assert!(errors.is_empty());
        let argvs: Vec<Vec<String>> = specs.command_specs.iter().map(|c| c.argv.clone()).collect();
        assert_eq!(argvs, vec![vec!["rpm", "-V", "bash"], vec!["rpm", "-V", "sudo"]]);
    }

    #[test]
    fn test_refine_is_quiet_without_verify() {
        let base = TempDir::new().unwrap();
        let staging = StagingArchive::create(base.path(), "h").unwrap();
        let items: Vec<CapturedItem> = Vec::new();
        let options = BTreeMap::new();
        let policy = StaticPolicy::new(Family::Debian);

        let collector = dpkg_collector();
        let refine_hook = collector.refine.clone().unwrap();
        let prior = PriorWave { items: &items, staging: &staging };
        let mut ctx = SetupContext::new("packages-dpkg", &options, &policy, defaults()).for_refine(1, prior);
        refine_hook(&mut ctx).unwrap();
        let (specs, _) = ctx.into_parts();
        assert!(!specs.has_work());
        assert!(specs.alerts.is_empty());
    }
}
