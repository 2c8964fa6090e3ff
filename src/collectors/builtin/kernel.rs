use crate::collectors::context::SetupContext;
use crate::collectors::descriptor::Collector;
use crate::collectors::specs::CommandSpec;

pub fn collector() -> Collector {
    Collector::new("kernel", "kernel command line, modules and tunables", setup)
        .profiles(&["system", "hardware", "kernel"])
}

fn setup(ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
    // Writing to these has side effects; reading them is never useful
    ctx.add_forbidden_paths(&[
        "/proc/sys/net/ipv4/route/flush",
        "/proc/sys/net/ipv6/route/flush",
        "/proc/sys/vm/compact_memory",
    ]);

    ctx.add_copy_specs(&[
        "/proc/cmdline",
        "/proc/modules",
        "/proc/sys/kernel/tainted",
        "/etc/sysctl.conf",
        "/etc/sysctl.d",
        "/etc/modprobe.d",
    ]);

    ctx.add_cmd(CommandSpec::new(["lsmod"]).root_symlink("lsmod"));
    ctx.add_cmd_output(&["sysctl", "-a"]);
    if let Some(version) = ctx.policy().kernel_version() {
        ctx.add_copy_spec(&format!("/lib/modules/{}/modules.dep", version));
    }
    Ok(())
}
