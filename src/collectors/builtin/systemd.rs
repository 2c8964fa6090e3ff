use crate::collectors::context::SetupContext;
use crate::collectors::descriptor::{Collector, Gate};
use crate::collectors::specs::JournalQuery;

pub fn collector() -> Collector {
    Collector::new("systemd", "systemd units, state and boot timing", setup)
        .profiles(&["system", "services", "boot"])
        .gate(Gate::PackageInstalled("systemd".into()))
        .gate(Gate::FileExists("/run/systemd/system".into()))
}

fn setup(ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
    ctx.add_copy_specs(&["/etc/systemd", "/lib/systemd/system/*.service", "/etc/machine-info"]);

    ctx.add_cmd_output(&["systemctl", "status", "--all", "--no-pager"]);
    ctx.add_cmd_output(&["systemctl", "list-unit-files", "--no-pager"]);
    ctx.add_cmd_output(&["systemctl", "list-units", "--failed", "--no-pager"]);
    ctx.add_cmd_output(&["systemd-analyze"]);
    ctx.add_cmd_output(&["systemd-analyze", "blame"]);

    ctx.add_journal(JournalQuery::new().unit("systemd-logind").since("-1days"));
    Ok(())
}
