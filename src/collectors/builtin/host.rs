use crate::collectors::context::SetupContext;
use crate::collectors::descriptor::Collector;
use crate::collectors::specs::CommandSpec;

pub fn collector() -> Collector {
    Collector::new("host", "host identity and uptime", setup).profiles(&["system"])
}

fn setup(ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
    ctx.add_copy_specs(&["/etc/hostname", "/etc/hosts", "/etc/os-release", "/etc/machine-id"]);

    ctx.add_cmd_output(&["hostname"]);
    ctx.add_cmd_output(&["uptime"]);
    ctx.add_cmd(CommandSpec::new(["uname", "-a"]).root_symlink("uname"));
    ctx.add_cmd(CommandSpec::new(["date"]).unset_env("TZ"));

    let policy = ctx.policy();
    let summary = format!(
        "hostname: {}\nfamily: {}\nversion: {}\narch: {}\ncontainer: {}\nrunlevel: {}\n",
        policy.hostname(),
        policy.family(),
        policy.distribution_version().unwrap_or_else(|| "unknown".into()),
        policy.architecture(),
        policy.in_container(),
        policy.default_runlevel(),
    );
    ctx.add_string_as_file(&summary, "policy.txt");
    Ok(())
}
