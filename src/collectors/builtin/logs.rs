use crate::collectors::context::SetupContext;
use crate::collectors::descriptor::Collector;
use crate::collectors::options::OptionSpec;
use crate::collectors::specs::{CopySpec, JournalQuery};

pub fn collector() -> Collector {
    Collector::new("logs", "system logs and logger configuration", setup)
        .profiles(&["system"])
        .option(OptionSpec::new("since", "journal window passed to --since", "-1days"))
        .option(OptionSpec::new("lines", "maximum journal lines, 0 for all", 0i64))
}

const LOG_FILES: &[&str] = &[
    "/var/log/messages",
    "/var/log/syslog",
    "/var/log/kern.log",
    "/var/log/boot.log",
    "/var/log/dmesg",
];

fn setup(ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
    ctx.add_forbidden_path("/var/log/journal/*");

    ctx.add_copy_specs(&["/etc/syslog.conf", "/etc/rsyslog.conf", "/etc/rsyslog.d"]);
    for path in LOG_FILES {
        ctx.add_copy_spec_with(CopySpec::new(path).log());
    }

    ctx.add_cmd_output(&["journalctl", "--disk-usage"]);

    let mut query = JournalQuery::new();
    if let Some(since) = ctx.option_str("since").filter(|s| !s.is_empty()) {
        query = query.since(&since);
    }
    if let Some(lines) = ctx.option_int("lines").filter(|n| *n > 0) {
        query = query.lines(lines as u64);
    }
    ctx.add_journal(query);
    Ok(())
}
