use crate::collectors::context::SetupContext;
use crate::collectors::descriptor::Collector;
use crate::collectors::options::OptionSpec;
use crate::collectors::specs::{CommandSpec, Scope};

pub fn collector() -> Collector {
    Collector::new("networking", "interfaces, routes, sockets and resolver setup", setup)
        .profiles(&["network"])
        .option(OptionSpec::new("traceroute", "trace the route to a public host", false).slow())
        .option(OptionSpec::new("trace_host", "host used by traceroute", "www.example.com"))
}

fn setup(ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
    ctx.add_copy_specs(&[
        "/etc/resolv.conf",
        "/etc/nsswitch.conf",
        "/etc/host.conf",
        "/etc/sysconfig/network-scripts",
        "/etc/network/interfaces",
        "/etc/network/interfaces.d",
        "/etc/NetworkManager/system-connections",
        "/proc/net/dev",
        "/proc/net/sockstat",
    ]);

    ctx.add_cmd_output(&["ip", "-d", "address"]);
    ctx.add_cmd_output(&["ip", "route", "show", "table", "all"]);
    ctx.add_cmd_output(&["ip", "-s", "link"]);
    ctx.add_cmd_output(&["ss", "-peaonmi"]);

    if ctx.option_bool("traceroute") {
        let host = ctx.option_str("trace_host").unwrap_or_default();
        ctx.add_cmd(CommandSpec::new(["traceroute", "-n", host.as_str()]).timeout(60));
    }

    // Wireless and VPN secrets in NetworkManager keyfiles
    ctx.add_postproc_substitution(
        Scope::ArchivePath("etc/NetworkManager/system-connections/*".into()),
        r"(?m)^(psk|password|secrets|wep-key\d)=.*$",
        "${1}=********",
    );
    ctx.add_postproc_substitution(
        Scope::ArchivePath("etc/sysconfig/network-scripts/*".into()),
        r"(?m)^(WPA_PSK|IPSEC_PSK|PASSWORD)=.*$",
        "${1}=********",
    );
    Ok(())
}
