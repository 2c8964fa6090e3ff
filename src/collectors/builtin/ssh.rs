use crate::collectors::context::SetupContext;
use crate::collectors::descriptor::Collector;
use crate::collectors::specs::Scope;

pub fn collector() -> Collector {
    Collector::new("ssh", "OpenSSH client and server configuration", setup)
        .profiles(&["services", "security", "identity"])
}

fn setup(ctx: &mut SetupContext<'_>) -> anyhow::Result<()> {
    ctx.add_forbidden_path("/etc/ssh/*_key");

    ctx.add_copy_specs(&[
        "/etc/ssh/ssh_config",
        "/etc/ssh/ssh_config.d",
        "/etc/ssh/sshd_config",
        "/etc/ssh/sshd_config.d",
    ]);

    // Keys pasted inline into configuration
    ctx.add_postproc_substitution(
        Scope::ArchivePath("etc/ssh/**".into()),
        r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
        "-----SCRUBBED PRIVATE KEY-----",
    );
    Ok(())
}
