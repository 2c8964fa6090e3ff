//! Report index rendering.
//!
//! The controller only guarantees that a renderer is called after
//! substitution and before the archive is closed. [`IndexRenderer`] is the
//! built-in one: a plain-text summary plus a minimal static HTML page.

use std::fmt::Write as _;

use anyhow::{Context, Result};

use crate::archive::StagingArchive;
use crate::constants::{INDEX_HTML_FILE, INDEX_TEXT_FILE};
use crate::models::ItemKind;
use crate::report::manifest::{CollectorRecord, Manifest};

#[cfg_attr(test, mockall::automock)]
pub trait ReportRenderer: Send + Sync {
    /// Write the report files into the staging tree.
    fn render(&self, manifest: &Manifest, staging: &StagingArchive) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IndexRenderer;

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn item_line(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::CopiedFile => "file",
        ItemKind::CopiedSymlink => "link",
        ItemKind::CommandOutput => "command",
        ItemKind::StringFile => "string",
        ItemKind::Alert => "alert",
    }
}

impl IndexRenderer {
    pub fn render_text(&self, manifest: &Manifest) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} {} report", manifest.tool, manifest.tool_version);
        let _ = writeln!(out, "run id:   {}", manifest.run_id);
        let _ = writeln!(out, "host:     {} ({} {})", manifest.host.hostname, manifest.host.family, manifest.host.version.as_deref().unwrap_or("unknown"));
        let _ = writeln!(out, "arch:     {}", manifest.host.arch);
        let _ = writeln!(out, "started:  {}", manifest.started_at.to_rfc3339());
        let _ = writeln!(out, "ended:    {}", manifest.ended_at.to_rfc3339());
        let _ = writeln!(out);

        for collector in &manifest.collectors {
            let _ = writeln!(out, "== {} [{}]", collector.name, collector.state);
            for alert in &collector.alerts {
                let _ = writeln!(out, "  ! {}", alert);
            }
            for failure in &collector.failures {
                let _ = writeln!(out, "  x {}", failure);
            }
            for item in collector.items.iter().filter(|i| i.kind != ItemKind::Alert) {
                let _ = write!(out, "  {:<8} {}", item_line(item.kind), item.archive_path.as_deref().unwrap_or("-"));
                if let Some(status) = item.exit_status {
                    let _ = write!(out, " (exit {})", status);
                }
                if item.truncated {
                    let _ = write!(out, " [truncated]");
                }
                if let Some(error) = &item.error {
                    let _ = write!(out, " [{}]", error);
                }
                let _ = writeln!(out);
            }
            for rule in collector.substitutions.iter().filter(|r| r.replacements > 0) {
                let _ = writeln!(out, "  ~ {} replaced {} times", rule.scope, rule.replacements);
            }
        }
        out
    }

    fn html_collector(out: &mut String, collector: &CollectorRecord) {
        let _ = writeln!(
            out,
            "<h2 id=\"{0}\">{0} <small>{1}</small></h2>",
            html_escape(&collector.name),
            collector.state
        );
        if !collector.alerts.is_empty() || !collector.failures.is_empty() {
            out.push_str("<ul class=\"alerts\">\n");
            for text in collector.alerts.iter().chain(collector.failures.iter()) {
                let _ = writeln!(out, "<li>{}</li>", html_escape(text));
            }
            out.push_str("</ul>\n");
        }
        for text in &collector.custom_text {
            let _ = writeln!(out, "<p>{}</p>", html_escape(text));
        }

        out.push_str("<ul>\n");
        for item in collector.items.iter().filter(|i| i.kind != ItemKind::Alert) {
            match item.archive_path.as_deref() {
                // Archive paths are relative to the root, the index is one level down
                Some(path) => {
                    let _ = write!(out, "<li><a href=\"../{0}\">{0}</a>", html_escape(path));
                }
                None => {
                    let _ = write!(out, "<li>{}", html_escape(&item.source_ref));
                }
            }
            if let Some(error) = &item.error {
                let _ = write!(out, " <em>{}</em>", html_escape(error));
            }
            out.push_str("</li>\n");
        }
        out.push_str("</ul>\n");
    }

    pub fn render_html(&self, manifest: &Manifest) -> String {
        let mut out = String::new();
        out.push_str("<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\">");
        let _ = writeln!(out, "<title>{} report</title></head>\n<body>", html_escape(&manifest.host.hostname));
        let _ = writeln!(
            out,
            "<h1>{}</h1>\n<p>{} {} / {} / {} {}</p>",
            html_escape(&manifest.host.hostname),
            html_escape(&manifest.tool),
            html_escape(&manifest.tool_version),
            html_escape(&manifest.host.family),
            html_escape(manifest.host.version.as_deref().unwrap_or("")),
            html_escape(&manifest.host.arch)
        );

        out.push_str("<ul>\n");
        for collector in &manifest.collectors {
            let _ = writeln!(out, "<li><a href=\"#{0}\">{0}</a></li>", html_escape(&collector.name));
        }
        out.push_str("</ul>\n");

        for collector in &manifest.collectors {
            Self::html_collector(&mut out, collector);
        }
        out.push_str("</body>\n</html>\n");
        out
    }
}

impl ReportRenderer for IndexRenderer {
    fn render(&self, manifest: &Manifest, staging: &StagingArchive) -> Result<()> {
        staging
            .write_internal(INDEX_TEXT_FILE, self.render_text(manifest).as_bytes())
            .context("Failed to write text report")?;
        staging
            .write_internal(INDEX_HTML_FILE, self.render_html(manifest).as_bytes())
            .context("Failed to write HTML report")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, RunConfig};
    use crate::models::{CapturedItem, CollectorState};
    use crate::report::manifest::{CompressionInfo, HostInfo};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn manifest() -> Manifest {
        let mut failed = CapturedItem::new("net", ItemKind::CommandOutput, "ip -d address").at("sos_commands/net/ip_-d_address");
        failed.exit_status = Some(127);
        failed.error = Some("command not found".into());

        Manifest {
            tool: "diag-collector".into(),
            tool_version: "0.1.0".into(),
            run_id: "r".into(),
            started_at: chrono::Utc::now(),
            ended_at: chrono::Utc::now(),
            host: HostInfo {
                hostname: "web<1>".into(),
                family: "redhat".into(),
                version: Some("9".into()),
                arch: "x86_64".into(),
                kernel: None,
                in_container: false,
            },
            config: RunConfig::default(),
            compression: CompressionInfo { requested: Compression::Auto, used: Compression::Gzip },
            collectors: vec![CollectorRecord {
                name: "net".into(),
                state: CollectorState::Failed,
                options: BTreeMap::new(),
                alerts: vec!["no route".into()],
                custom_text: Vec::new(),
                items: vec![failed],
                failures: vec!["every item failed".into()],
                substitutions: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_text_lists_items_and_failures() {
        let text = IndexRenderer.render_text(&manifest());
        assert!(text.contains("== net [failed]"));
        assert!(text.contains("sos_commands/net/ip_-d_address (exit 127) [command not found]"));
        assert!(text.contains("  ! no route"));
    }

    #[test]
    fn test_html_is_escaped() {
        let html = IndexRenderer.render_html(&manifest());
        assert!(html.contains("web&lt;1&gt;"));
        assert!(!html.contains("web<1>"));
        assert!(html.contains("href=\"../sos_commands/net/ip_-d_address\""));
    }

    #[test]
    fn test_render_writes_both_files() {
        let base = TempDir::new().unwrap();
        let staging = StagingArchive::create(base.path(), "h").unwrap();
        IndexRenderer.render(&manifest(), &staging).unwrap();
        assert!(staging.contains(INDEX_TEXT_FILE));
        assert!(staging.contains(INDEX_HTML_FILE));
    }
}
