use std::fmt;

use serde::{Serialize, Deserialize};

/// What a ledger entry describes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    CopiedFile,
    CopiedSymlink,
    CommandOutput,
    StringFile,
    Alert,
}

impl ItemKind {
    /// Kinds whose archive path holds regular-file content
    pub fn has_content(&self) -> bool {
        matches!(self, ItemKind::CopiedFile | ItemKind::CommandOutput | ItemKind::StringFile)
    }
}

/// One executed spec, as recorded in the run ledger and the manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CapturedItem {
    pub origin_collector: String,
    pub kind: ItemKind,
    pub source_ref: String,
    /// Alerts and dropped items have no archive path
    pub archive_path: Option<String>,
    pub exit_status: Option<i32>,
    pub runtime_s: Option<f64>,
    #[serde(default)]
    pub bytes_written: u64,
    pub truncated: bool,
    pub error: Option<String>,
}

impl CapturedItem {
    pub fn new(origin: &str, kind: ItemKind, source_ref: impl Into<String>) -> Self {
        Self {
            origin_collector: origin.to_string(),
            kind,
            source_ref: source_ref.into(),
            archive_path: None,
            exit_status: None,
            runtime_s: None,
            bytes_written: 0,
            truncated: false,
            error: None,
        }
    }

    /// An annotation that occupies no archive path.
    pub fn alert(origin: &str, source_ref: impl Into<String>, message: impl Into<String>) -> Self {
        let mut item = Self::new(origin, ItemKind::Alert, source_ref);
        item.error = Some(message.into());
        item
    }

    pub fn at(mut self, archive_path: impl Into<String>) -> Self {
        self.archive_path = Some(archive_path.into());
        self
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Key used by consumers that need a deterministic order
    pub fn sort_key(&self) -> (&str, &str) {
        (
            self.origin_collector.as_str(),
            self.archive_path.as_deref().unwrap_or(""),
        )
    }
}

/// Lifecycle of a collector within one run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Registered,
    Enabled,
    SetupDone,
    Collected,
    PostProcessed,
    Failed,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectorState::Registered => "registered",
            CollectorState::Enabled => "enabled",
            CollectorState::SetupDone => "setup-done",
            CollectorState::Collected => "collected",
            CollectorState::PostProcessed => "post-processed",
            CollectorState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_has_no_archive_path() {
        let item = CapturedItem::alert("kernel", "lsmod", "command not found");
        assert_eq!(item.kind, ItemKind::Alert);
        assert!(item.archive_path.is_none());
        assert!(item.failed());
        assert_eq!(item.sort_key(), ("kernel", ""));
    }

    #[test]
    fn test_item_serialization() {
        let item = CapturedItem::new("host", ItemKind::CopiedFile, "/etc/hosts").at("etc/hosts");
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"kind\":\"CopiedFile\""));
        assert!(json.contains("\"archive_path\":\"etc/hosts\""));

        let back: CapturedItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_content_kinds() {
        assert!(ItemKind::CommandOutput.has_content());
        assert!(!ItemKind::CopiedSymlink.has_content());
        assert!(!ItemKind::Alert.has_content());
    }
}
