use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::filer::mover::SourceDisposition;
use crate::filer::record_store::LinkSnapshot;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
    Reverted,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Reverted => "reverted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipMode {
    /// Leave the document where it is and stop offering it.
    InPlace,
    /// Set the document aside in the configured skip folder.
    ToFolder,
}

/// A filter value as chosen by the caller. `row_hint` is the ledger row the
/// value was picked from, when known; it is re-verified before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_hint: Option<usize>,
}

impl FilterValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            row_hint: None,
        }
    }

    pub fn with_hint(value: impl Into<String>, row: usize) -> Self {
        Self {
            value: value.into(),
            row_hint: Some(row),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Ordered (column, value) pairs. The entry at index 1 is the discriminating key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChain {
    entries: Vec<(String, FilterValue)>,
}

pub const DISCRIMINATING_INDEX: usize = 1;

impl FilterChain {
    pub fn new(entries: Vec<(String, FilterValue)>) -> Self {
        Self { entries }
    }

    pub fn from_columns(columns: &[String], values: &[FilterValue]) -> Self {
        Self::new(
            columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect(),
        )
    }

    pub fn entries(&self) -> &[(String, FilterValue)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn discriminating(&self) -> Option<&(String, FilterValue)> {
        self.entries.get(DISCRIMINATING_INDEX)
    }

    pub fn columns(&self) -> Vec<String> {
        self.entries.iter().map(|(column, _)| column.clone()).collect()
    }

    pub fn values(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(_, value)| value.value.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub source_path: PathBuf,
    pub filters: Vec<FilterValue>,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Resolved ledger row; `None` until resolution succeeds.
    #[serde(default)]
    pub row: Option<usize>,
    #[serde(default)]
    pub created_row: bool,
    #[serde(default)]
    pub link_column: Option<String>,
    /// Back-reference state of the linked cell before this task wrote to it.
    #[serde(default)]
    pub previous_link: Option<LinkSnapshot>,
    /// Back-reference text this task wrote.
    #[serde(default)]
    pub back_reference: Option<String>,
    #[serde(default)]
    pub original_location: Option<PathBuf>,
    #[serde(default)]
    pub filed_location: Option<PathBuf>,
    #[serde(default)]
    pub displaced_location: Option<PathBuf>,
    #[serde(default)]
    pub renamed_source: Option<PathBuf>,
    /// What became of the source once the filed copy was in place.
    #[serde(default)]
    pub source_disposition: Option<SourceDisposition>,
    #[serde(default)]
    pub source_hash: Option<String>,
    #[serde(default)]
    pub rotation: Option<i32>,
    #[serde(default)]
    pub skip_mode: Option<SkipMode>,
    #[serde(default)]
    pub hidden: bool,
}

impl Task {
    pub fn new(source_path: impl Into<PathBuf>, filters: Vec<FilterValue>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path: source_path.into(),
            filters,
            status: TaskStatus::Pending,
            error: None,
            warnings: Vec::new(),
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            row: None,
            created_row: false,
            link_column: None,
            previous_link: None,
            back_reference: None,
            original_location: None,
            filed_location: None,
            displaced_location: None,
            renamed_source: None,
            source_disposition: None,
            source_hash: None,
            rotation: None,
            skip_mode: None,
            hidden: false,
        }
    }

    pub fn with_rotation(mut self, angle: i32) -> Self {
        self.rotation = Some(angle);
        self
    }

    /// Caller-selected row for the whole chain, used as the resolution fast path.
    pub fn with_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn can_revert(&self) -> bool {
        self.status == TaskStatus::Completed
            && self.row.is_some()
            && self.link_column.is_some()
            && self.previous_link.is_some()
            && self.original_location.is_some()
            && self.filed_location.is_some()
    }

    pub fn is_source(&self, path: &Path) -> bool {
        self.source_path == path
    }

    /// Clear everything a previous attempt recorded, keeping identity and inputs.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.error = None;
        self.warnings.clear();
        self.started_at = None;
        self.finished_at = None;
        self.link_column = None;
        self.previous_link = None;
        self.back_reference = None;
        self.filed_location = None;
        self.displaced_location = None;
        self.renamed_source = None;
        self.source_disposition = None;
        self.source_hash = None;
        self.created_row = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_exposes_discriminating_entry() {
        let columns = vec!["Supplier".to_string(), "Number".to_string()];
        let chain = FilterChain::from_columns(
            &columns,
            &[FilterValue::new("Acme Co"), FilterValue::with_hint("INV-001", 4)],
        );
        let (column, value) = chain.discriminating().expect("discriminating");
        assert_eq!(column, "Number");
        assert_eq!(value.row_hint, Some(4));
        assert_eq!(chain.values(), vec!["Acme Co", "INV-001"]);
    }

    #[test]
    fn new_task_is_pending_and_not_revertible() {
        let task = Task::new("/in/a.pdf", vec!["x".into(), "y".into()]);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.can_revert());
        assert_eq!(task.file_name(), "a.pdf");
    }

    #[test]
    fn task_roundtrips_through_journal_json() {
        let mut task = Task::new("/in/a.pdf", vec![FilterValue::with_hint("INV-1", 2)]);
        task.status = TaskStatus::Failed;
        task.error = Some("boom".into());
        let raw = serde_json::to_string(&task).expect("serialize");
        assert!(raw.contains("\"status\":\"failed\""));
        let back: Task = serde_json::from_str(&raw).expect("parse");
        assert_eq!(back.id, task.id);
        assert_eq!(back.filters[0].row_hint, Some(2));
    }

    #[test]
    fn source_disposition_survives_the_journal() {
        let mut task = Task::new("/in/a.pdf", vec!["x".into(), "y".into()]);
        task.source_disposition = Some(SourceDisposition::Renamed("/in/a.processed.pdf".into()));
        let raw = serde_json::to_string(&task).expect("serialize");
        assert!(raw.contains("\"renamed\""));
        let back: Task = serde_json::from_str(&raw).expect("parse");
        assert_eq!(back.source_disposition, task.source_disposition);

        task.source_disposition = Some(SourceDisposition::Tracked);
        let raw = serde_json::to_string(&task).expect("serialize");
        assert!(raw.contains("\"source_disposition\":\"tracked\""));
    }
}
