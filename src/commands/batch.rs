use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use tracing::info;

use crate::commands::{CommandReport, Session, WAIT_LIMIT, report_task};
use crate::filer::task::{FilterValue, Task};

/// One manifest entry. Relative paths resolve against the manifest's folder.
#[derive(Debug, Deserialize)]
struct BatchEntry {
    path: PathBuf,
    filters: Vec<String>,
    #[serde(default)]
    row: Option<usize>,
    #[serde(default)]
    rotation: Option<i32>,
}

fn read_manifest(manifest: &Path) -> Result<Vec<BatchEntry>> {
    let raw = fs::read_to_string(manifest)
        .with_context(|| format!("failed to read {}", manifest.display()))?;
    let entries: Vec<BatchEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", manifest.display()))?;
    Ok(entries)
}

pub fn run(config: Option<&Path>, manifest: &Path) -> Result<CommandReport> {
    let mut report = CommandReport::new("batch");
    let entries = read_manifest(manifest)?;
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));
    let session = Session::open(config)?;
    let events = session.engine.subscribe();

    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = if entry.path.is_absolute() {
            entry.path
        } else {
            base.join(entry.path)
        };
        let filters = entry.filters.into_iter().map(FilterValue::new).collect();
        let mut task = Task::new(path, filters);
        if let Some(row) = entry.row {
            task = task.with_row(row);
        }
        if let Some(angle) = entry.rotation {
            task = task.with_rotation(angle);
        }
        ids.push(session.engine.enqueue(task));
    }
    report.detail(format!("queued={}", ids.len()));

    let mut finished = 0usize;
    while finished < ids.len() {
        let Ok(event) = events.recv_timeout(WAIT_LIMIT) else {
            break;
        };
        let ours = event.task_id().is_some_and(|id| ids.contains(&id));
        if ours && event.is_terminal() {
            finished += 1;
            info!(done = finished, total = ids.len(), "batch progress");
        }
    }

    if session.drain(&mut report) {
        for id in ids {
            if let Some(task) = session.engine.task(id) {
                report_task(&mut report, &task);
            }
        }
    }
    session.close("batch")?;
    Ok(report)
}
