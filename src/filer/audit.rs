use crate::filer::paths::FilerPaths;
use crate::filer::task::Task;
use crate::filer::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub phase: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
}

fn append(paths: &FilerPaths, event: &AuditEvent) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let line = format!("{}\n", serde_json::to_string(event)?);
    let path = paths.logs_dir.join("audit.log");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

pub fn append_event(paths: &FilerPaths, phase: &str, status: &str, message: &str) -> Result<()> {
    append(
        paths,
        &AuditEvent {
            at_epoch_secs: now_epoch_secs()?,
            phase: phase.to_string(),
            status: status.to_string(),
            task_id: None,
            message: message.to_string(),
        },
    )
}

/// Record where a task ended up.
pub fn append_task_event(paths: &FilerPaths, phase: &str, task: &Task) -> Result<()> {
    let message = match (&task.error, &task.filed_location) {
        (Some(err), _) => err.clone(),
        (None, Some(filed)) => format!("{} -> {}", task.source_path.display(), filed.display()),
        (None, None) => task.source_path.display().to_string(),
    };
    append(
        paths,
        &AuditEvent {
            at_epoch_secs: now_epoch_secs()?,
            phase: phase.to_string(),
            status: task.status.as_str().to_string(),
            task_id: Some(task.id.to_string()),
            message,
        },
    )
}
