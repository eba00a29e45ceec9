pub mod batch;
pub mod file;
pub mod links;
pub mod next;
pub mod render;
pub mod retry;
pub mod revert;
pub mod sheets;
pub mod skip;
pub mod status;
pub mod tasks;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::filer::audit;
use crate::filer::config::{ConfigHandle, FilerConfig, load_config_from};
use crate::filer::engine::{EngineParts, TaskEngine};
use crate::filer::events::EventBus;
use crate::filer::mover::{DocumentMover, HandleRegistry, MoverSettings};
use crate::filer::paths::{FilerPaths, resolve_paths};
use crate::filer::record_store::RecordStore;
use crate::filer::state::{self, FilerState, SessionLock};
use crate::filer::task::{Task, TaskId, TaskStatus};
use crate::filer::util::truncate_with_ellipsis;

/// Longest a command waits for the worker to drain its queue.
pub const WAIT_LIMIT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

pub fn config_path(paths: &FilerPaths, override_path: Option<&Path>) -> PathBuf {
    override_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| paths.config_file.clone())
}

pub fn load_config(paths: &FilerPaths, override_path: Option<&Path>) -> Result<FilerConfig> {
    let path = config_path(paths, override_path);
    load_config_from(&path).with_context(|| format!("failed to load {}", path.display()))
}

/// An engine restored from the journal, saved back on close. Holds the
/// session lock for its whole life.
pub struct Session {
    pub paths: FilerPaths,
    pub engine: TaskEngine,
    seen: HashMap<TaskId, TaskStatus>,
    _lock: SessionLock,
}

impl Session {
    pub fn open(override_path: Option<&Path>) -> Result<Self> {
        let paths = resolve_paths()?;
        let cfg = load_config(&paths, override_path)?;
        let lock = SessionLock::acquire(&paths)?;
        let saved = state::load(&paths)?;
        let seen = saved
            .tasks
            .iter()
            .map(|task| (task.id, task.status))
            .collect();

        let events = Arc::new(EventBus::new());
        let mover = DocumentMover::new(
            MoverSettings {
                removal_attempts: cfg.worker.removal_attempts,
                removal_delay: cfg.removal_delay(),
            },
            Arc::new(HandleRegistry::default()),
        );
        mover.seed_processed(saved.processed_sources);
        let parts = EngineParts {
            config: Arc::new(ConfigHandle::new(cfg, Arc::clone(&events))),
            store: Arc::new(RecordStore::new()),
            mover: Arc::new(mover),
            events,
        };
        let engine = TaskEngine::start(parts, saved.tasks)?;
        Ok(Self {
            paths,
            engine,
            seen,
            _lock: lock,
        })
    }

    /// Wait for queued work, reporting a timeout as an issue.
    pub fn drain(&self, report: &mut CommandReport) -> bool {
        if self.engine.wait_idle(WAIT_LIMIT) {
            return true;
        }
        report.issue(format!(
            "worker still busy after {}s; remaining tasks stay queued",
            WAIT_LIMIT.as_secs()
        ));
        false
    }

    /// Stop the worker, audit status changes and persist the journal.
    pub fn close(self, phase: &str) -> Result<()> {
        self.engine.stop();
        let journal = self.engine.journal();
        for task in &journal {
            if self.seen.get(&task.id) == Some(&task.status) {
                continue;
            }
            if let Err(err) = audit::append_task_event(&self.paths, phase, task) {
                warn!(task = %task.id, error = %err, "failed to write audit event");
            }
        }
        let state = FilerState {
            last_saved_epoch_secs: crate::filer::util::now_epoch_secs()?,
            processed_sources: self.engine.processed_sources().into_iter().collect(),
            tasks: journal,
            ..FilerState::default()
        };
        state::save(&self.paths, &state)?;
        Ok(())
    }
}

/// One report line summarizing a task.
pub fn describe_task(task: &Task) -> String {
    let mut line = format!(
        "{} {} {}",
        task.id,
        task.status.as_str(),
        task.source_path.display()
    );
    if let Some(filed) = &task.filed_location {
        line.push_str(&format!(" -> {}", filed.display()));
    }
    if let Some(row) = task.row {
        line.push_str(&format!(" row={row}"));
    }
    if let Some(err) = &task.error {
        line.push_str(&format!(" error={}", truncate_with_ellipsis(err, 160)));
    }
    line
}

/// Add a finished task to the report: details for success, issues for failure.
pub fn report_task(report: &mut CommandReport, task: &Task) {
    if task.status == TaskStatus::Failed || !task.status.is_terminal() {
        report.issue(describe_task(task));
    } else {
        report.detail(describe_task(task));
    }
    for warning in &task.warnings {
        report.detail(format!("warning: {warning}"));
    }
}
