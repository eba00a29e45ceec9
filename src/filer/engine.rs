//! Task engine.
//!
//! One named worker thread drains a FIFO queue of task ids. Callers insert
//! tasks and read snapshots of the task book from any thread; only the worker
//! moves a task through `processing`. Stop requests are honoured between
//! tasks, never in the middle of one.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::FilingError;
use crate::filer::config::{ConfigHandle, FilerConfig};
use crate::filer::events::{EngineEvent, EventBus};
use crate::filer::mover::{DocumentMover, SourceDisposition};
use crate::filer::record_store::{RecordStore, RowData, ResolvedVia, Resolution};
use crate::filer::task::{FilterChain, SkipMode, Task, TaskId, TaskStatus};
use crate::filer::template::{AttrValue, Attributes};
use crate::filer::values::parse_date;
use crate::filer::warn::{self as filer_warn, WarnEvent};
use crate::filer::workbook::CellValue;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    #[error("task {id} is {status}, expected {expected}")]
    InvalidState {
        id: TaskId,
        status: &'static str,
        expected: &'static str,
    },
    #[error("task {0} has no revert information recorded")]
    NotRevertible(TaskId),
    #[error("{0} is already queued or being filed")]
    DocumentBusy(PathBuf),
    #[error("revert of task {id} incomplete: {details}")]
    PartialRevert { id: TaskId, details: String },
    #[error("failed to start worker: {0}")]
    Spawn(String),
    #[error(transparent)]
    Filing(#[from] FilingError),
}

/// Collaborators the engine drives. Constructed once by the caller.
#[derive(Clone)]
pub struct EngineParts {
    pub config: Arc<ConfigHandle>,
    pub store: Arc<RecordStore>,
    pub mover: Arc<DocumentMover>,
    pub events: Arc<EventBus>,
}

#[derive(Default)]
struct TaskBook {
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, Task>,
}

impl TaskBook {
    fn insert(&mut self, task: Task) {
        if !self.tasks.contains_key(&task.id) {
            self.order.push(task.id);
        }
        self.tasks.insert(task.id, task);
    }

    fn in_order(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<TaskId>,
    busy: bool,
}

struct Shared {
    parts: EngineParts,
    book: RwLock<TaskBook>,
    queue: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
    stop: AtomicBool,
    idle_poll: Duration,
}

pub struct TaskEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock_queue(shared: &Shared) -> MutexGuard<'_, QueueState> {
    shared.queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Template attributes for one task: filter values (by position and by
/// column), the row's own cells, parsed dates, and the filing context.
pub fn build_attributes(
    chain: &FilterChain,
    row: &RowData,
    cfg: &FilerConfig,
    now: NaiveDateTime,
) -> Attributes {
    let mut attrs = Attributes::new();
    for (idx, (column, value)) in chain.entries().iter().enumerate() {
        let n = idx + 1;
        let text = value.value.trim().to_string();
        let date = parse_date(&text);
        attrs.insert(format!("filter{n}"), AttrValue::Text(text.clone()));
        attrs.insert(column.clone(), AttrValue::Text(text));
        if let Some(date) = date {
            attrs.insert(format!("filter{n}_date"), AttrValue::Date(date));
            attrs.insert(format!("{column}_date"), AttrValue::Date(date));
        }
    }

    for (column, cell) in &row.cells {
        if column.is_empty() || attrs.contains_key(column) {
            continue;
        }
        let value = match cell {
            CellValue::Empty => AttrValue::Empty,
            CellValue::Text(text) => AttrValue::Text(text.clone()),
            CellValue::Number(n) => AttrValue::Number(*n),
            CellValue::Date(date) => AttrValue::Date(*date),
        };
        let date = match cell {
            CellValue::Date(date) => Some(*date),
            CellValue::Text(text) => parse_date(text),
            _ => None,
        };
        attrs.insert(column.clone(), value);
        if let Some(date) = date {
            attrs
                .entry(format!("{column}_date"))
                .or_insert(AttrValue::Date(date));
        }
    }

    attrs.insert("current_date".into(), AttrValue::DateTime(now));
    attrs.insert(
        "processed_folder".into(),
        AttrValue::Path(cfg.processed_folder.clone()),
    );
    attrs
}

impl Shared {
    fn publish(&self, event: EngineEvent) {
        self.parts.events.publish(event);
    }

    fn worker_loop(&self) {
        info!("filing worker started");
        loop {
            let next = {
                let mut queue = lock_queue(self);
                loop {
                    if self.stop.load(Ordering::SeqCst) {
                        queue.busy = false;
                        self.idle.notify_all();
                        info!("filing worker stopped");
                        return;
                    }
                    if let Some(id) = queue.pending.pop_front() {
                        queue.busy = true;
                        break id;
                    }
                    if queue.busy {
                        queue.busy = false;
                        self.idle.notify_all();
                    }
                    let (guard, _) = self
                        .wake
                        .wait_timeout(queue, self.idle_poll)
                        .unwrap_or_else(PoisonError::into_inner);
                    queue = guard;
                }
            };
            self.run_task(next);
        }
    }

    fn run_task(&self, id: TaskId) {
        let claimed = {
            let mut book = self.book.write().unwrap_or_else(PoisonError::into_inner);
            match book.tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::Processing;
                    task.started_at = Some(Utc::now());
                    Some(task.clone())
                }
                _ => None,
            }
        };
        let Some(mut working) = claimed else {
            debug!(task = %id, "queued task no longer pending; dropped");
            return;
        };
        self.publish(EngineEvent::TaskStarted { task_id: id });
        info!(task = %id, source = %working.source_path.display(), "filing document");

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.process(&mut working)));
        working.finished_at = Some(Utc::now());
        let event = match result {
            Ok(Ok(())) => {
                working.status = TaskStatus::Completed;
                working.error = None;
                info!(
                    task = %id,
                    filed = %working
                        .filed_location
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    "document filed"
                );
                EngineEvent::TaskCompleted {
                    task_id: id,
                    status: TaskStatus::Completed,
                }
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                error!(task = %id, code = err.code().as_str(), error = %message, "filing failed");
                working.status = TaskStatus::Failed;
                working.error = Some(message.clone());
                EngineEvent::TaskFailed {
                    task_id: id,
                    error: message,
                }
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let message = format!("worker panicked: {reason}");
                error!(task = %id, error = %message, "filing aborted");
                working.status = TaskStatus::Failed;
                working.error = Some(message.clone());
                EngineEvent::TaskFailed {
                    task_id: id,
                    error: message,
                }
            }
        };

        self.book
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(working);
        self.publish(event);
    }

    fn process(&self, task: &mut Task) -> Result<(), FilingError> {
        let cfg = self.parts.config.current();
        let store = &self.parts.store;
        let mover = &self.parts.mover;

        cfg.require_for_filing()?;
        if !task.source_path.is_file() {
            return Err(FilingError::file_io(
                &task.source_path,
                "source document does not exist",
            ));
        }

        let ledger = PathBuf::from(&cfg.ledger_file);
        store.load(&ledger, &cfg.ledger_sheet, false)?;

        if task.filters.len() < 2 {
            return Err(FilingError::Config(format!(
                "task carries {} filter value(s); at least 2 are required",
                task.filters.len()
            )));
        }
        if task.filters.len() > cfg.filter_columns.len() {
            return Err(FilingError::Config(format!(
                "filter{}_column is not configured",
                cfg.filter_columns.len() + 1
            )));
        }
        let chain = FilterChain::from_columns(&cfg.filter_columns, &task.filters);
        let row = match store.resolve(&chain, task.row)? {
            Resolution::Found { row, via } => {
                if let ResolvedVia::FirstOfAmbiguous { candidates } = via {
                    task.warnings.push(format!(
                        "{candidates} ledger rows matched; used the first (row {row})"
                    ));
                }
                row
            }
            Resolution::Missing => {
                let (_, idx) = store.add_row(&chain.columns(), &chain.values())?;
                task.created_row = true;
                idx
            }
        };
        task.row = Some(row);

        let validation = store.validate_row(row, &chain)?;
        if !validation.unfilled.is_empty() {
            debug!(row, columns = ?validation.unfilled, "ledger cells empty; nothing to compare");
        }

        let row_data = store
            .row(row)
            .ok_or_else(|| FilingError::load(&ledger, format!("row {row} vanished from cache")))?;
        let attrs = build_attributes(&chain, &row_data, &cfg, Local::now().naive_local());

        let extension = task
            .source_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| cfg.document_extension.clone());
        let destination = mover.destination_for(
            &cfg.output_template,
            &attrs,
            Path::new(&cfg.processed_folder),
            &extension,
        );
        if let Some(reason) = &destination.fallback_reason {
            task.warnings
                .push(format!("used fallback destination: {reason}"));
        }

        let link_column = cfg
            .effective_link_column()
            .unwrap_or_default()
            .to_string();
        let link = match store.link_document(row, &link_column, &destination.path) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                let task_id = task.id.to_string();
                let document = task.source_path.display().to_string();
                let err_text = err.to_string();
                filer_warn::emit(WarnEvent {
                    code: err.code().as_str(),
                    stage: "link",
                    action: "continue",
                    task: &task_id,
                    document: &document,
                    reason: "back_reference_not_written",
                    err: &err_text,
                    ..WarnEvent::default()
                });
                task.warnings
                    .push(format!("back-reference not written: {err_text}"));
                None
            }
        };

        task.original_location = Some(task.source_path.clone());
        match mover.commit_to(task, &destination.path) {
            Ok(outcome) => {
                task.filed_location = Some(outcome.final_path);
                task.displaced_location = outcome.displaced;
                if let SourceDisposition::Renamed(renamed) = &outcome.disposition {
                    task.renamed_source = Some(renamed.clone());
                }
                task.source_disposition = Some(outcome.disposition);
                task.source_hash = outcome.source_hash;
                task.warnings.extend(outcome.warnings);
                if let Some(link) = link {
                    task.link_column = Some(link_column);
                    task.previous_link = Some(link.previous);
                    task.back_reference = Some(link.link);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(link) = link {
                    if let Err(rollback) = store.revert(row, &link_column, &link.previous) {
                        error!(row, error = %rollback, "failed to roll back back-reference");
                    }
                }
                Err(err)
            }
        }
    }
}

impl TaskEngine {
    /// Start the worker. `restored` tasks come from a previous run: pending
    /// ones are queued again, interrupted ones are marked failed.
    pub fn start(parts: EngineParts, restored: Vec<Task>) -> Result<Self, EngineError> {
        let idle_poll = Duration::from_millis(parts.config.current().worker.idle_poll_ms.max(1));
        let mut book = TaskBook::default();
        let mut queue = QueueState::default();
        for mut task in restored {
            match task.status {
                TaskStatus::Processing => {
                    task.status = TaskStatus::Failed;
                    task.error = Some("interrupted before completion".into());
                }
                TaskStatus::Pending => queue.pending.push_back(task.id),
                _ => {}
            }
            book.insert(task);
        }

        let shared = Arc::new(Shared {
            parts,
            book: RwLock::new(book),
            queue: Mutex::new(queue),
            wake: Condvar::new(),
            idle: Condvar::new(),
            stop: AtomicBool::new(false),
            idle_poll,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("docfiler-worker".into())
            .spawn(move || worker_shared.worker_loop())
            .map_err(|err| EngineError::Spawn(err.to_string()))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.shared.parts.events.subscribe()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.shared.parts.store
    }

    pub fn enqueue(&self, mut task: Task) -> TaskId {
        task.status = TaskStatus::Pending;
        let id = task.id;
        self.shared
            .book
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task);
        self.push_queue(id);
        debug!(task = %id, "task queued");
        id
    }

    fn push_queue(&self, id: TaskId) {
        lock_queue(&self.shared).pending.push_back(id);
        self.shared.wake.notify_all();
    }

    /// Visible tasks in the order they were created.
    pub fn tasks(&self) -> Vec<Task> {
        self.shared
            .book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .in_order()
            .filter(|task| !task.hidden)
            .cloned()
            .collect()
    }

    /// Every task, including those dismissed from view.
    pub fn journal(&self) -> Vec<Task> {
        self.shared
            .book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .in_order()
            .cloned()
            .collect()
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.shared
            .book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .get(&id)
            .cloned()
    }

    /// Find a task by id or unique id prefix.
    pub fn find(&self, prefix: &str) -> Option<TaskId> {
        let book = self.shared.book.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits = book
            .order
            .iter()
            .filter(|id| id.to_string().starts_with(prefix.trim()));
        match (hits.next(), hits.next()) {
            (Some(id), None) => Some(*id),
            _ => None,
        }
    }

    pub fn retry(&self, id: TaskId) -> Result<(), EngineError> {
        {
            let mut book = self.shared.book.write().unwrap_or_else(PoisonError::into_inner);
            let task = book.tasks.get_mut(&id).ok_or(EngineError::UnknownTask(id))?;
            if task.status != TaskStatus::Failed {
                return Err(EngineError::InvalidState {
                    id,
                    status: task.status.as_str(),
                    expected: TaskStatus::Failed.as_str(),
                });
            }
            task.reset_for_retry();
        }
        self.push_queue(id);
        info!(task = %id, "task queued for retry");
        Ok(())
    }

    pub fn retry_failed(&self) -> usize {
        let failed: Vec<TaskId> = self
            .tasks()
            .into_iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .map(|task| task.id)
            .collect();
        failed
            .into_iter()
            .filter(|id| self.retry(*id).is_ok())
            .count()
    }

    /// Undo a completed task: restore the back-reference, then the document.
    pub fn revert(&self, id: TaskId) -> Result<(), EngineError> {
        let task = self.task(id).ok_or(EngineError::UnknownTask(id))?;
        if task.status != TaskStatus::Completed {
            return Err(EngineError::InvalidState {
                id,
                status: task.status.as_str(),
                expected: TaskStatus::Completed.as_str(),
            });
        }
        let (Some(row), Some(column), Some(snapshot)) =
            (task.row, task.link_column.as_deref(), task.previous_link.as_ref())
        else {
            return Err(EngineError::NotRevertible(id));
        };
        if !task.can_revert() {
            return Err(EngineError::NotRevertible(id));
        }

        let cfg = self.shared.parts.config.current();
        let store = &self.shared.parts.store;
        let chain = FilterChain::from_columns(&cfg.filter_columns, &task.filters);
        let ledger_result = store
            .load(Path::new(&cfg.ledger_file), &cfg.ledger_sheet, false)
            .and_then(|_| {
                store.locate_linked_row(&chain, row, column, task.back_reference.as_deref())
            })
            .and_then(|located| {
                let current = located.ok_or_else(|| FilingError::Link {
                    row,
                    column: column.to_string(),
                    message: "no ledger row with this task's key carries its back-reference".into(),
                })?;
                if current != row {
                    info!(task = %id, filed_row = row, current_row = current, "ledger row moved since filing");
                }
                store.revert(current, column, snapshot).map(|_| current)
            });
        let document_result = self.shared.parts.mover.revert(&task);

        let mut failures = Vec::new();
        if let Err(err) = &ledger_result {
            failures.push(format!("ledger: {err}"));
        }
        if let Err(err) = &document_result {
            failures.push(format!("document: {err}"));
        }

        {
            let mut book = self.shared.book.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(stored) = book.tasks.get_mut(&id) {
                if let Ok(current) = &ledger_result {
                    stored.row = Some(*current);
                }
                if let Ok(restored) = &document_result {
                    if Some(restored.as_path()) != task.original_location.as_deref() {
                        stored.warnings.push(format!(
                            "original location was taken; document restored to {}",
                            restored.display()
                        ));
                    }
                }
                if failures.is_empty() {
                    stored.status = TaskStatus::Reverted;
                    stored.finished_at = Some(Utc::now());
                } else {
                    stored.warnings.extend(failures.iter().cloned());
                }
            }
        }

        if !failures.is_empty() {
            return Err(EngineError::PartialRevert {
                id,
                details: failures.join("; "),
            });
        }
        self.shared.publish(EngineEvent::TaskCompleted {
            task_id: id,
            status: TaskStatus::Reverted,
        });
        info!(task = %id, "task reverted");
        Ok(())
    }

    fn is_active_source(&self, path: &Path) -> bool {
        self.shared
            .book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .values()
            .any(|task| {
                task.is_source(path)
                    && matches!(task.status, TaskStatus::Pending | TaskStatus::Processing)
            })
    }

    /// Set a document aside without filing it; records a `skipped` task.
    pub fn skip(&self, path: &Path, mode: SkipMode) -> Result<TaskId, EngineError> {
        if self.is_active_source(path) {
            return Err(EngineError::DocumentBusy(path.to_path_buf()));
        }
        let cfg = self.shared.parts.config.current();
        let skip_folder = PathBuf::from(&cfg.skip_folder);
        let outcome = self.shared.parts.mover.skip(
            path,
            mode,
            (!cfg.skip_folder.trim().is_empty()).then_some(skip_folder.as_path()),
        )?;

        let mut task = Task::new(path, Vec::new());
        task.status = TaskStatus::Skipped;
        task.skip_mode = Some(mode);
        task.original_location = Some(path.to_path_buf());
        task.filed_location = outcome.moved_to;
        task.finished_at = Some(Utc::now());
        let id = task.id;
        self.shared
            .book
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task);
        self.shared.publish(EngineEvent::TaskCompleted {
            task_id: id,
            status: TaskStatus::Skipped,
        });
        Ok(id)
    }

    /// Next document in the source folder that nobody is working on.
    pub fn next_document(&self) -> Result<Option<PathBuf>, EngineError> {
        let cfg = self.shared.parts.config.current();
        if cfg.source_folder.trim().is_empty() {
            return Err(FilingError::Config("missing source_folder".into()).into());
        }
        let active: Vec<PathBuf> = self
            .shared
            .book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .values()
            .filter(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::Processing))
            .map(|task| task.source_path.clone())
            .collect();
        Ok(self.shared.parts.mover.next_document(
            Path::new(&cfg.source_folder),
            &cfg.document_extension,
            &active,
        )?)
    }

    /// Hide finished tasks from `tasks()`. They stay in the journal.
    pub fn dismiss_completed(&self) -> usize {
        let mut book = self.shared.book.write().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for task in book.tasks.values_mut() {
            if !task.hidden
                && matches!(
                    task.status,
                    TaskStatus::Completed | TaskStatus::Reverted | TaskStatus::Skipped
                )
            {
                task.hidden = true;
                count += 1;
            }
        }
        count
    }

    pub fn processed_sources(&self) -> Vec<PathBuf> {
        self.shared.parts.mover.processed_sources()
    }

    /// Block until the queue is drained and the worker is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = lock_queue(&self.shared);
        while !queue.pending.is_empty() || queue.busy {
            if self.shared.stop.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .idle
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
        true
    }

    /// Ask the worker to exit after the current task and wait for it.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("filing worker exited abnormally");
            }
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
