//! Crash-safe relocation of documents.
//!
//! A commit never mutates the source until the destination holds a complete
//! copy: the document is staged in a temp dir, optionally rotated there, then
//! persisted into the destination directory. Removing the source comes last
//! and may degrade to a tracked rename when the file stays locked.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::FilingError;
use crate::filer::task::{SkipMode, Task};
use crate::filer::template::{self, Attributes};
use crate::filer::{rotate, warn as filer_warn};

pub type RemoveFn = fn(&Path) -> io::Result<()>;

/// Open document handles held inside this process, e.g. by a preview.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    open: Mutex<HashMap<PathBuf, File>>,
}

impl HandleRegistry {
    pub fn open(&self, path: &Path) -> io::Result<()> {
        let file = File::open(path)?;
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), file);
        Ok(())
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    /// Drop the handle on `path`, if any. Returns whether one was held.
    pub fn release(&self, path: &Path) -> bool {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }
}

#[derive(Debug, Clone)]
pub struct MoverSettings {
    pub removal_attempts: u32,
    pub removal_delay: Duration,
}

impl Default for MoverSettings {
    fn default() -> Self {
        Self {
            removal_attempts: 3,
            removal_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDisposition {
    Removed,
    /// Removal kept failing; the source now carries a processed suffix.
    Renamed(PathBuf),
    /// Neither removal nor rename worked; only the tracking set knows.
    Tracked,
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub path: PathBuf,
    /// Why the template could not be used, when the fallback name was taken.
    pub fallback_reason: Option<FilingError>,
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub final_path: PathBuf,
    pub displaced: Option<PathBuf>,
    pub disposition: SourceDisposition,
    /// SHA-256 of the source as it was committed.
    pub source_hash: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipOutcome {
    pub moved_to: Option<PathBuf>,
}

pub struct DocumentMover {
    settings: MoverSettings,
    handles: Arc<HandleRegistry>,
    processed: RwLock<BTreeSet<PathBuf>>,
    remove_source: RemoveFn,
}

fn remove_file(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn file_hash(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn split_name(path: &Path) -> (String, Option<String>) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (stem, ext)
}

fn with_ext(stem: &str, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}

pub fn is_processed_name(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let name = n.to_string_lossy();
            name.contains(".processed.") || name.contains(".processed-")
        })
        .unwrap_or(false)
}

fn processed_name(source: &Path) -> PathBuf {
    let (stem, ext) = split_name(source);
    let plain = source.with_file_name(with_ext(&format!("{stem}.processed"), ext.as_deref()));
    if !plain.exists() {
        return plain;
    }
    source.with_file_name(with_ext(
        &format!("{stem}.processed-{}", timestamp()),
        ext.as_deref(),
    ))
}

/// A free name next to `taken` for a document that cannot go back there.
fn restored_name(taken: &Path) -> PathBuf {
    let (stem, ext) = split_name(taken);
    let base = format!("{stem}_restored_{}", timestamp());
    let mut candidate = taken.with_file_name(with_ext(&base, ext.as_deref()));
    let mut n = 1;
    while candidate.exists() {
        candidate = taken.with_file_name(with_ext(&format!("{base}_{n}"), ext.as_deref()));
        n += 1;
    }
    candidate
}

fn versioned_name(existing: &Path) -> PathBuf {
    let name = existing
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    existing.with_file_name(format!("old_{}_{name}", timestamp()))
}

/// Rename `from` to `to`, falling back to copy + remove across devices.
fn move_file(from: &Path, to: &Path) -> anyhow::Result<()> {
    if from == to {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    match fs::rename(from, to) {
        Ok(_) => Ok(()),
        Err(rename_err) => {
            if matches!(
                rename_err.kind(),
                ErrorKind::CrossesDevices | ErrorKind::PermissionDenied
            ) {
                fs::copy(from, to).with_context(|| {
                    format!("failed to copy {} to {}", from.display(), to.display())
                })?;
                fs::remove_file(from)
                    .with_context(|| format!("failed to remove {}", from.display()))?;
                Ok(())
            } else {
                Err(rename_err).with_context(|| {
                    format!("failed to move {} to {}", from.display(), to.display())
                })
            }
        }
    }
}

/// Copy `from` into `to` through a temp file in `to`'s directory.
fn persist_copy(from: &Path, to: &Path) -> anyhow::Result<()> {
    let parent = to
        .parent()
        .with_context(|| format!("{} has no parent directory", to.display()))?;
    let mut reader =
        File::open(from).with_context(|| format!("failed to open {}", from.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage in {}", parent.display()))?;
    io::copy(&mut reader, tmp.as_file_mut())
        .with_context(|| format!("failed to copy {}", from.display()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(to)
        .map_err(|err| anyhow::anyhow!("failed to persist {}: {}", to.display(), err.error))?;
    Ok(())
}

impl DocumentMover {
    pub fn new(settings: MoverSettings, handles: Arc<HandleRegistry>) -> Self {
        Self {
            settings,
            handles,
            processed: RwLock::new(BTreeSet::new()),
            remove_source: remove_file,
        }
    }

    /// Replace the function used to delete committed sources.
    pub fn with_remover(mut self, remove: RemoveFn) -> Self {
        self.remove_source = remove;
        self
    }

    pub fn seed_processed(&self, paths: impl IntoIterator<Item = PathBuf>) {
        self.processed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(paths);
    }

    pub fn mark_processed(&self, path: &Path) {
        self.processed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf());
    }

    pub fn unmark_processed(&self, path: &Path) {
        self.processed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    pub fn is_processed(&self, path: &Path) -> bool {
        self.processed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    pub fn processed_sources(&self) -> Vec<PathBuf> {
        self.processed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Render where a document should land, falling back to a timestamped
    /// name under `root` when the template cannot be rendered.
    pub fn destination_for(
        &self,
        template_text: &str,
        attributes: &Attributes,
        root: &Path,
        extension: &str,
    ) -> Destination {
        match template::render(template_text, attributes) {
            Ok(rendered) => {
                let path = PathBuf::from(rendered);
                let path = if path.is_absolute() { path } else { root.join(path) };
                Destination {
                    path,
                    fallback_reason: None,
                }
            }
            Err(err) => {
                let path = root.join(template::fallback_file_name(extension));
                filer_warn::emit(filer_warn::WarnEvent {
                    code: "TEMPLATE_FALLBACK",
                    stage: "render",
                    action: "fallback",
                    document: &path.display().to_string(),
                    reason: "template_render_failed",
                    err: &err.to_string(),
                    ..Default::default()
                });
                Destination {
                    path,
                    fallback_reason: Some(err),
                }
            }
        }
    }

    /// Render the destination and commit the task's document there.
    pub fn commit(
        &self,
        task: &Task,
        attributes: &Attributes,
        root: &Path,
        template_text: &str,
    ) -> Result<CommitOutcome, FilingError> {
        let extension = task
            .source_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let destination = self.destination_for(template_text, attributes, root, &extension);
        let mut outcome = self.commit_to(task, &destination.path)?;
        if let Some(reason) = destination.fallback_reason {
            outcome.warnings.push(format!("used fallback destination: {reason}"));
        }
        Ok(outcome)
    }

    /// Copy the task's document to `destination` and retire the source.
    pub fn commit_to(&self, task: &Task, destination: &Path) -> Result<CommitOutcome, FilingError> {
        let source = task.source_path.as_path();
        if !source.is_file() {
            return Err(FilingError::file_io(source, "source document does not exist"));
        }
        if self.handles.release(source) {
            debug!(source = %source.display(), "released open handle before commit");
        }
        let source_hash = file_hash(source).ok();
        let same_file = destination == source
            || (destination.exists()
                && fs::canonicalize(destination).ok() == fs::canonicalize(source).ok());
        if same_file {
            return Err(FilingError::file_io(
                destination,
                "destination is the source document itself",
            ));
        }

        let parent = destination
            .parent()
            .ok_or_else(|| FilingError::file_io(destination, "destination has no parent"))?;
        fs::create_dir_all(parent).map_err(|err| FilingError::file_io(parent, err))?;

        let staging = tempfile::Builder::new()
            .prefix("docfiler-stage")
            .tempdir()
            .map_err(|err| FilingError::file_io(std::env::temp_dir(), err))?;
        let file_name = source
            .file_name()
            .ok_or_else(|| FilingError::file_io(source, "source has no file name"))?;
        let staged = staging.path().join(file_name);
        fs::copy(source, &staged).map_err(|err| FilingError::file_io(source, err))?;

        let mut warnings = Vec::new();
        if let Some(angle) = task.rotation.filter(|a| a % 360 != 0) {
            match rotate::rotate_document(&staged, angle) {
                Ok(pages) => debug!(pages, angle, "rotation applied to staged copy"),
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(task = %task.id, angle, error = %reason, "rotation skipped");
                    warnings.push(format!("rotation skipped: {reason}"));
                    fs::copy(source, &staged).map_err(|err| FilingError::file_io(source, err))?;
                }
            }
        }

        let displaced = self.version_existing(destination, &staged)?;
        if let Err(err) = persist_copy(&staged, destination) {
            if let Some(old) = &displaced {
                let _ = fs::rename(old, destination);
            }
            return Err(FilingError::file_io(destination, format!("{err:#}")));
        }
        info!(
            task = %task.id,
            source = %source.display(),
            destination = %destination.display(),
            "document filed"
        );

        let disposition = self.retire_source(task, source);
        match &disposition {
            SourceDisposition::Removed => {}
            SourceDisposition::Renamed(path) => warnings.push(format!(
                "source could not be removed; renamed to {}",
                path.display()
            )),
            SourceDisposition::Tracked => {
                warnings.push("source could not be removed or renamed; tracked as processed".into())
            }
        }

        Ok(CommitOutcome {
            final_path: destination.to_path_buf(),
            displaced,
            disposition,
            source_hash,
            warnings,
        })
    }

    fn version_existing(
        &self,
        destination: &Path,
        staged: &Path,
    ) -> Result<Option<PathBuf>, FilingError> {
        if !destination.exists() {
            return Ok(None);
        }
        let same = match (file_hash(destination), file_hash(staged)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same {
            debug!(destination = %destination.display(), "identical document already filed");
            return Ok(None);
        }
        let old = versioned_name(destination);
        fs::rename(destination, &old).map_err(|err| FilingError::file_io(destination, err))?;
        info!(previous = %old.display(), "existing destination versioned");
        Ok(Some(old))
    }

    fn retire_source(&self, task: &Task, source: &Path) -> SourceDisposition {
        let attempts = self.settings.removal_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match (self.remove_source)(source) {
                Ok(()) => return SourceDisposition::Removed,
                Err(err) => {
                    debug!(attempt, attempts, error = %err, "source removal failed");
                    last_err = Some(err);
                    if attempt < attempts {
                        thread::sleep(self.settings.removal_delay);
                    }
                }
            }
        }

        let err_text = last_err.map(|e| e.to_string()).unwrap_or_default();
        let task_id = task.id.to_string();
        let document = source.display().to_string();
        let renamed = processed_name(source);
        self.mark_processed(source);
        match fs::rename(source, &renamed) {
            Ok(()) => {
                filer_warn::emit(filer_warn::WarnEvent {
                    code: "SOURCE_LOCKED",
                    stage: "commit",
                    action: "renamed",
                    task: &task_id,
                    document: &document,
                    retry: &attempts.to_string(),
                    reason: "removal_failed",
                    err: &err_text,
                });
                self.mark_processed(&renamed);
                SourceDisposition::Renamed(renamed)
            }
            Err(rename_err) => {
                filer_warn::emit(filer_warn::WarnEvent {
                    code: "SOURCE_LOCKED",
                    stage: "commit",
                    action: "tracked",
                    task: &task_id,
                    document: &document,
                    retry: &attempts.to_string(),
                    reason: "removal_and_rename_failed",
                    err: &rename_err.to_string(),
                });
                SourceDisposition::Tracked
            }
        }
    }

    fn holds_source(task: &Task, path: &Path) -> bool {
        match (&task.source_hash, file_hash(path)) {
            (Some(expected), Ok(actual)) => *expected == actual,
            _ => false,
        }
    }

    /// Move a filed document back to where it came from. Returns where it
    /// landed: the original path, or a free name beside it when another
    /// document has taken that path since.
    pub fn revert(&self, task: &Task) -> Result<PathBuf, FilingError> {
        let filed = task
            .filed_location
            .as_deref()
            .ok_or_else(|| FilingError::file_io(&task.source_path, "task has no filed location"))?;
        let original = task
            .original_location
            .as_deref()
            .ok_or_else(|| FilingError::file_io(filed, "task has no original location"))?;
        if !filed.is_file() {
            return Err(FilingError::file_io(filed, "filed document no longer exists"));
        }
        self.handles.release(filed);

        let source_left_in_place = task.source_disposition == Some(SourceDisposition::Tracked)
            && Self::holds_source(task, original);
        let restored_to = if source_left_in_place {
            // Removal and rename both failed at commit; the source is still there.
            fs::remove_file(filed).map_err(|err| FilingError::file_io(filed, err))?;
            original.to_path_buf()
        } else if original.exists() {
            let free = restored_name(original);
            move_file(filed, &free)
                .map_err(|err| FilingError::file_io(filed, format!("{err:#}")))?;
            warn!(
                task = %task.id,
                occupied = %original.display(),
                restored = %free.display(),
                "original location taken by another document; restored beside it"
            );
            free
        } else {
            move_file(filed, original)
                .map_err(|err| FilingError::file_io(filed, format!("{err:#}")))?;
            original.to_path_buf()
        };

        if let Some(renamed) = &task.renamed_source {
            if Self::holds_source(task, renamed) && fs::remove_file(renamed).is_ok() {
                debug!(renamed = %renamed.display(), "removed processed-suffix leftover");
            }
            self.unmark_processed(renamed);
        }
        self.unmark_processed(original);

        if let Some(old) = &task.displaced_location {
            if old.exists() {
                move_file(old, filed)
                    .map_err(|err| FilingError::file_io(old, format!("{err:#}")))?;
            }
        }
        info!(task = %task.id, restored = %restored_to.display(), "document returned to source");
        Ok(restored_to)
    }

    /// First document in `folder` that is neither processed nor in flight.
    pub fn next_document(
        &self,
        folder: &Path,
        extension: &str,
        active: &[PathBuf],
    ) -> Result<Option<PathBuf>, FilingError> {
        let entries = fs::read_dir(folder).map_err(|err| FilingError::file_io(folder, err))?;
        let wanted_ext = extension.trim_start_matches('.');
        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| FilingError::file_io(folder, err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext_matches = path
                .extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case(wanted_ext))
                .unwrap_or(false);
            if !ext_matches || is_processed_name(&path) {
                continue;
            }
            if self.is_processed(&path) || active.iter().any(|a| a == &path) {
                continue;
            }
            candidates.push(path);
        }
        candidates.sort();
        Ok(candidates.into_iter().find(|path| File::open(path).is_ok()))
    }

    /// Set a document aside without filing it.
    pub fn skip(
        &self,
        path: &Path,
        mode: SkipMode,
        skip_folder: Option<&Path>,
    ) -> Result<SkipOutcome, FilingError> {
        if !path.is_file() {
            return Err(FilingError::file_io(path, "document does not exist"));
        }
        self.handles.release(path);

        match mode {
            SkipMode::InPlace => {
                self.mark_processed(path);
                info!(document = %path.display(), "document skipped in place");
                Ok(SkipOutcome { moved_to: None })
            }
            SkipMode::ToFolder => {
                let folder = skip_folder
                    .filter(|f| !f.as_os_str().is_empty())
                    .ok_or_else(|| FilingError::Config("skip_folder is not configured".into()))?;
                fs::create_dir_all(folder).map_err(|err| FilingError::file_io(folder, err))?;
                let (stem, ext) = split_name(path);
                let target = folder.join(with_ext(
                    &format!("{stem}_skipped_{}", timestamp()),
                    ext.as_deref(),
                ));
                fs::copy(path, &target).map_err(|err| FilingError::file_io(path, err))?;

                let attempts = self.settings.removal_attempts.max(1);
                let mut removed = false;
                for attempt in 1..=attempts {
                    if (self.remove_source)(path).is_ok() {
                        removed = true;
                        break;
                    }
                    if attempt < attempts {
                        thread::sleep(self.settings.removal_delay);
                    }
                }
                if !removed {
                    let _ = fs::remove_file(&target);
                    return Err(FilingError::file_io(
                        path,
                        "document is locked; could not move it to the skip folder",
                    ));
                }
                info!(document = %path.display(), skipped_to = %target.display(), "document skipped");
                Ok(SkipOutcome {
                    moved_to: Some(target),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filer::task::FilterValue;
    use crate::filer::template::AttrValue;
    use tempfile::{TempDir, tempdir};

    fn fast() -> MoverSettings {
        MoverSettings {
            removal_attempts: 3,
            removal_delay: Duration::from_millis(1),
        }
    }

    fn always_locked(_: &Path) -> io::Result<()> {
        Err(io::Error::new(ErrorKind::PermissionDenied, "file in use"))
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let tmp = tempdir().expect("tempdir");
        let inbox = tmp.path().join("inbox");
        let out = tmp.path().join("out");
        fs::create_dir_all(&inbox).expect("inbox");
        (tmp, inbox, out)
    }

    fn task_for(path: &Path) -> Task {
        let mut task = Task::new(path, vec![FilterValue::new("Acme"), FilterValue::new("INV-001")]);
        task.original_location = Some(path.to_path_buf());
        task
    }

    #[test]
    fn commit_moves_document_and_removes_source() {
        let (_tmp, inbox, out) = setup();
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"%PDF-1.4 body").expect("write");
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));
        let attrs: Attributes = [("n".to_string(), AttrValue::from("INV-001"))]
            .into_iter()
            .collect();

        let outcome = mover
            .commit(&task_for(&source), &attrs, &out, "2025/${n}.pdf")
            .expect("commit");
        assert_eq!(outcome.final_path, out.join("2025").join("INV-001.pdf"));
        assert_eq!(outcome.disposition, SourceDisposition::Removed);
        assert!(!source.exists());
        assert_eq!(fs::read(&outcome.final_path).expect("read"), b"%PDF-1.4 body");
    }

    #[test]
    fn locked_source_is_renamed_and_never_offered_again() {
        let (_tmp, inbox, out) = setup();
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"doc").expect("write");
        let mover =
            DocumentMover::new(fast(), Arc::new(HandleRegistry::default())).with_remover(always_locked);

        let outcome = mover
            .commit_to(&task_for(&source), &out.join("INV-001.pdf"))
            .expect("commit");
        assert!(out.join("INV-001.pdf").is_file());
        let SourceDisposition::Renamed(renamed) = &outcome.disposition else {
            panic!("expected rename, got {:?}", outcome.disposition);
        };
        assert_eq!(renamed, &inbox.join("scan.processed.pdf"));
        assert!(renamed.is_file());
        assert!(mover.is_processed(&source));
        assert!(!outcome.warnings.is_empty());

        assert_eq!(mover.next_document(&inbox, "pdf", &[]).expect("next"), None);
    }

    #[test]
    fn existing_destination_is_versioned_and_restored_on_revert() {
        let (_tmp, inbox, out) = setup();
        fs::create_dir_all(&out).expect("out");
        let dest = out.join("INV-001.pdf");
        fs::write(&dest, b"older").expect("older");
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"newer").expect("write");
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));

        let mut task = task_for(&source);
        let outcome = mover.commit_to(&task, &dest).expect("commit");
        let old = outcome.displaced.clone().expect("displaced");
        assert!(old.file_name().expect("name").to_string_lossy().starts_with("old_"));
        assert_eq!(fs::read(&dest).expect("dest"), b"newer");

        task.filed_location = Some(outcome.final_path.clone());
        task.displaced_location = outcome.displaced.clone();
        task.source_hash = outcome.source_hash.clone();
        task.source_disposition = Some(outcome.disposition.clone());
        assert_eq!(mover.revert(&task).expect("revert"), source);
        assert_eq!(fs::read(&source).expect("source"), b"newer");
        assert_eq!(fs::read(&dest).expect("dest"), b"older");
        assert!(!old.exists());
    }

    #[test]
    fn revert_never_overwrites_a_new_document_under_the_old_name() {
        let (_tmp, inbox, out) = setup();
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"FIRST INVOICE").expect("write");
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));

        let mut task = task_for(&source);
        let outcome = mover.commit_to(&task, &out.join("INV-001.pdf")).expect("commit");
        task.filed_location = Some(outcome.final_path.clone());
        task.source_hash = outcome.source_hash;
        task.source_disposition = Some(outcome.disposition);
        fs::write(&source, b"SECOND INVOICE").expect("new scan");

        let restored = mover.revert(&task).expect("revert");
        assert_ne!(restored, source);
        assert_eq!(restored.parent(), Some(inbox.as_path()));
        assert!(
            restored
                .file_name()
                .expect("name")
                .to_string_lossy()
                .starts_with("scan_restored_")
        );
        assert_eq!(fs::read(&source).expect("new scan"), b"SECOND INVOICE");
        assert_eq!(fs::read(&restored).expect("restored"), b"FIRST INVOICE");
        assert!(!outcome.final_path.exists());
    }

    #[test]
    fn revert_drops_filed_copy_only_when_untouched_source_stayed() {
        let (_tmp, inbox, out) = setup();
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"FIRST INVOICE").expect("write");
        let filed = out.join("INV-001.pdf");
        fs::create_dir_all(&out).expect("out");
        fs::write(&filed, b"FIRST INVOICE").expect("filed");
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));

        let mut task = task_for(&source);
        task.filed_location = Some(filed.clone());
        task.source_hash = file_hash(&source).ok();
        task.source_disposition = Some(SourceDisposition::Tracked);
        mover.mark_processed(&source);

        assert_eq!(mover.revert(&task).expect("revert"), source);
        assert!(!filed.exists());
        assert_eq!(fs::read(&source).expect("source"), b"FIRST INVOICE");
        assert!(!mover.is_processed(&source));

        // Same disposition, but the file under that name changed since.
        fs::write(&filed, b"FIRST INVOICE").expect("filed again");
        fs::write(&source, b"SECOND INVOICE").expect("new scan");
        let restored = mover.revert(&task).expect("revert");
        assert_ne!(restored, source);
        assert_eq!(fs::read(&restored).expect("restored"), b"FIRST INVOICE");
        assert_eq!(fs::read(&source).expect("new scan"), b"SECOND INVOICE");
    }

    #[test]
    fn revert_fails_when_filed_document_is_gone() {
        let (_tmp, inbox, out) = setup();
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));
        let mut task = task_for(&inbox.join("scan.pdf"));
        task.filed_location = Some(out.join("missing.pdf"));
        assert!(matches!(mover.revert(&task), Err(FilingError::FileIo { .. })));
    }

    #[test]
    fn missing_source_is_fatal() {
        let (_tmp, inbox, out) = setup();
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));
        let err = mover
            .commit_to(&task_for(&inbox.join("ghost.pdf")), &out.join("x.pdf"))
            .expect_err("missing source");
        assert!(matches!(err, FilingError::FileIo { .. }));
        assert!(!out.join("x.pdf").exists());
    }

    #[test]
    fn open_handles_are_released_before_commit() {
        let (_tmp, inbox, out) = setup();
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"doc").expect("write");
        let handles = Arc::new(HandleRegistry::default());
        handles.open(&source).expect("open");
        let mover = DocumentMover::new(fast(), Arc::clone(&handles));

        mover
            .commit_to(&task_for(&source), &out.join("a.pdf"))
            .expect("commit");
        assert!(!handles.is_open(&source));
    }

    #[test]
    fn failed_rotation_keeps_unrotated_copy() {
        let (_tmp, inbox, out) = setup();
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"not really a pdf").expect("write");
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));
        let task = task_for(&source).with_rotation(90);

        let outcome = mover.commit_to(&task, &out.join("a.pdf")).expect("commit");
        assert_eq!(fs::read(out.join("a.pdf")).expect("read"), b"not really a pdf");
        assert!(outcome.warnings.iter().any(|w| w.contains("rotation skipped")));
    }

    #[test]
    fn next_document_skips_processed_and_active() {
        let (_tmp, inbox, _out) = setup();
        for name in ["b.pdf", "a.pdf", "c.processed.pdf", "notes.txt", "d.PDF"] {
            fs::write(inbox.join(name), b"x").expect("write");
        }
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));
        assert_eq!(
            mover.next_document(&inbox, "pdf", &[]).expect("next"),
            Some(inbox.join("a.pdf"))
        );
        mover.mark_processed(&inbox.join("a.pdf"));
        assert_eq!(
            mover
                .next_document(&inbox, "pdf", &[inbox.join("b.pdf")])
                .expect("next"),
            Some(inbox.join("d.PDF"))
        );
    }

    #[test]
    fn skip_to_folder_moves_document_aside() {
        let (tmp, inbox, _out) = setup();
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"doc").expect("write");
        let skip_dir = tmp.path().join("skipped");
        let mover = DocumentMover::new(fast(), Arc::new(HandleRegistry::default()));

        let outcome = mover
            .skip(&source, SkipMode::ToFolder, Some(&skip_dir))
            .expect("skip");
        let moved = outcome.moved_to.expect("moved");
        assert!(moved.starts_with(&skip_dir));
        assert!(
            moved
                .file_name()
                .expect("name")
                .to_string_lossy()
                .starts_with("scan_skipped_")
        );
        assert!(!source.exists());

        let other = inbox.join("other.pdf");
        fs::write(&other, b"doc").expect("write");
        mover.skip(&other, SkipMode::InPlace, None).expect("in place");
        assert!(other.exists());
        assert!(mover.is_processed(&other));
        assert!(mover.skip(&other, SkipMode::ToFolder, None).is_err());
    }

    #[test]
    fn locked_document_stays_put_when_skipping_to_folder() {
        let (tmp, inbox, _out) = setup();
        let source = inbox.join("scan.pdf");
        fs::write(&source, b"doc").expect("write");
        let skip_dir = tmp.path().join("skipped");
        let mover =
            DocumentMover::new(fast(), Arc::new(HandleRegistry::default())).with_remover(always_locked);

        assert!(mover.skip(&source, SkipMode::ToFolder, Some(&skip_dir)).is_err());
        assert!(source.exists());
        assert_eq!(fs::read_dir(&skip_dir).expect("dir").count(), 0);
    }
}
