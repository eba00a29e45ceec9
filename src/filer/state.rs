use crate::filer::paths::FilerPaths;
use crate::filer::task::Task;
use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Journal of every task seen so far plus the sources that must never be
/// offered again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilerState {
    pub schema_version: u32,
    pub last_saved_epoch_secs: u64,
    pub processed_sources: BTreeSet<PathBuf>,
    pub tasks: Vec<Task>,
}

impl Default for FilerState {
    fn default() -> Self {
        Self {
            schema_version: 1,
            last_saved_epoch_secs: 0,
            processed_sources: BTreeSet::new(),
            tasks: Vec::new(),
        }
    }
}

pub fn state_file_path(paths: &FilerPaths) -> PathBuf {
    paths.state_dir.join("docfiler_state.json")
}

pub fn load(paths: &FilerPaths) -> Result<FilerState> {
    let file = state_file_path(paths);
    if !file.exists() {
        return Ok(FilerState::default());
    }

    let raw =
        fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
    let parsed: FilerState = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", file.display()))?;
    Ok(parsed)
}

pub fn save(paths: &FilerPaths, state: &FilerState) -> Result<PathBuf> {
    let file = state_file_path(paths);
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(state)?;
    fs::write(&file, format!("{data}\n"))
        .with_context(|| format!("failed to write {}", file.display()))?;
    Ok(file)
}

/// Exclusive claim on the state directory, held while a session runs its
/// worker. A second session fails fast instead of racing the journal.
pub struct SessionLock {
    file: File,
}

pub fn session_lock_path(paths: &FilerPaths) -> PathBuf {
    paths.state_dir.join(".lock")
}

impl SessionLock {
    pub fn acquire(paths: &FilerPaths) -> Result<Self> {
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;
        let path = session_lock_path(paths);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(&path).unwrap_or_default();
            let holder = holder.trim();
            bail!(
                "another docfiler session is running (pid {}); lock held on {}",
                if holder.is_empty() { "unknown" } else { holder },
                path.display()
            );
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { file })
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
