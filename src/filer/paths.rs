use anyhow::Result;
use std::env;
use std::path::PathBuf;

use crate::filer::config::resolve_config_path;

#[derive(Debug, Clone)]
pub struct FilerPaths {
    pub home: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub config_file: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<FilerPaths> {
    let home = match env::var("DOCFILER_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join(".docfiler"),
    };

    let state_dir = env_or_default_path("DOCFILER_STATE_DIR", home.join("state"));
    let logs_dir = env_or_default_path("DOCFILER_LOGS_DIR", home.join("logs"));
    let config_file = resolve_config_path(&home);

    Ok(FilerPaths {
        home,
        state_dir,
        logs_dir,
        config_file,
    })
}

#[cfg(test)]
impl FilerPaths {
    pub fn under(root: &std::path::Path) -> Self {
        Self {
            home: root.to_path_buf(),
            state_dir: root.join("state"),
            logs_dir: root.join("logs"),
            config_file: root.join("docfiler.toml"),
        }
    }
}
