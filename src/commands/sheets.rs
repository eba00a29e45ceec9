use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::commands::{CommandReport, load_config};
use crate::filer::paths::resolve_paths;
use crate::filer::workbook;

pub fn run(
    config: Option<&Path>,
    ledger: Option<&Path>,
    sheet: Option<&str>,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("sheets");
    let ledger = match ledger {
        Some(path) => path.to_path_buf(),
        None => {
            let paths = resolve_paths()?;
            let cfg = load_config(&paths, config)?;
            if cfg.ledger_file.trim().is_empty() {
                report.issue("no ledger given and ledger_file is not configured");
                return Ok(report);
            }
            PathBuf::from(cfg.ledger_file)
        }
    };

    match sheet {
        Some(name) => {
            for column in workbook::sheet_columns(&ledger, name)? {
                report.detail(column);
            }
        }
        None => {
            for name in workbook::sheet_names(&ledger)? {
                report.detail(name);
            }
        }
    }
    Ok(report)
}
