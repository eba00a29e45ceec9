use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::commands::{CommandReport, load_config};
use crate::filer::audit;
use crate::filer::paths::resolve_paths;
use crate::filer::pathutil::resolve_link;
use crate::filer::record_store::RecordStore;

pub fn run(config: Option<&Path>) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config(&paths, config)?;
    let mut report = CommandReport::new("links");

    if cfg.ledger_file.trim().is_empty() || cfg.ledger_sheet.trim().is_empty() {
        report.issue("ledger_file and ledger_sheet must be configured");
        return Ok(report);
    }
    let Some(column) = cfg.effective_link_column() else {
        report.issue("no link column: set link_column or filter2_column");
        return Ok(report);
    };

    let ledger = PathBuf::from(&cfg.ledger_file);
    let store = RecordStore::new();
    store.load(&ledger, &cfg.ledger_sheet, true)?;
    let linked = store.preload_back_references(&ledger, &cfg.ledger_sheet, &mut |pct: u8| {
        debug!(pct, "preloading back-references");
    })?;
    report.detail(format!("ledger={}", ledger.display()));
    report.detail(format!("link_column={column}"));
    report.detail(format!("linked_cells={linked}"));

    let mut missing = 0usize;
    for row in 0..store.row_count() {
        let Some(link) = store.back_reference(row, column)? else {
            continue;
        };
        if resolve_link(&ledger, &link).exists() {
            report.detail(format!("row {row}: {link}"));
        } else {
            missing += 1;
            report.issue(format!("row {row}: {link} (target missing)"));
        }
    }

    let status = if missing == 0 { "ok" } else { "missing_targets" };
    audit::append_event(
        &paths,
        "links",
        status,
        &format!("linked={linked} missing={missing}"),
    )?;
    Ok(report)
}
