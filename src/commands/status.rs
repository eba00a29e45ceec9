use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::commands::{CommandReport, config_path, load_config};
use crate::filer::paths::resolve_paths;
use crate::filer::state::{self, state_file_path};
use crate::filer::template;

pub fn run(config: Option<&Path>) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    let cfg_file = config_path(&paths, config);
    report.detail(format!("docfiler_home={}", paths.home.display()));
    report.detail(format!("config_file={}", cfg_file.display()));
    report.detail(format!("state_file={}", state_file_path(&paths).display()));
    report.detail(format!("audit_log={}", paths.logs_dir.join("audit.log").display()));
    if !cfg_file.exists() {
        report.issue(format!("missing config file {}", cfg_file.display()));
    }

    let cfg = load_config(&paths, config)?;
    for key in cfg.missing_required() {
        report.issue(format!("missing {key}"));
    }
    if !cfg.output_template.trim().is_empty() {
        report.detail(format!(
            "output_template_valid={}",
            template::validate(&cfg.output_template)
        ));
    }
    if !cfg.ledger_file.trim().is_empty() && !Path::new(&cfg.ledger_file).is_file() {
        report.issue(format!("ledger not found: {}", cfg.ledger_file));
    }
    if !cfg.source_folder.trim().is_empty() && !Path::new(&cfg.source_folder).is_dir() {
        report.issue(format!("source folder not found: {}", cfg.source_folder));
    }
    if !cfg.filter_columns.is_empty() {
        report.detail(format!("filter_columns={}", cfg.filter_columns.join(",")));
    }
    if let Some(column) = cfg.effective_link_column() {
        report.detail(format!("link_column={column}"));
    }

    let saved = state::load(&paths)?;
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for task in &saved.tasks {
        *counts.entry(task.status.as_str()).or_default() += 1;
    }
    for (status, count) in counts {
        report.detail(format!("tasks_{status}={count}"));
    }
    report.detail(format!("processed_sources={}", saved.processed_sources.len()));
    Ok(report)
}
