use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FilingError;
use crate::filer::events::{EngineEvent, EventBus};
use crate::filer::template;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub idle_poll_ms: u64,
    pub removal_attempts: u32,
    pub removal_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 100,
            removal_attempts: 3,
            removal_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FilerConfig {
    pub source_folder: String,
    pub processed_folder: String,
    pub skip_folder: String,
    pub ledger_file: String,
    pub ledger_sheet: String,
    pub output_template: String,
    /// `filter1_column` .. `filterN_column`, in order.
    pub filter_columns: Vec<String>,
    /// Column receiving back-references; defaults to the discriminating one.
    pub link_column: Option<String>,
    pub document_extension: String,
    pub worker: WorkerConfig,
}

impl Default for FilerConfig {
    fn default() -> Self {
        Self {
            source_folder: String::new(),
            processed_folder: String::new(),
            skip_folder: String::new(),
            ledger_file: String::new(),
            ledger_sheet: String::new(),
            output_template: String::new(),
            filter_columns: Vec::new(),
            link_column: None,
            document_extension: "pdf".to_string(),
            worker: WorkerConfig::default(),
        }
    }
}

impl FilerConfig {
    /// Settings the worker cannot file a document without, by key name.
    pub fn missing_required(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for (key, value) in [
            ("processed_folder", &self.processed_folder),
            ("output_template", &self.output_template),
            ("ledger_file", &self.ledger_file),
            ("ledger_sheet", &self.ledger_sheet),
        ] {
            if value.trim().is_empty() {
                missing.push(key.to_string());
            }
        }
        for n in self.filter_columns.len() + 1..=2 {
            missing.push(format!("filter{n}_column"));
        }
        missing
    }

    pub fn require_for_filing(&self) -> Result<(), FilingError> {
        let missing = self.missing_required();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FilingError::Config(format!("missing {}", missing.join(", "))))
        }
    }

    pub fn discriminating_column(&self) -> Option<&str> {
        self.filter_columns.get(1).map(String::as_str)
    }

    pub fn effective_link_column(&self) -> Option<&str> {
        self.link_column
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.discriminating_column())
    }

    pub fn removal_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.worker.removal_delay_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialFilerConfig {
    source_folder: Option<String>,
    processed_folder: Option<String>,
    skip_folder: Option<String>,
    ledger_file: Option<String>,
    ledger_sheet: Option<String>,
    output_template: Option<String>,
    link_column: Option<String>,
    document_extension: Option<String>,
    worker: Option<WorkerConfig>,
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

/// Collect `filterN_column` keys, which must run 1..=k without gaps.
fn filter_columns_from(extra: &BTreeMap<String, toml::Value>) -> Result<Vec<String>> {
    let re = Regex::new(r"^filter(\d+)_column$")?;
    let mut numbered = Vec::new();
    for (key, value) in extra {
        let Some(caps) = re.captures(key) else {
            tracing::debug!(key = %key, "ignoring unknown config key");
            continue;
        };
        let n: usize = caps[1].parse()?;
        let column = value
            .as_str()
            .ok_or_else(|| anyhow!("{key} must be a string"))?
            .trim()
            .to_string();
        numbered.push((n, column));
    }
    numbered.sort_by_key(|(n, _)| *n);

    let mut columns = Vec::with_capacity(numbered.len());
    for (expected, (n, column)) in (1..).zip(numbered) {
        if n != expected {
            return Err(anyhow!(
                "filter columns must be contiguous: filter{expected}_column is missing"
            ));
        }
        if column.is_empty() {
            return Err(anyhow!("filter{n}_column cannot be empty"));
        }
        columns.push(column);
    }
    Ok(columns)
}

fn merge_partial(base: &mut FilerConfig, parsed: PartialFilerConfig) -> Result<()> {
    let filter_columns = filter_columns_from(&parsed.extra)?;
    if !filter_columns.is_empty() {
        base.filter_columns = filter_columns;
    }
    for (slot, value) in [
        (&mut base.source_folder, parsed.source_folder),
        (&mut base.processed_folder, parsed.processed_folder),
        (&mut base.skip_folder, parsed.skip_folder),
        (&mut base.ledger_file, parsed.ledger_file),
        (&mut base.ledger_sheet, parsed.ledger_sheet),
        (&mut base.output_template, parsed.output_template),
        (&mut base.document_extension, parsed.document_extension),
    ] {
        if let Some(value) = value {
            *slot = value;
        }
    }
    if parsed.link_column.is_some() {
        base.link_column = parsed.link_column;
    }
    if let Some(worker) = parsed.worker {
        base.worker = worker;
    }
    Ok(())
}

pub fn parse_config(raw: &str) -> Result<FilerConfig> {
    let parsed: PartialFilerConfig =
        toml::from_str(raw).map_err(|err| anyhow!("failed to parse docfiler config: {err}"))?;
    let mut cfg = FilerConfig::default();
    merge_partial(&mut cfg, parsed)?;
    Ok(cfg)
}

fn merge_file_config(base: &mut FilerConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(path)?;
    let parsed: PartialFilerConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse docfiler config {}: {err}", path.display()))?;
    merge_partial(base, parsed)
}

fn apply_env(cfg: &mut FilerConfig) {
    cfg.source_folder = env_or_string("DOCFILER_SOURCE_FOLDER", &cfg.source_folder);
    cfg.processed_folder = env_or_string("DOCFILER_PROCESSED_FOLDER", &cfg.processed_folder);
    cfg.skip_folder = env_or_string("DOCFILER_SKIP_FOLDER", &cfg.skip_folder);
    cfg.ledger_file = env_or_string("DOCFILER_LEDGER_FILE", &cfg.ledger_file);
    cfg.ledger_sheet = env_or_string("DOCFILER_LEDGER_SHEET", &cfg.ledger_sheet);
    cfg.output_template = env_or_string("DOCFILER_OUTPUT_TEMPLATE", &cfg.output_template);
    cfg.filter_columns = env_or_csv("DOCFILER_FILTER_COLUMNS", &cfg.filter_columns);
    let link = env_or_string("DOCFILER_LINK_COLUMN", cfg.link_column.as_deref().unwrap_or(""));
    cfg.link_column = (!link.is_empty()).then_some(link);
    cfg.document_extension = env_or_string("DOCFILER_DOCUMENT_EXTENSION", &cfg.document_extension);
    cfg.worker.idle_poll_ms = env_or_u64("DOCFILER_IDLE_POLL_MS", cfg.worker.idle_poll_ms);
    cfg.worker.removal_attempts = env_or_u64(
        "DOCFILER_REMOVAL_ATTEMPTS",
        u64::from(cfg.worker.removal_attempts),
    )
    .try_into()
    .unwrap_or(cfg.worker.removal_attempts);
    cfg.worker.removal_delay_ms =
        env_or_u64("DOCFILER_REMOVAL_DELAY_MS", cfg.worker.removal_delay_ms);
}

fn validate(cfg: &FilerConfig) -> Result<()> {
    if cfg.worker.idle_poll_ms == 0 {
        return Err(anyhow!("invalid worker idle poll: must be >= 1 ms"));
    }
    if cfg.worker.removal_attempts == 0 {
        return Err(anyhow!("invalid removal attempts: must be >= 1"));
    }
    if cfg.document_extension.trim().trim_start_matches('.').is_empty() {
        return Err(anyhow!("invalid document extension: cannot be empty"));
    }
    if !cfg.output_template.trim().is_empty() {
        template::check(&cfg.output_template)
            .map_err(|err| anyhow!("invalid output_template: {err}"))?;
    }
    Ok(())
}

/// Defaults, then the TOML file at `path`, then `DOCFILER_*` overrides.
pub fn load_config_from(path: &Path) -> Result<FilerConfig> {
    let mut cfg = FilerConfig::default();
    merge_file_config(&mut cfg, path)?;
    apply_env(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

pub fn resolve_config_path(home: &Path) -> PathBuf {
    if let Ok(custom) = env::var("DOCFILER_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    home.join("docfiler.toml")
}

/// Shared, replaceable configuration. Replacing it notifies subscribers.
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<FilerConfig>,
    events: Arc<EventBus>,
}

impl ConfigHandle {
    pub fn new(cfg: FilerConfig, events: Arc<EventBus>) -> Self {
        Self {
            current: RwLock::new(cfg),
            events,
        }
    }

    pub fn current(&self) -> FilerConfig {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, cfg: FilerConfig) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = cfg;
        self.events.publish(EngineEvent::ConfigChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_keys_and_worker_table() {
        let cfg = parse_config(
            r#"
source_folder = "/in"
processed_folder = "/out"
ledger_file = "/books/ledger.xlsx"
ledger_sheet = "Invoices"
output_template = "${filter3|date.year}/${filter2}.pdf"
filter2_column = "Number"
filter1_column = "Supplier"
filter3_column = "DATE FACTURE"

[worker]
removal_attempts = 5
"#,
        )
        .expect("parse");
        assert_eq!(cfg.filter_columns, vec!["Supplier", "Number", "DATE FACTURE"]);
        assert_eq!(cfg.worker.removal_attempts, 5);
        assert_eq!(cfg.worker.removal_delay_ms, 500);
        assert_eq!(cfg.effective_link_column(), Some("Number"));
        assert!(cfg.missing_required().is_empty());
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn gaps_in_filter_columns_are_rejected() {
        let err = parse_config("filter1_column = \"A\"\nfilter3_column = \"C\"\n")
            .expect_err("gap");
        assert!(err.to_string().contains("filter2_column"));
    }

    #[test]
    fn missing_settings_are_listed() {
        let cfg = FilerConfig {
            filter_columns: vec!["Supplier".into()],
            ..FilerConfig::default()
        };
        let missing = cfg.missing_required();
        assert!(missing.contains(&"output_template".to_string()));
        assert!(missing.contains(&"filter2_column".to_string()));
        assert!(!missing.contains(&"filter1_column".to_string()));
        assert!(matches!(
            cfg.require_for_filing(),
            Err(FilingError::Config(_))
        ));
    }

    #[test]
    fn invalid_template_fails_validation() {
        let cfg = FilerConfig {
            output_template: "${a".into(),
            ..FilerConfig::default()
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn replacing_config_notifies_subscribers() {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let handle = ConfigHandle::new(FilerConfig::default(), Arc::clone(&bus));
        handle.replace(FilerConfig {
            ledger_sheet: "Other".into(),
            ..FilerConfig::default()
        });
        assert_eq!(handle.current().ledger_sheet, "Other");
        assert_eq!(rx.try_recv().expect("event"), EngineEvent::ConfigChanged);
    }
}
