//! Ledger-backed record store.
//!
//! Holds a snapshot of one ledger sheet and a cache of the back-references
//! found on its cells. Only the filing worker mutates either; readers go
//! through the accessors and never see a half-applied change.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::FilingError;
use crate::filer::pathutil;
use crate::filer::task::{DISCRIMINATING_INDEX, FilterChain};
use crate::filer::values::{self, ValueMatch};
use crate::filer::workbook::{self, Cell, CellValue, FontLook, LedgerFile, LedgerLock};

pub const DATE_NUMBER_FORMAT: &str = "DD/MM/YYYY";
pub const AMOUNT_NUMBER_FORMAT: &str = "#,##0.00";

const PROGRESS_EVERY_ROWS: usize = 100;

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn gate(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct LedgerCache {
    source: PathBuf,
    sheet: String,
    columns: Vec<String>,
    column_index: HashMap<String, usize>,
    rows: Vec<Vec<CellValue>>,
}

impl LedgerCache {
    fn from_sheet(source: &Path, sheet: &workbook::Sheet) -> Self {
        let columns = sheet.header();
        let mut column_index = HashMap::new();
        for (idx, name) in columns.iter().enumerate() {
            if !name.is_empty() {
                column_index.entry(name.clone()).or_insert(idx);
            }
        }
        let width = columns.len();
        let rows = sheet
            .rows
            .iter()
            .skip(1)
            .map(|row| {
                let mut values: Vec<CellValue> =
                    row.iter().take(width).map(|cell| cell.value.clone()).collect();
                values.resize(width, CellValue::Empty);
                values
            })
            .collect();
        Self {
            source: source.to_path_buf(),
            sheet: sheet.name.clone(),
            columns,
            column_index,
            rows,
        }
    }

    fn require_column(&self, name: &str) -> Result<usize, FilingError> {
        self.column_index.get(name).copied().ok_or_else(|| {
            FilingError::Config(format!(
                "column `{name}` not found in sheet `{}` of {}",
                self.sheet,
                self.source.display()
            ))
        })
    }

    fn text_at(&self, row: usize, col: usize) -> Option<String> {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(col))
            .map(|value| value.display().trim().to_string())
    }

    fn row_data(&self, index: usize) -> Option<RowData> {
        let cells = self.rows.get(index)?;
        Some(RowData {
            index,
            cells: self
                .columns
                .iter()
                .cloned()
                .zip(cells.iter().cloned())
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    pub index: usize,
    pub cells: Vec<(String, CellValue)>,
}

impl RowData {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// State of a cell before a back-reference was written to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub target: Option<String>,
    #[serde(default)]
    pub value: CellValue,
    #[serde(default)]
    pub font: FontLook,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkOutcome {
    /// Back-reference text as written to the ledger.
    pub link: String,
    pub previous: LinkSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Preset,
    RowHint,
    UniqueMatch,
    Narrowed,
    /// Several rows stayed equivalent; the first by row order was taken.
    FirstOfAmbiguous { candidates: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Found { row: usize, via: ResolvedVia },
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowValidation {
    pub date_tolerances: usize,
    pub amount_tolerances: usize,
    pub unfilled: Vec<String>,
}

pub struct InsertedRow {
    pub data_index: usize,
    pub values: Vec<CellValue>,
}

/// Writes a new record into the ledger file: (ledger, sheet, columns, values).
pub type RowWriter = fn(&Path, &str, &[String], &[String]) -> Result<InsertedRow, FilingError>;

pub struct RecordStore {
    cache: RwLock<Option<LedgerCache>>,
    links: RwLock<HashMap<(usize, usize), Option<String>>>,
    writes: Mutex<()>,
    write_row: RowWriter,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self {
            cache: RwLock::default(),
            links: RwLock::default(),
            writes: Mutex::default(),
            write_row: insert_row_on_disk,
        }
    }
}

fn backup_path(source: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    source.with_file_name(name)
}

fn not_loaded() -> FilingError {
    FilingError::load(PathBuf::new(), "no ledger loaded")
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the function that writes new records to the ledger file.
    pub fn with_row_writer(mut self, writer: RowWriter) -> Self {
        self.write_row = writer;
        self
    }

    /// Load `sheet` of `source` into the cache. Returns whether a read happened.
    pub fn load(&self, source: &Path, sheet: &str, force: bool) -> Result<bool, FilingError> {
        if !force {
            let guard = read_lock(&self.cache);
            if let Some(cache) = guard.as_ref() {
                if cache.source == source && cache.sheet == sheet {
                    return Ok(false);
                }
            }
        }

        let sheet_data = read_sheet(source, sheet)?;
        let fresh = LedgerCache::from_sheet(source, &sheet_data);
        let rows = fresh.rows.len();

        *write_lock(&self.cache) = Some(fresh);
        write_lock(&self.links).clear();
        info!(ledger = %source.display(), sheet, rows, "ledger loaded");
        Ok(true)
    }

    pub fn source(&self) -> Option<(PathBuf, String)> {
        read_lock(&self.cache)
            .as_ref()
            .map(|cache| (cache.source.clone(), cache.sheet.clone()))
    }

    pub fn row_count(&self) -> usize {
        read_lock(&self.cache)
            .as_ref()
            .map(|cache| cache.rows.len())
            .unwrap_or(0)
    }

    pub fn columns(&self) -> Vec<String> {
        read_lock(&self.cache)
            .as_ref()
            .map(|cache| cache.columns.clone())
            .unwrap_or_default()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        read_lock(&self.cache)
            .as_ref()
            .and_then(|cache| cache.column_index.get(name).copied())
    }

    pub fn row(&self, index: usize) -> Option<RowData> {
        read_lock(&self.cache)
            .as_ref()
            .and_then(|cache| cache.row_data(index))
    }

    /// Find the single row the chain designates, or report that none exists.
    pub fn resolve(
        &self,
        chain: &FilterChain,
        preset: Option<usize>,
    ) -> Result<Resolution, FilingError> {
        let guard = read_lock(&self.cache);
        let cache = guard.as_ref().ok_or_else(not_loaded)?;
        let (disc_column, disc_value) = chain.discriminating().ok_or_else(|| {
            FilingError::Config("filter chain needs at least two entries".into())
        })?;
        let disc_idx = cache.require_column(disc_column)?;
        let wanted = disc_value.value.trim();
        if wanted.is_empty() {
            return Err(FilingError::Config(format!(
                "discriminating filter `{disc_column}` has no value"
            )));
        }

        let verified = |row: usize| cache.text_at(row, disc_idx).as_deref() == Some(wanted);

        if let Some(row) = preset {
            if verified(row) {
                return Ok(Resolution::Found {
                    row,
                    via: ResolvedVia::Preset,
                });
            }
            debug!(row, "preset row no longer matches; resolving again");
        }
        if let Some(hint) = disc_value.row_hint {
            if verified(hint) {
                return Ok(Resolution::Found {
                    row: hint,
                    via: ResolvedVia::RowHint,
                });
            }
            debug!(hint, value = wanted, "row hint failed verification");
        }

        let matches: Vec<usize> = (0..cache.rows.len()).filter(|row| verified(*row)).collect();
        let mut candidates = match matches.len() {
            0 => return Ok(Resolution::Missing),
            1 => {
                return Ok(Resolution::Found {
                    row: matches[0],
                    via: ResolvedVia::UniqueMatch,
                });
            }
            _ => matches,
        };

        for (idx, (column, value)) in chain.entries().iter().enumerate() {
            if idx == DISCRIMINATING_INDEX || value.value.trim().is_empty() {
                continue;
            }
            let Some(col) = cache.column_index.get(column).copied() else {
                continue;
            };
            let narrowed: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|row| {
                    matches!(
                        values::compare(&cache.rows[*row][col], &value.value),
                        ValueMatch::Exact | ValueMatch::SameDate | ValueMatch::SameAmount
                    )
                })
                .collect();
            if !narrowed.is_empty() {
                candidates = narrowed;
            }
            if candidates.len() == 1 {
                return Ok(Resolution::Found {
                    row: candidates[0],
                    via: ResolvedVia::Narrowed,
                });
            }
        }

        let count = candidates.len();
        let row = candidates[0];
        warn!(
            value = wanted,
            candidates = count,
            row,
            "ambiguous ledger match; taking the first row"
        );
        Ok(Resolution::Found {
            row,
            via: ResolvedVia::FirstOfAmbiguous { candidates: count },
        })
    }

    /// Row that still carries `link` in `column` and whose discriminating key
    /// matches `chain`. `expected` is checked first; rows inserted since may
    /// have moved the record. Without a recorded link the key alone decides.
    pub fn locate_linked_row(
        &self,
        chain: &FilterChain,
        expected: usize,
        column: &str,
        link: Option<&str>,
    ) -> Result<Option<usize>, FilingError> {
        let candidates: Vec<usize> = {
            let guard = read_lock(&self.cache);
            let cache = guard.as_ref().ok_or_else(not_loaded)?;
            let (disc_column, disc_value) = chain.discriminating().ok_or_else(|| {
                FilingError::Config("filter chain needs at least two entries".into())
            })?;
            let disc_idx = cache.require_column(disc_column)?;
            let wanted = disc_value.value.trim();
            std::iter::once(expected)
                .chain((0..cache.rows.len()).filter(|row| *row != expected))
                .filter(|row| cache.text_at(*row, disc_idx).as_deref() == Some(wanted))
                .collect()
        };

        let Some(link) = link else {
            return Ok(candidates.first().copied());
        };
        for row in candidates {
            if self.back_reference(row, column)?.as_deref() == Some(link) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Compare a resolved row with every non-empty filter value.
    pub fn validate_row(
        &self,
        row: usize,
        chain: &FilterChain,
    ) -> Result<RowValidation, FilingError> {
        let guard = read_lock(&self.cache);
        let cache = guard.as_ref().ok_or_else(not_loaded)?;
        let cells = cache.rows.get(row).ok_or_else(|| FilingError::ValidationMismatch {
            row,
            details: format!("row out of range ({} rows)", cache.rows.len()),
        })?;

        let mut report = RowValidation::default();
        let mut mismatches = Vec::new();
        for (column, value) in chain.entries() {
            if value.value.trim().is_empty() {
                continue;
            }
            let col = cache.require_column(column)?;
            let cell = &cells[col];
            match values::compare(cell, &value.value) {
                ValueMatch::Exact => {}
                ValueMatch::SameDate => report.date_tolerances += 1,
                ValueMatch::SameAmount => report.amount_tolerances += 1,
                ValueMatch::Unfilled => report.unfilled.push(column.clone()),
                ValueMatch::Mismatch => mismatches.push(format!(
                    "{column}: ledger has `{}`, filter has `{}`",
                    cell.display(),
                    value.value.trim()
                )),
            }
        }

        if !mismatches.is_empty() {
            return Err(FilingError::ValidationMismatch {
                row,
                details: mismatches.join("; "),
            });
        }
        if report.date_tolerances > 0 {
            debug!(row, count = report.date_tolerances, "date formats differ but agree");
        }
        Ok(report)
    }

    /// Insert a row built from `values` and return it with its index.
    pub fn add_row(
        &self,
        columns: &[String],
        values: &[String],
    ) -> Result<(RowData, usize), FilingError> {
        let _gate = gate(&self.writes);
        let (source, sheet) = self.source().ok_or_else(not_loaded)?;

        let backup = backup_path(&source);
        fs::copy(&source, &backup).map_err(|err| {
            FilingError::RowCreation(format!("failed to back up {}: {err}", source.display()))
        })?;

        let inserted = match (self.write_row)(&source, &sheet, columns, values) {
            Ok(inserted) => inserted,
            Err(err) => {
                if let Err(restore_err) = fs::copy(&backup, &source) {
                    warn!(
                        ledger = %source.display(),
                        backup = %backup.display(),
                        error = %restore_err,
                        "failed to restore ledger from backup; backup kept"
                    );
                    return Err(err);
                }
                let _ = fs::remove_file(&backup);
                return Err(err);
            }
        };

        if let Err(err) = fs::remove_file(&backup) {
            warn!(backup = %backup.display(), error = %err, "failed to remove ledger backup");
        }

        let width;
        {
            let mut guard = write_lock(&self.cache);
            let cache = guard.as_mut().ok_or_else(not_loaded)?;
            width = cache.columns.len();
            let mut row = inserted.values;
            row.resize(width, CellValue::Empty);
            while cache.rows.len() < inserted.data_index {
                cache.rows.push(vec![CellValue::Empty; width]);
            }
            cache.rows.insert(inserted.data_index, row);
        }
        {
            let mut links = write_lock(&self.links);
            let shifted: HashMap<(usize, usize), Option<String>> = links
                .drain()
                .map(|((row, col), link)| {
                    if row >= inserted.data_index {
                        ((row + 1, col), link)
                    } else {
                        ((row, col), link)
                    }
                })
                .collect();
            *links = shifted;
            for col in 0..width {
                links.insert((inserted.data_index, col), None);
            }
        }

        info!(row = inserted.data_index, ledger = %source.display(), "ledger row created");
        let row = self
            .row(inserted.data_index)
            .ok_or_else(|| FilingError::RowCreation("created row vanished from cache".into()))?;
        Ok((row, inserted.data_index))
    }

    /// Point the cell at (`row`, `column`) to `target`.
    pub fn link_document(
        &self,
        row: usize,
        column: &str,
        target: &Path,
    ) -> Result<LinkOutcome, FilingError> {
        let _gate = gate(&self.writes);
        let (source, sheet, col) = self.cell_address(row, column)?;
        let link = pathutil::link_target(&source, target);

        let previous = mutate_cell(&source, &sheet, row, col, |cell| {
            let snapshot = LinkSnapshot {
                target: cell.link.clone(),
                value: cell.value.clone(),
                font: cell.font.clone(),
            };
            cell.link = Some(link.clone());
            cell.font = FontLook::hyperlink();
            snapshot
        })
        .map_err(|err| link_error(row, column, err))?;

        write_lock(&self.links).insert((row, col), Some(link.clone()));
        debug!(row, column, link = %link, "back-reference written");
        Ok(LinkOutcome { link, previous })
    }

    /// Put the cell back the way `snapshot` describes it.
    pub fn revert(
        &self,
        row: usize,
        column: &str,
        snapshot: &LinkSnapshot,
    ) -> Result<bool, FilingError> {
        let _gate = gate(&self.writes);
        let (source, sheet, col) = self.cell_address(row, column)?;

        mutate_cell(&source, &sheet, row, col, |cell| {
            cell.link = snapshot.target.clone();
            cell.value = snapshot.value.clone();
            cell.font = snapshot.font.clone();
        })
        .map_err(|err| link_error(row, column, err))?;

        if let Some(cache) = write_lock(&self.cache).as_mut() {
            if let Some(cell) = cache.rows.get_mut(row).and_then(|cells| cells.get_mut(col)) {
                *cell = snapshot.value.clone();
            }
        }
        write_lock(&self.links).insert((row, col), snapshot.target.clone());
        debug!(row, column, "back-reference reverted");
        Ok(true)
    }

    /// Current back-reference of a cell, read through the cache.
    pub fn back_reference(&self, row: usize, column: &str) -> Result<Option<String>, FilingError> {
        let (source, sheet, col) = self.cell_address(row, column)?;
        if let Some(hit) = read_lock(&self.links).get(&(row, col)) {
            return Ok(hit.clone());
        }

        let link = read_sheet(&source, &sheet)?
            .cell(row, col)
            .and_then(|cell| cell.link.clone());
        write_lock(&self.links).insert((row, col), link.clone());
        Ok(link)
    }

    /// Scan every cell of `sheet` for back-references in one pass.
    pub fn preload_back_references(
        &self,
        source: &Path,
        sheet: &str,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<usize, FilingError> {
        let sheet_data = read_sheet(source, sheet)?;

        let total = sheet_data.data_row_count();
        let mut found = HashMap::new();
        let mut linked = 0usize;
        for (data_row, cells) in sheet_data.rows.iter().skip(1).enumerate() {
            for (col, cell) in cells.iter().enumerate() {
                if cell.link.is_some() {
                    linked += 1;
                }
                found.insert((data_row, col), cell.link.clone());
            }
            let done = data_row + 1;
            if done % PROGRESS_EVERY_ROWS == 0 && done < total {
                on_progress((done * 100 / total) as u8);
            }
        }
        on_progress(100);

        *write_lock(&self.links) = found;
        info!(ledger = %source.display(), sheet, rows = total, linked, "back-references preloaded");
        Ok(linked)
    }

    fn cell_address(&self, row: usize, column: &str) -> Result<(PathBuf, String, usize), FilingError> {
        let guard = read_lock(&self.cache);
        let cache = guard.as_ref().ok_or_else(not_loaded)?;
        let col = cache
            .column_index
            .get(column)
            .copied()
            .ok_or_else(|| link_error(row, column, format!("column `{column}` not in ledger header")))?;
        if row >= cache.rows.len() {
            return Err(link_error(
                row,
                column,
                format!("row out of range ({} rows)", cache.rows.len()),
            ));
        }
        Ok((cache.source.clone(), cache.sheet.clone(), col))
    }
}

fn link_error(row: usize, column: &str, err: impl std::fmt::Display) -> FilingError {
    FilingError::Link {
        row,
        column: column.to_string(),
        message: format!("{err:#}"),
    }
}

fn read_sheet(source: &Path, sheet: &str) -> Result<workbook::Sheet, FilingError> {
    LedgerFile::open(source)
        .map_err(|err| FilingError::load(source, format!("{err:#}")))?
        .sheet(sheet)
        .ok_or_else(|| FilingError::load(source, format!("sheet `{sheet}` not found")))
}

fn mutate_cell<T>(
    source: &Path,
    sheet: &str,
    row: usize,
    col: usize,
    apply: impl FnOnce(&mut Cell) -> T,
) -> anyhow::Result<T> {
    let _lock = LedgerLock::acquire(source)?;
    let mut ledger = LedgerFile::open(source)?;
    let out = ledger.update_cell(sheet, row, col, apply)?;
    ledger.save()?;
    Ok(out)
}

fn insert_row_on_disk(
    source: &Path,
    sheet: &str,
    columns: &[String],
    values: &[String],
) -> Result<InsertedRow, FilingError> {
    let creation = |err: anyhow::Error| FilingError::RowCreation(format!("{err:#}"));
    let _lock = LedgerLock::acquire(source).map_err(creation)?;
    let mut ledger = LedgerFile::open(source).map_err(creation)?;
    let sheet_data = ledger
        .sheet(sheet)
        .ok_or_else(|| FilingError::RowCreation(format!("sheet `{sheet}` not found")))?;

    let header = sheet_data.header();
    let missing: Vec<&str> = columns
        .iter()
        .filter(|column| !header.contains(column))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        let available: Vec<&str> = header
            .iter()
            .filter(|h| !h.is_empty())
            .map(String::as_str)
            .collect();
        return Err(FilingError::RowCreation(format!(
            "columns not in ledger header: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        )));
    }

    // 1-based sheet row the new record will occupy.
    let sheet_row = sheet_data
        .tables
        .first()
        .map(|table| table.last_row + 1)
        .unwrap_or(sheet_data.rows.len() + 1)
        .max(2);

    let mut new_row = vec![Cell::default(); header.len()];
    for (column, raw) in columns.iter().zip(values) {
        let Some(col) = header.iter().position(|name| name == column) else {
            continue;
        };
        let value = values::typed_cell_value(column, raw);
        match value {
            CellValue::Date(_) => new_row[col].number_format = Some(DATE_NUMBER_FORMAT.to_string()),
            CellValue::Number(_) if values::is_amount_column(column) => {
                new_row[col].number_format = Some(AMOUNT_NUMBER_FORMAT.to_string());
            }
            _ => {}
        }
        new_row[col].value = value;
    }

    ledger
        .insert_row(sheet, sheet_row, &new_row)
        .and_then(|()| ledger.save())
        .map_err(creation)?;

    Ok(InsertedRow {
        data_index: sheet_row - 2,
        values: new_row.into_iter().map(|cell| cell.value).collect(),
    })
}
