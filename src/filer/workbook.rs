//! Spreadsheet ledger adapter.
//!
//! The ledger is an `.xlsx` workbook. Reads flatten a sheet into typed
//! [`Cell`]s; writes go back through the opened workbook, so cells, styles and
//! sheets the filer never touches survive a rewrite. Sheet row numbers are
//! 1-based like a spreadsheet, so data row `i` lives on sheet row `i + 2`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{Days, NaiveDate};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use umya_spreadsheet::{Cell as XlsxCell, Color, Hyperlink, Spreadsheet, Style, Table, Worksheet};

/// Number format given to date cells written without one.
pub const ISO_DATE_FORMAT: &str = "yyyy-mm-dd";
pub const HYPERLINK_COLOR: &str = "FF0563C1";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    /// Human-readable rendering, as a spreadsheet would show the cell.
    pub fn display(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(text) => text.clone(),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Self::Number(n) => format!("{n}"),
            Self::Date(date) => date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// The part of a cell's font a back-reference changes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FontLook {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub underline: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub color: String,
}

impl FontLook {
    pub fn hyperlink() -> Self {
        Self {
            underline: "single".into(),
            color: HYPERLINK_COLOR.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cell {
    pub value: CellValue,
    pub link: Option<String>,
    pub font: FontLook,
    pub number_format: Option<String>,
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: CellValue::Text(value.into()),
            ..Self::default()
        }
    }
}

/// A declared table on a sheet, in 1-based sheet coordinates (header included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRange {
    pub name: String,
    pub first_row: usize,
    pub last_row: usize,
    pub first_col: usize,
    pub last_col: usize,
}

impl TableRange {
    /// Adjust the range for a row inserted at `sheet_row`, which becomes the
    /// new row's number. A table ending right above it grows to include it.
    pub fn accommodate_insert(&mut self, sheet_row: usize) {
        if self.last_row + 1 == sheet_row {
            self.last_row = sheet_row;
        } else if self.first_row >= sheet_row {
            self.first_row += 1;
            self.last_row += 1;
        } else if self.last_row >= sheet_row {
            self.last_row += 1;
        }
    }

    fn area(&self) -> (String, String) {
        (
            a1(self.first_col, self.first_row),
            a1(self.last_col, self.last_row),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
    pub tables: Vec<TableRange>,
}

impl Sheet {
    pub fn header(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|row| row.iter().map(|cell| cell.value.display().trim().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn data_row_count(&self) -> usize {
        self.rows.len().saturating_sub(1)
    }

    pub fn cell(&self, data_row: usize, col: usize) -> Option<&Cell> {
        self.rows.get(data_row + 1).and_then(|row| row.get(col))
    }
}

/// `A1`-style reference for 1-based (column, row).
fn a1(col: usize, row: usize) -> String {
    let mut letters = Vec::new();
    let mut n = col.max(1);
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect::<String>() + &row.to_string()
}

fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(serial.floor() as u64))
}

fn date_to_serial(date: NaiveDate) -> f64 {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .map(|epoch| (date - epoch).num_days() as f64)
        .unwrap_or_default()
}

fn is_date_format(code: &str) -> bool {
    let code = code.to_ascii_lowercase();
    code.contains('y') || (code.contains('d') && code.contains('m'))
}

fn read_font(cell: &XlsxCell) -> FontLook {
    cell.get_style()
        .get_font()
        .map(|font| {
            let underline = font.get_underline().to_string();
            FontLook {
                underline: if underline == "none" { String::new() } else { underline },
                color: font.get_color().get_argb().to_string(),
            }
        })
        .unwrap_or_default()
}

fn read_cell(cell: &XlsxCell) -> Cell {
    let number_format = cell
        .get_style()
        .get_number_format()
        .map(|format| format.get_format_code().to_string())
        .filter(|code| !code.is_empty() && !code.eq_ignore_ascii_case("general"));
    let raw = cell.get_value();
    let value = if raw.trim().is_empty() {
        CellValue::Empty
    } else if cell.get_data_type() == "n" {
        match cell.get_value_number() {
            Some(n) => number_format
                .as_deref()
                .filter(|code| is_date_format(code))
                .and_then(|_| serial_to_date(n))
                .map(CellValue::Date)
                .unwrap_or(CellValue::Number(n)),
            None => CellValue::Text(raw.to_string()),
        }
    } else {
        CellValue::Text(raw.to_string())
    };
    Cell {
        value,
        link: cell
            .get_hyperlink()
            .map(|link| link.get_url().to_string())
            .filter(|url| !url.is_empty()),
        font: read_font(cell),
        number_format,
    }
}

fn table_range(table: &Table) -> TableRange {
    let (start, end) = table.get_area();
    TableRange {
        name: table.get_name().to_string(),
        first_row: start.get_row_num().to_owned() as usize,
        last_row: end.get_row_num().to_owned() as usize,
        first_col: start.get_col_num().to_owned() as usize,
        last_col: end.get_col_num().to_owned() as usize,
    }
}

fn sheet_model(worksheet: &Worksheet) -> Sheet {
    let height = worksheet.get_highest_row();
    let width = worksheet.get_highest_column();
    let rows = (1..=height)
        .map(|row| {
            (1..=width)
                .map(|col| worksheet.get_cell((col, row)).map(read_cell).unwrap_or_default())
                .collect()
        })
        .collect();
    Sheet {
        name: worksheet.get_name().to_string(),
        rows,
        tables: worksheet.get_tables().iter().map(table_range).collect(),
    }
}

/// Rewrite the cell at (`col`, `row`) from `cell`, keeping its existing style.
fn store_cell(worksheet: &mut Worksheet, col: u32, row: u32, cell: &Cell) {
    let style: Style = worksheet
        .get_cell((col, row))
        .map(|existing| existing.get_style().clone())
        .unwrap_or_default();
    worksheet.remove_cell((col, row));
    let target = worksheet.get_cell_mut((col, row));
    target.set_style(style);

    match &cell.value {
        CellValue::Empty => {}
        CellValue::Text(text) => {
            target.set_value_string(text.clone());
        }
        CellValue::Number(n) => {
            target.set_value_number(*n);
        }
        CellValue::Date(date) => {
            target.set_value_number(date_to_serial(*date));
        }
    }

    let format = match (&cell.value, &cell.number_format) {
        (_, Some(code)) => Some(code.clone()),
        (CellValue::Date(_), None) => Some(ISO_DATE_FORMAT.to_string()),
        _ => None,
    };
    if let Some(code) = format {
        target
            .get_style_mut()
            .get_number_format_mut()
            .set_format_code(code);
    }

    if read_font(target) != cell.font {
        let font = target.get_style_mut().get_font_mut();
        if cell.font.underline.is_empty() {
            font.set_underline("none");
        } else {
            font.set_underline(cell.font.underline.clone());
        }
        if cell.font.color.is_empty() {
            *font.get_color_mut() = Color::default();
        } else {
            font.get_color_mut().set_argb(cell.font.color.clone());
        }
    }

    if let Some(url) = &cell.link {
        let mut link = Hyperlink::default();
        link.set_url(url.clone());
        target.set_hyperlink(link);
    }
}

/// An opened ledger workbook. Changes stay in memory until [`save`](Self::save).
pub struct LedgerFile {
    path: PathBuf,
    book: Spreadsheet,
}

impl LedgerFile {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("{} does not exist", path.display()));
        }
        let book = umya_spreadsheet::reader::xlsx::read(path)
            .map_err(|err| anyhow!("failed to read workbook {}: {err}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            book,
        })
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.book
            .get_sheet_collection()
            .iter()
            .map(|worksheet| worksheet.get_name().to_string())
            .collect()
    }

    pub fn sheet(&self, name: &str) -> Option<Sheet> {
        self.book.get_sheet_by_name(name).map(sheet_model)
    }

    fn worksheet_mut(&mut self, name: &str) -> Result<&mut Worksheet> {
        self.book
            .get_sheet_by_name_mut(name)
            .ok_or_else(|| anyhow!("sheet `{name}` not found"))
    }

    /// Apply `edit` to the cell at (data row, column) and write the result back.
    pub fn update_cell<T>(
        &mut self,
        sheet: &str,
        data_row: usize,
        col: usize,
        edit: impl FnOnce(&mut Cell) -> T,
    ) -> Result<T> {
        let worksheet = self.worksheet_mut(sheet)?;
        let (x, y) = (col as u32 + 1, data_row as u32 + 2);
        let mut cell = worksheet.get_cell((x, y)).map(read_cell).unwrap_or_default();
        let out = edit(&mut cell);
        store_cell(worksheet, x, y, &cell);
        Ok(out)
    }

    /// Insert `cells` as a new row at 1-based `sheet_row`. Rows from there on
    /// move down, the row above lends its styles, and tables are resized.
    pub fn insert_row(&mut self, sheet: &str, sheet_row: usize, cells: &[Cell]) -> Result<()> {
        let worksheet = self.worksheet_mut(sheet)?;
        let ranges: Vec<TableRange> = worksheet
            .get_tables()
            .iter()
            .map(|table| {
                let mut range = table_range(table);
                range.accommodate_insert(sheet_row);
                range
            })
            .collect();

        let row = sheet_row as u32;
        if row <= worksheet.get_highest_row() {
            worksheet.insert_new_row(&row, &1);
        }
        for (idx, cell) in cells.iter().enumerate() {
            let col = idx as u32 + 1;
            if row > 2 {
                let lent = worksheet
                    .get_cell((col, row - 1))
                    .map(|above| above.get_style().clone());
                if let Some(style) = lent {
                    worksheet.get_cell_mut((col, row)).set_style(style);
                }
            }
            store_cell(worksheet, col, row, cell);
        }

        for (table, range) in worksheet.get_tables_mut().iter_mut().zip(&ranges) {
            let (start, end) = range.area();
            table.set_area((start.as_str(), end.as_str()));
        }
        Ok(())
    }

    /// Replace the file atomically: write a sibling temp file, then persist it
    /// over the original.
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::Builder::new()
            .prefix(".docfiler-ledger")
            .suffix(".xlsx")
            .tempfile_in(parent)
            .with_context(|| format!("failed to stage ledger in {}", parent.display()))?;
        umya_spreadsheet::writer::xlsx::write(&self.book, tmp.path())
            .map_err(|err| anyhow!("failed to write workbook {}: {err}", self.path.display()))?;
        tmp.persist(&self.path)
            .map_err(|err| anyhow!("failed to replace {}: {}", self.path.display(), err.error))?;
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    path.with_file_name(format!(".{name}.lock"))
}

/// Advisory lock held for the duration of a ledger rewrite.
pub struct LedgerLock {
    file: File,
}

impl LedgerLock {
    pub fn acquire(ledger: &Path) -> Result<Self> {
        let path = lock_path(ledger);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn sheet_names(path: &Path) -> Result<Vec<String>> {
    Ok(LedgerFile::open(path)?.sheet_names())
}

pub fn sheet_columns(path: &Path, sheet: &str) -> Result<Vec<String>> {
    let sheet = LedgerFile::open(path)?
        .sheet(sheet)
        .ok_or_else(|| anyhow!("sheet `{sheet}` not found in {}", path.display()))?;
    Ok(sheet
        .header()
        .into_iter()
        .filter(|name| !name.is_empty())
        .collect())
}

/// Write `sheets` as a fresh workbook.
#[cfg(test)]
pub fn create(path: &Path, sheets: &[Sheet]) -> Result<()> {
    let mut book = umya_spreadsheet::new_file_empty_worksheet();
    for sheet in sheets {
        let worksheet = book
            .new_sheet(sheet.name.clone())
            .map_err(|err| anyhow!("failed to add sheet `{}`: {err}", sheet.name))?;
        for (r, row) in sheet.rows.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if *cell != Cell::default() {
                    store_cell(worksheet, c as u32 + 1, r as u32 + 1, cell);
                }
            }
        }
        let header = sheet.header();
        for range in &sheet.tables {
            let (start, end) = range.area();
            let mut table = Table::new(&range.name, (start.as_str(), end.as_str()));
            for col in range.first_col..=range.last_col {
                let name = header
                    .get(col - 1)
                    .cloned()
                    .unwrap_or_else(|| format!("Column{col}"));
                table.add_column(umya_spreadsheet::TableColumn::new(&name));
            }
            worksheet.add_table(table);
        }
    }
    umya_spreadsheet::writer::xlsx::write(&book, path)
        .map_err(|err| anyhow!("failed to write workbook {}: {err}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Vec<Sheet> {
        vec![
            Sheet {
                name: "Invoices".into(),
                rows: vec![
                    vec![Cell::text("Supplier"), Cell::text("Number"), Cell::text("DATE")],
                    vec![
                        Cell::text("Acme Co"),
                        Cell::text("INV-000"),
                        Cell {
                            value: CellValue::Date(NaiveDate::from_ymd_opt(2025, 4, 15).expect("date")),
                            number_format: Some("dd/mm/yyyy".into()),
                            ..Cell::default()
                        },
                    ],
                    vec![Cell::text("Total"), Cell::default(), Cell::default()],
                ],
                tables: vec![TableRange {
                    name: "Ledger".into(),
                    first_row: 1,
                    last_row: 2,
                    first_col: 1,
                    last_col: 3,
                }],
            },
            Sheet {
                name: "Notes".into(),
                rows: vec![vec![Cell::text("Memo")]],
                tables: Vec::new(),
            },
        ]
    }

    #[test]
    fn open_reads_cells_dates_and_tables() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.xlsx");
        create(&path, &sample()).expect("create");

        let ledger = LedgerFile::open(&path).expect("open");
        assert_eq!(ledger.sheet_names(), vec!["Invoices", "Notes"]);
        let sheet = ledger.sheet("Invoices").expect("sheet");
        assert_eq!(sheet.header(), vec!["Supplier", "Number", "DATE"]);
        assert_eq!(sheet.data_row_count(), 2);
        assert_eq!(
            sheet.cell(0, 2).map(|c| c.value.clone()),
            Some(CellValue::Date(NaiveDate::from_ymd_opt(2025, 4, 15).expect("date")))
        );
        assert_eq!(sheet.tables[0].last_row, 2);
        assert_eq!(
            sheet_columns(&path, "Invoices").expect("columns"),
            vec!["Supplier", "Number", "DATE"]
        );
        assert!(sheet_columns(&path, "Missing").is_err());
    }

    #[test]
    fn non_workbook_file_is_rejected() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.xlsx");
        std::fs::write(&path, b"{\"sheets\": []}").expect("write");
        assert!(LedgerFile::open(&path).is_err());
        assert!(LedgerFile::open(&tmp.path().join("absent.xlsx")).is_err());
    }

    #[test]
    fn updated_cell_keeps_link_and_font_until_restored() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.xlsx");
        create(&path, &sample()).expect("create");

        let mut ledger = LedgerFile::open(&path).expect("open");
        let before = ledger
            .update_cell("Invoices", 0, 1, |cell| {
                let before = cell.clone();
                cell.link = Some("archive/INV-000.pdf".into());
                cell.font = FontLook::hyperlink();
                before
            })
            .expect("link");
        ledger.save().expect("save");

        let linked = LedgerFile::open(&path).expect("reopen");
        let cell = linked
            .sheet("Invoices")
            .and_then(|s| s.cell(0, 1).cloned())
            .expect("cell");
        assert_eq!(cell.link.as_deref(), Some("archive/INV-000.pdf"));
        assert_eq!(cell.font, FontLook::hyperlink());
        assert_eq!(cell.value, CellValue::Text("INV-000".into()));

        let mut ledger = linked;
        ledger
            .update_cell("Invoices", 0, 1, |cell| *cell = before.clone())
            .expect("restore");
        ledger.save().expect("save");
        let restored = LedgerFile::open(&path)
            .expect("reopen")
            .sheet("Invoices")
            .and_then(|s| s.cell(0, 1).cloned())
            .expect("cell");
        assert_eq!(restored.link, None);
        assert_eq!(restored.value, before.value);
    }

    #[test]
    fn inserted_row_shifts_rows_below_and_grows_table() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.xlsx");
        create(&path, &sample()).expect("create");

        let mut ledger = LedgerFile::open(&path).expect("open");
        ledger
            .insert_row(
                "Invoices",
                3,
                &[Cell::text("Globex"), Cell::text("INV-001"), Cell::default()],
            )
            .expect("insert");
        ledger.save().expect("save");

        let sheet = LedgerFile::open(&path)
            .expect("reopen")
            .sheet("Invoices")
            .expect("sheet");
        assert_eq!(sheet.data_row_count(), 3);
        assert_eq!(sheet.cell(1, 1).map(|c| c.value.display()), Some("INV-001".into()));
        assert_eq!(sheet.cell(2, 0).map(|c| c.value.display()), Some("Total".into()));
        assert_eq!(sheet.tables[0].last_row, 3);
    }

    #[test]
    fn table_ranges_follow_inserted_rows() {
        let mut ending_above = TableRange {
            name: "t".into(),
            first_row: 1,
            last_row: 4,
            first_col: 1,
            last_col: 3,
        };
        ending_above.accommodate_insert(5);
        assert_eq!((ending_above.first_row, ending_above.last_row), (1, 5));
        assert_eq!(ending_above.area(), ("A1".to_string(), "C5".to_string()));

        let mut below = TableRange {
            name: "below".into(),
            first_row: 8,
            last_row: 10,
            first_col: 1,
            last_col: 3,
        };
        below.accommodate_insert(5);
        assert_eq!((below.first_row, below.last_row), (9, 11));

        let mut above = TableRange {
            name: "above".into(),
            first_row: 1,
            last_row: 2,
            first_col: 1,
            last_col: 3,
        };
        above.accommodate_insert(5);
        assert_eq!((above.first_row, above.last_row), (1, 2));
    }

    #[test]
    fn serials_and_references_match_spreadsheet_numbering() {
        let date = NaiveDate::from_ymd_opt(2025, 4, 15).expect("date");
        assert_eq!(date_to_serial(date), 45762.0);
        assert_eq!(serial_to_date(45762.0), Some(date));
        assert_eq!(a1(1, 1), "A1");
        assert_eq!(a1(27, 3), "AA3");
        assert!(is_date_format("DD/MM/YYYY"));
        assert!(!is_date_format("#,##0.00"));
    }

    #[test]
    fn lock_is_reentrant_after_drop() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.xlsx");
        drop(LedgerLock::acquire(&path).expect("first lock"));
        let _again = LedgerLock::acquire(&path).expect("second lock");
    }
}
