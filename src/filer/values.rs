use chrono::{NaiveDate, NaiveDateTime};

use crate::filer::workbook::CellValue;

/// Textual date layouts accepted for ledger values, tried in order.
pub const DATE_FORMATS: &[&str] = &[
    "%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%Y/%m/%d", "%d_%m_%Y", "%d.%m.%Y",
];

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d/%m/%Y %H:%M:%S"];

const AMOUNT_EPSILON: f64 = 0.005;

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(date);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt.date());
        }
    }
    None
}

/// Parse a decimal amount written with arbitrary grouping and either `,` or
/// `.` as decimal separator. The last separator present is the decimal one.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '€' | '$' | '£' | '\u{a0}' | '\u{202f}'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replacen(',', ".", 1),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) if cleaned.matches(',').count() == 1 => cleaned.replace(',', "."),
        (Some(_), None) => cleaned.replace(',', ""),
        (None, Some(_)) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn is_date_column(name: &str) -> bool {
    name.to_ascii_uppercase().contains("DATE")
}

pub fn is_amount_column(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.contains("MNT") || upper.contains("MONTANT") || upper.contains("AMOUNT")
}

/// Convert a raw filter value into the cell type its column calls for.
pub fn typed_cell_value(column: &str, raw: &str) -> CellValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return CellValue::Empty;
    }
    if is_date_column(column) {
        if let Some(date) = parse_date(trimmed) {
            return CellValue::Date(date);
        }
    }
    if is_amount_column(column) {
        if let Some(amount) = parse_amount(trimmed) {
            return CellValue::Number(amount);
        }
    }
    CellValue::Text(trimmed.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMatch {
    Exact,
    SameDate,
    SameAmount,
    /// The ledger cell holds nothing to compare against.
    Unfilled,
    Mismatch,
}

pub fn compare(cell: &CellValue, wanted: &str) -> ValueMatch {
    let wanted = wanted.trim();
    if cell.is_empty() {
        return ValueMatch::Unfilled;
    }
    if cell.display().trim() == wanted {
        return ValueMatch::Exact;
    }

    let cell_date = match cell {
        CellValue::Date(date) => Some(*date),
        CellValue::Text(text) => parse_date(text),
        _ => None,
    };
    if let (Some(left), Some(right)) = (cell_date, parse_date(wanted)) {
        return if left == right {
            ValueMatch::SameDate
        } else {
            ValueMatch::Mismatch
        };
    }

    let cell_amount = match cell {
        CellValue::Number(n) => Some(*n),
        CellValue::Text(text) => parse_amount(text),
        _ => None,
    };
    if let (Some(left), Some(right)) = (cell_amount, parse_amount(wanted)) {
        if (left - right).abs() < AMOUNT_EPSILON {
            return ValueMatch::SameAmount;
        }
    }
    ValueMatch::Mismatch
}
