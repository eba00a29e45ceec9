//! Path templates.
//!
//! A template is literal path text with `${name}` (or `{name}`) placeholders.
//! A placeholder may pipe its value through operations, e.g.
//! `${invoice_date|date.year}/${supplier|str.upper}`. Rendering is pure: the
//! caller supplies every attribute, including the current timestamp.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{Local, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::error::FilingError;
use crate::filer::pathutil::normalize_separators;
use crate::filer::values::parse_date;

pub const PLACEHOLDER: char = '_';

const PLACEHOLDER_PATTERN: &str = r"\$?\{([^{}]*)\}";
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const ILLEGAL_LITERAL_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// A filesystem location inserted as-is apart from separator normalization.
    Path(String),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone)]
enum Working {
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Working {
    fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Date(date) => date.format("%Y-%m-%d").to_string(),
            Self::DateTime(dt) => dt.format("%Y-%m-%d").to_string(),
        }
    }

    fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Text(text) => parse_date(text),
            Self::Date(date) => Some(*date),
            Self::DateTime(dt) => Some(dt.date()),
        }
    }
}

/// Make one substituted value safe to use as (part of) a path segment.
pub fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_whitespace() && !ch.is_control() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if ch.is_control() || ILLEGAL_CHARS.contains(&ch) {
            if !out.ends_with(PLACEHOLDER) {
                out.push(PLACEHOLDER);
            }
        } else if ch == PLACEHOLDER {
            if !out.ends_with(PLACEHOLDER) {
                out.push(ch);
            }
        } else {
            out.push(ch);
        }
    }
    let trimmed = out.trim_matches(|c: char| c == PLACEHOLDER || c == '.' || c == ' ');
    if trimmed.is_empty() {
        PLACEHOLDER.to_string()
    } else {
        trimmed.to_string()
    }
}

fn checked_format<'a>(fmt: &'a str) -> Result<Vec<Item<'a>>, FilingError> {
    let items: Vec<Item<'a>> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(FilingError::PathGeneration(format!(
            "invalid date format `{fmt}`"
        )));
    }
    Ok(items)
}

fn format_working(value: &Working, fmt: &str) -> Result<String, FilingError> {
    let items = checked_format(fmt)?;
    let mut out = String::new();
    let written = match value {
        Working::DateTime(dt) => write!(out, "{}", dt.format_with_items(items.into_iter())),
        other => {
            let date = other.as_date().ok_or_else(|| {
                FilingError::PathGeneration("date operation on a non-date value".into())
            })?;
            write!(out, "{}", date.format_with_items(items.into_iter()))
        }
    };
    written.map_err(|_| {
        FilingError::PathGeneration(format!("date format `{fmt}` does not apply to this value"))
    })?;
    Ok(out)
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn apply_operation(value: Working, op: &str) -> Result<Working, FilingError> {
    let (name, args) = match op.split_once(':') {
        Some((name, args)) => (name.trim(), Some(args)),
        None => (op.trim(), None),
    };
    let out = match name {
        "date.year" => format_working(&value, "%Y")?,
        "date.month" => format_working(&value, "%m")?,
        "date.day" => format_working(&value, "%d")?,
        "date.year_month" => format_working(&value, "%Y-%m")?,
        "date.format" => format_working(&value, args.unwrap_or("%Y-%m-%d"))?,
        "str.upper" => value.into_text().to_uppercase(),
        "str.lower" => value.into_text().to_lowercase(),
        "str.title" => title_case(&value.into_text()),
        "str.first_word" => value
            .into_text()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string(),
        "str.slice" => {
            let text = value.into_text();
            let (start, end) = parse_slice_bounds(args.unwrap_or(""))?;
            let end = end.unwrap_or(usize::MAX);
            text.chars()
                .skip(start)
                .take(end.saturating_sub(start))
                .collect()
        }
        "str.replace" => {
            let (from, to) = args.and_then(|a| a.split_once(':')).ok_or_else(|| {
                FilingError::PathGeneration("str.replace needs `from:to`".into())
            })?;
            value.into_text().replace(from, to)
        }
        other => {
            return Err(FilingError::PathGeneration(format!(
                "unknown template operation `{other}`"
            )));
        }
    };
    Ok(Working::Text(out))
}

fn parse_slice_bounds(args: &str) -> Result<(usize, Option<usize>), FilingError> {
    let bad = || FilingError::PathGeneration(format!("invalid str.slice bounds `{args}`"));
    let (start, end) = args.split_once(':').unwrap_or((args, ""));
    let start = if start.trim().is_empty() {
        0
    } else {
        start.trim().parse::<usize>().map_err(|_| bad())?
    };
    let end = if end.trim().is_empty() {
        None
    } else {
        Some(end.trim().parse::<usize>().map_err(|_| bad())?)
    };
    Ok((start, end))
}

fn substitute(expression: &str, attrs: &Attributes) -> Result<String, FilingError> {
    let mut parts = expression.split('|');
    let name = parts.next().unwrap_or_default().trim();
    let Some(value) = attrs.get(name) else {
        return Ok(PLACEHOLDER.to_string());
    };

    let initial = match value {
        AttrValue::Path(path) => return Ok(path.clone()),
        AttrValue::Empty => return Ok(PLACEHOLDER.to_string()),
        AttrValue::Text(text) => Working::Text(text.clone()),
        AttrValue::Number(n) => Working::Text(crate::filer::workbook::CellValue::Number(*n).display()),
        AttrValue::Date(date) => Working::Date(*date),
        AttrValue::DateTime(dt) => Working::DateTime(*dt),
    };

    let mut working = initial;
    for op in parts {
        if op.trim().is_empty() {
            continue;
        }
        working = apply_operation(working, op)?;
    }
    Ok(sanitize_segment(&working.into_text()))
}

fn check_braces(template: &str) -> Result<(), FilingError> {
    let mut open = false;
    for ch in template.chars() {
        match ch {
            '{' if open => {
                return Err(FilingError::PathGeneration(
                    "nested `{` inside a placeholder".into(),
                ));
            }
            '{' => open = true,
            '}' if !open => {
                return Err(FilingError::PathGeneration(
                    "`}` without a matching `{`".into(),
                ));
            }
            '}' => open = false,
            _ => {}
        }
    }
    if open {
        return Err(FilingError::PathGeneration("unclosed placeholder".into()));
    }
    Ok(())
}

/// Substitute every placeholder and normalize separators to the host's.
pub fn render(template: &str, attrs: &Attributes) -> Result<String, FilingError> {
    check_braces(template)?;
    let re = Regex::new(PLACEHOLDER_PATTERN)
        .map_err(|err| FilingError::PathGeneration(err.to_string()))?;

    let mut out = String::with_capacity(template.len() + 32);
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&substitute(expr.as_str(), attrs)?);
        last = whole.end();
    }
    out.push_str(&template[last..]);

    let normalized = normalize_separators(&out);
    if normalized.is_empty() {
        return Err(FilingError::PathGeneration(format!(
            "template `{template}` rendered an empty path"
        )));
    }
    Ok(normalized)
}

/// Explain what is wrong with `template`, if anything.
pub fn check(template: &str) -> Result<(), FilingError> {
    if template.trim().is_empty() {
        return Err(FilingError::PathGeneration("template is empty".into()));
    }
    check_braces(template)?;
    let re = Regex::new(PLACEHOLDER_PATTERN)
        .map_err(|err| FilingError::PathGeneration(err.to_string()))?;

    for caps in re.captures_iter(template) {
        let name = caps
            .get(1)
            .map(|m| m.as_str().split('|').next().unwrap_or_default().trim())
            .unwrap_or_default();
        if name.is_empty() {
            return Err(FilingError::PathGeneration(
                "placeholder without a name".into(),
            ));
        }
    }

    let literal = re.replace_all(template, "");
    if let Some(bad) = literal.chars().find(|c| ILLEGAL_LITERAL_CHARS.contains(c) || c.is_control()) {
        return Err(FilingError::PathGeneration(format!(
            "illegal character `{}` in template literal",
            bad.escape_default()
        )));
    }
    Ok(())
}

pub fn validate(template: &str) -> bool {
    check(template).is_ok()
}

/// Destination used when a template cannot be rendered.
pub fn fallback_file_name(extension: &str) -> String {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let ext = extension.trim_start_matches('.');
    if ext.is_empty() {
        format!("fallback_{stamp}")
    } else {
        format!("fallback_{stamp}.{ext}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::MAIN_SEPARATOR;

    fn attrs(pairs: &[(&str, AttrValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn empty_and_missing_values_become_placeholders() {
        let a = attrs(&[("a", AttrValue::Text(String::new()))]);
        let got = render("${a}/${b}.pdf", &a).expect("render");
        assert_eq!(got, format!("_{MAIN_SEPARATOR}_.pdf"));
        assert!(!got.split(MAIN_SEPARATOR).any(str::is_empty));
    }

    #[test]
    fn render_is_deterministic_and_clean() {
        let a = attrs(&[
            ("supplier", "Acme: <Co>/\"Ltd\"?".into()),
            ("number", "INV-001".into()),
        ]);
        let first = render("${supplier}/${number}.pdf", &a).expect("render");
        let second = render("${supplier}/${number}.pdf", &a).expect("render");
        assert_eq!(first, second);
        let file_part = first.rsplit(MAIN_SEPARATOR).nth(1).expect("dir segment");
        assert!(!file_part.chars().any(|c| ILLEGAL_CHARS.contains(&c)));
        assert_eq!(file_part, "Acme_ _Co_Ltd");
    }

    #[test]
    fn dates_render_canonically_and_support_operations() {
        let a = attrs(&[
            ("filter3", "15/04/2025".into()),
            ("filter3_date", AttrValue::Date(ymd(2025, 4, 15))),
            ("filter2", "INV-001".into()),
        ]);
        assert_eq!(
            render("{filter3_date}", &a).expect("render"),
            "2025-04-15"
        );
        let got = render("${filter3|date.year}/${filter2} ${filter3|date.format:%d%m}.pdf", &a)
            .expect("render");
        assert_eq!(got, format!("2025{MAIN_SEPARATOR}INV-001 1504.pdf"));
        assert_eq!(
            render("${filter3_date|date.year_month}", &a).expect("render"),
            "2025-04"
        );
    }

    #[test]
    fn string_operations_chain() {
        let a = attrs(&[("supplier", "acme trading co".into())]);
        assert_eq!(
            render("${supplier|str.title}", &a).expect("render"),
            "Acme Trading Co"
        );
        assert_eq!(
            render("${supplier|str.first_word|str.upper}", &a).expect("render"),
            "ACME"
        );
        assert_eq!(
            render("${supplier|str.slice:0:4}", &a).expect("render"),
            "acme"
        );
        assert_eq!(
            render("${supplier|str.replace: :-}", &a).expect("render"),
            "acme-trading-co"
        );
    }

    #[test]
    fn path_attributes_are_inserted_verbatim() {
        let a = attrs(&[
            ("processed_folder", AttrValue::Path("/srv/out".into())),
            ("n", "x".into()),
        ]);
        let got = render("${processed_folder}/${n}.pdf", &a).expect("render");
        assert_eq!(
            got,
            format!("{MAIN_SEPARATOR}srv{MAIN_SEPARATOR}out{MAIN_SEPARATOR}x.pdf")
        );
    }

    #[test]
    fn bad_operations_fail_rendering() {
        let a = attrs(&[("n", "INV-001".into())]);
        assert!(matches!(
            render("${n|date.year}", &a),
            Err(FilingError::PathGeneration(_))
        ));
        assert!(render("${n|str.shout}", &a).is_err());
        assert!(render("${n", &a).is_err());
    }

    #[test]
    fn sanitizer_collapses_and_trims() {
        assert_eq!(sanitize_segment("__a::b__"), "a_b");
        assert_eq!(sanitize_segment("  spaced   out  "), "spaced out");
        assert_eq!(sanitize_segment("..."), "_");
        assert_eq!(sanitize_segment("line\nbreak"), "line_break");
        assert_eq!(sanitize_segment(""), "_");
    }

    #[test]
    fn validate_checks_literals_and_braces() {
        assert!(validate("${a}/${b|date.year}/{c}.pdf"));
        assert!(!validate("${a"));
        assert!(!validate("${a}}"));
        assert!(!validate("${}/x.pdf"));
        assert!(!validate("reports?/${a}.pdf"));
        assert!(!validate(""));
    }

    #[test]
    fn fallback_name_keeps_extension() {
        let name = fallback_file_name("pdf");
        assert!(name.starts_with("fallback_"));
        assert!(name.ends_with(".pdf"));
    }
}
