use anyhow::Result;

use crate::commands::CommandReport;
use crate::filer::template::{self, AttrValue, Attributes};

fn parse_attrs(raw: &[String], report: &mut CommandReport) -> Attributes {
    let mut attrs = Attributes::new();
    for pair in raw {
        match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                let value = if value.is_empty() {
                    AttrValue::Empty
                } else {
                    AttrValue::from(value)
                };
                attrs.insert(name.trim().to_string(), value);
            }
            _ => report.issue(format!("attribute `{pair}` is not name=value")),
        }
    }
    attrs
}

pub fn run(template_text: &str, raw_attrs: &[String]) -> Result<CommandReport> {
    let mut report = CommandReport::new("render");
    if let Err(err) = template::check(template_text) {
        report.issue(err.to_string());
        return Ok(report);
    }
    let attrs = parse_attrs(raw_attrs, &mut report);
    match template::render(template_text, &attrs) {
        Ok(path) => report.detail(path),
        Err(err) => report.issue(err.to_string()),
    }
    Ok(report)
}
