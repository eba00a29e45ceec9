use std::path::Path;

use anyhow::Result;

use crate::commands::{CommandReport, Session};

pub fn run(config: Option<&Path>) -> Result<CommandReport> {
    let mut report = CommandReport::new("next");
    let session = Session::open(config)?;
    match session.engine.next_document() {
        Ok(Some(path)) => report.detail(format!("next={}", path.display())),
        Ok(None) => report.detail("no documents waiting"),
        Err(err) => report.issue(err.to_string()),
    }
    session.close("next")?;
    Ok(report)
}
