use std::path::Path;

use anyhow::Result;

use crate::commands::{CommandReport, Session, describe_task};

pub fn run(config: Option<&Path>, prefix: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("revert");
    let session = Session::open(config)?;

    match session.engine.find(prefix) {
        Some(id) => match session.engine.revert(id) {
            Ok(()) => {
                if let Some(task) = session.engine.task(id) {
                    report.detail(describe_task(&task));
                }
            }
            Err(err) => report.issue(err.to_string()),
        },
        None => report.issue(format!("no single task matches `{prefix}`")),
    }
    session.close("revert")?;
    Ok(report)
}
