use std::path::Path;

use anyhow::Result;

use crate::commands::{CommandReport, Session, describe_task};

pub fn run(config: Option<&Path>, all: bool, dismiss: bool) -> Result<CommandReport> {
    let mut report = CommandReport::new("tasks");
    let session = Session::open(config)?;

    if dismiss {
        let hidden = session.engine.dismiss_completed();
        report.detail(format!("dismissed={hidden}"));
    }
    let tasks = if all {
        session.engine.journal()
    } else {
        session.engine.tasks()
    };
    if tasks.is_empty() {
        report.detail("no tasks");
    }
    for task in &tasks {
        report.detail(describe_task(task));
    }
    session.close("tasks")?;
    Ok(report)
}
