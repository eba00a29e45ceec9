use std::path::Path;

use anyhow::Result;

use crate::cli::FileArgs;
use crate::commands::{CommandReport, Session, report_task};
use crate::filer::task::{FilterValue, Task};

pub fn run(config: Option<&Path>, args: &FileArgs) -> Result<CommandReport> {
    let mut report = CommandReport::new("file");
    let session = Session::open(config)?;

    let filters = args.filters.iter().map(FilterValue::new).collect();
    let mut task = Task::new(&args.path, filters);
    if let Some(row) = args.row {
        task = task.with_row(row);
    }
    if let Some(angle) = args.rotate {
        task = task.with_rotation(angle);
    }
    let id = session.engine.enqueue(task);

    if session.drain(&mut report) {
        if let Some(task) = session.engine.task(id) {
            report_task(&mut report, &task);
        }
    }
    session.close("file")?;
    Ok(report)
}
