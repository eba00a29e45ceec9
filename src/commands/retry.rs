use std::path::Path;

use anyhow::Result;

use crate::commands::{CommandReport, Session, report_task};
use crate::filer::task::TaskStatus;

pub fn run(config: Option<&Path>, id: Option<&str>) -> Result<CommandReport> {
    let mut report = CommandReport::new("retry");
    let session = Session::open(config)?;

    let queued = match id {
        Some(prefix) => match session.engine.find(prefix) {
            Some(id) => match session.engine.retry(id) {
                Ok(()) => vec![id],
                Err(err) => {
                    report.issue(err.to_string());
                    Vec::new()
                }
            },
            None => {
                report.issue(format!("no single task matches `{prefix}`"));
                Vec::new()
            }
        },
        None => {
            let failed: Vec<_> = session
                .engine
                .tasks()
                .into_iter()
                .filter(|task| task.status == TaskStatus::Failed)
                .map(|task| task.id)
                .collect();
            let count = session.engine.retry_failed();
            report.detail(format!("requeued={count}"));
            failed
        }
    };

    if !queued.is_empty() && session.drain(&mut report) {
        for id in queued {
            if let Some(task) = session.engine.task(id) {
                report_task(&mut report, &task);
            }
        }
    }
    session.close("retry")?;
    Ok(report)
}
