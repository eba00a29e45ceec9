use std::path::Path;

use anyhow::Result;

use crate::commands::{CommandReport, Session, describe_task};
use crate::filer::task::SkipMode;

pub fn run(config: Option<&Path>, path: &Path, to_folder: bool) -> Result<CommandReport> {
    let mut report = CommandReport::new("skip");
    let mode = if to_folder {
        SkipMode::ToFolder
    } else {
        SkipMode::InPlace
    };
    let session = Session::open(config)?;
    match session.engine.skip(path, mode) {
        Ok(id) => {
            if let Some(task) = session.engine.task(id) {
                report.detail(describe_task(&task));
            }
        }
        Err(err) => report.issue(format!("{}: {err}", path.display())),
    }
    session.close("skip")?;
    Ok(report)
}
