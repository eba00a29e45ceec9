use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::commands::{self, CommandReport};
use crate::logging;

/// File incoming documents against a tabular ledger.
#[derive(Parser, Debug)]
#[command(name = "docfiler", version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: $DOCFILER_HOME/docfiler.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// File one document against the ledger
    #[command(after_help = r#"EXAMPLES:
    docfiler file inbox/scan.pdf -f "Acme Co" -f INV-001 -f 15/04/2025 -f 1000.00
    docfiler file inbox/scan.pdf -f Acme -f INV-001 --row 12 --rotate 90
"#)]
    File(FileArgs),

    /// File every document listed in a JSON manifest
    Batch {
        manifest: PathBuf,
    },

    /// Show the next document waiting in the source folder
    Next,

    /// Set a document aside without filing it
    Skip {
        path: PathBuf,
        /// Move it to the skip folder instead of only marking it processed
        #[arg(long)]
        to_folder: bool,
    },

    /// List filing tasks from the journal
    Tasks {
        /// Include dismissed tasks
        #[arg(long)]
        all: bool,
        /// Hide completed, skipped and reverted tasks from future listings
        #[arg(long, conflicts_with = "all")]
        dismiss: bool,
    },

    /// Queue failed tasks again
    Retry {
        /// Task id or unique prefix; omit to retry every failed task
        id: Option<String>,
    },

    /// Undo a completed task: restore the ledger cell and the document
    Revert {
        id: String,
    },

    /// List back-references recorded in the ledger
    Links,

    /// List ledger sheets, or the columns of one sheet
    Sheets {
        /// Ledger file (default: configured ledger_file)
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Show the header columns of this sheet
        #[arg(long)]
        sheet: Option<String>,
    },

    /// Render a path template with the given attributes
    #[command(after_help = r#"EXAMPLES:
    docfiler render '${date|date.year}/${supplier|str.upper}.pdf' -a date=15/04/2025 -a supplier=acme
"#)]
    Render {
        template: String,
        /// Attribute as name=value
        #[arg(short = 'a', long = "attr", value_name = "NAME=VALUE")]
        attrs: Vec<String>,
    },

    /// Show resolved paths, configuration and journal counts
    Status,
}

#[derive(Args, Debug)]
pub struct FileArgs {
    pub path: PathBuf,
    /// Filter values in column order; the second is the discriminating key
    #[arg(short = 'f', long = "filter", required = true)]
    pub filters: Vec<String>,
    /// Ledger row the document belongs to (0-based data row)
    #[arg(long)]
    pub row: Option<usize>,
    /// Page rotation in degrees, a multiple of 90
    #[arg(long, allow_hyphen_values = true)]
    pub rotate: Option<i32>,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let verdict = if report.ok { "ok" } else { "failed" };
    println!("{}: {verdict}", report.command);
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  ! {issue}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = cli.config.as_deref();

    let report = match cli.command {
        Command::File(args) => commands::file::run(config, &args)?,
        Command::Batch { manifest } => commands::batch::run(config, &manifest)?,
        Command::Next => commands::next::run(config)?,
        Command::Skip { path, to_folder } => commands::skip::run(config, &path, to_folder)?,
        Command::Tasks { all, dismiss } => commands::tasks::run(config, all, dismiss)?,
        Command::Retry { id } => commands::retry::run(config, id.as_deref())?,
        Command::Revert { id } => commands::revert::run(config, &id)?,
        Command::Links => commands::links::run(config)?,
        Command::Sheets { ledger, sheet } => {
            commands::sheets::run(config, ledger.as_deref(), sheet.as_deref())?
        }
        Command::Render { template, attrs } => commands::render::run(&template, &attrs)?,
        Command::Status => commands::status::run(config)?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        std::process::exit(2);
    }
    Ok(())
}
