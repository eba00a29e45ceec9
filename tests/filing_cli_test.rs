use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use predicates::prelude::*;
use tempfile::{TempDir, tempdir};
use umya_spreadsheet::{Table, TableColumn};

struct Workspace {
    tmp: TempDir,
    home: PathBuf,
    inbox: PathBuf,
    archive: PathBuf,
    ledger: PathBuf,
    config: PathBuf,
}

const COLUMNS: [&str; 4] = ["Supplier", "Number", "DATE FACTURE", "MONTANT"];

fn write_ledger(path: &Path) {
    let mut book = umya_spreadsheet::new_file_empty_worksheet();
    let sheet = book.new_sheet("Invoices").expect("sheet");
    for (col, name) in COLUMNS.iter().enumerate() {
        sheet.get_cell_mut((col as u32 + 1, 1)).set_value_string(*name);
    }
    sheet.get_cell_mut((1, 2)).set_value_string("Globex");
    sheet.get_cell_mut((2, 2)).set_value_string("INV-777");
    let date = sheet.get_cell_mut((3, 2));
    date.set_value_number(45762);
    date.get_style_mut()
        .get_number_format_mut()
        .set_format_code("dd/mm/yyyy");
    sheet.get_cell_mut((4, 2)).set_value_number(42);
    let mut table = Table::new("Ledger", ("A1", "D2"));
    for name in COLUMNS {
        table.add_column(TableColumn::new(name));
    }
    sheet.add_table(table);
    book.new_sheet("Notes").expect("notes");
    umya_spreadsheet::writer::xlsx::write(&book, path).expect("write ledger");
}

/// (Number, hyperlink) for every data row of the Invoices sheet.
fn numbers_and_links(path: &Path) -> Vec<(String, Option<String>)> {
    let book = umya_spreadsheet::reader::xlsx::read(path).expect("read ledger");
    let sheet = book.get_sheet_by_name("Invoices").expect("sheet");
    (2..=sheet.get_highest_row())
        .map(|row| {
            let cell = sheet.get_cell((2, row));
            (
                cell.map(|c| c.get_value().to_string()).unwrap_or_default(),
                cell.and_then(|c| c.get_hyperlink())
                    .map(|link| link.get_url().to_string()),
            )
        })
        .collect()
}

fn workspace() -> Workspace {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path().join("home");
    let inbox = tmp.path().join("inbox");
    let archive = tmp.path().join("archive");
    fs::create_dir_all(&home).expect("mkdir home");
    fs::create_dir_all(&inbox).expect("mkdir inbox");
    let ledger = tmp.path().join("ledger.xlsx");
    write_ledger(&ledger);

    let config = home.join("docfiler.toml");
    let toml = format!(
        r#"source_folder = '{inbox}'
processed_folder = '{archive}'
skip_folder = '{skipped}'
ledger_file = '{ledger}'
ledger_sheet = "Invoices"
output_template = "${{filter3|date.year}}/${{filter2}} ${{filter1}}.pdf"
filter1_column = "Supplier"
filter2_column = "Number"
filter3_column = "DATE FACTURE"
filter4_column = "MONTANT"

[worker]
idle_poll_ms = 10
removal_attempts = 2
removal_delay_ms = 1
"#,
        inbox = inbox.display(),
        archive = archive.display(),
        skipped = tmp.path().join("skipped").display(),
        ledger = ledger.display(),
    );
    fs::write(&config, toml).expect("write config");

    Workspace {
        tmp,
        home,
        inbox,
        archive,
        ledger,
        config,
    }
}

fn document(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("%PDF-1.4 {name}")).expect("write document");
    path
}

fn docfiler(ws: &Workspace) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("docfiler");
    cmd.current_dir(ws.tmp.path())
        .env("DOCFILER_HOME", &ws.home)
        .env("DOCFILER_CONFIG_PATH", &ws.config)
        .env("DOCFILER_LOG", "warn");
    cmd
}

fn journal(ws: &Workspace) -> serde_json::Value {
    let raw = fs::read_to_string(ws.home.join("state/docfiler_state.json")).expect("read state");
    serde_json::from_str(&raw).expect("parse state")
}

#[test]
fn file_command_creates_row_and_files_document() {
    let ws = workspace();
    let source = document(&ws.inbox, "scan.pdf");

    docfiler(&ws)
        .arg("file")
        .arg(&source)
        .args(["-f", "Acme Co", "-f", "INV-001", "-f", "15/04/2025", "-f", "1000.00"])
        .assert()
        .success()
        .stdout(predicate::str::contains("file: ok"))
        .stdout(predicate::str::contains("completed"));

    let filed = ws.archive.join("2025").join("INV-001 Acme Co.pdf");
    assert!(filed.is_file());
    assert!(!source.exists());

    let rows = numbers_and_links(&ws.ledger);
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[1],
        (
            "INV-001".to_string(),
            Some("archive/2025/INV-001 Acme Co.pdf".to_string())
        )
    );

    let state = journal(&ws);
    assert_eq!(state["tasks"][0]["status"], "completed");
    assert_eq!(state["tasks"][0]["created_row"], true);
    let audit = fs::read_to_string(ws.home.join("logs/audit.log")).expect("read audit");
    assert!(audit.contains("\"status\":\"completed\""));
}

#[test]
fn file_command_reports_mismatching_row() {
    let ws = workspace();
    let source = document(&ws.inbox, "wrong.pdf");
    let before = fs::read(&ws.ledger).expect("read ledger");

    docfiler(&ws)
        .arg("file")
        .arg(&source)
        .args(["-f", "Initech", "-f", "INV-777"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("file: failed"))
        .stdout(predicate::str::contains("Supplier"));

    assert!(source.is_file());
    assert_eq!(fs::read(&ws.ledger).expect("read ledger"), before);
    assert_eq!(journal(&ws)["tasks"][0]["status"], "failed");
}

#[test]
fn next_skips_documents_set_aside() {
    let ws = workspace();
    let first = document(&ws.inbox, "a.pdf");
    document(&ws.inbox, "b.pdf");

    docfiler(&ws)
        .arg("next")
        .assert()
        .success()
        .stdout(predicate::str::contains("a.pdf"));

    docfiler(&ws)
        .arg("skip")
        .arg(&first)
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped"));

    docfiler(&ws)
        .arg("next")
        .assert()
        .success()
        .stdout(predicate::str::contains("b.pdf"))
        .stdout(predicate::str::contains("a.pdf").not());

    let state = journal(&ws);
    let processed = state["processed_sources"].as_array().expect("processed");
    assert_eq!(processed.len(), 1);
}

#[test]
fn skip_to_folder_moves_document() {
    let ws = workspace();
    let doc = document(&ws.inbox, "junk.pdf");

    docfiler(&ws)
        .arg("skip")
        .arg(&doc)
        .arg("--to-folder")
        .assert()
        .success();

    assert!(!doc.exists());
    let moved: Vec<_> = fs::read_dir(ws.tmp.path().join("skipped"))
        .expect("skip folder")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(moved.len(), 1);
}

#[test]
fn revert_restores_document_and_ledger() {
    let ws = workspace();
    let source = document(&ws.inbox, "globex.pdf");

    docfiler(&ws)
        .arg("file")
        .arg(&source)
        .args(["-f", "Globex", "-f", "INV-777"])
        .assert()
        .success();
    assert!(!source.exists());
    assert!(numbers_and_links(&ws.ledger)[0].1.is_some());

    let id = journal(&ws)["tasks"][0]["id"]
        .as_str()
        .expect("task id")
        .to_string();
    docfiler(&ws)
        .arg("revert")
        .arg(&id[..8])
        .assert()
        .success()
        .stdout(predicate::str::contains("reverted"));

    assert!(source.is_file());
    assert_eq!(
        numbers_and_links(&ws.ledger),
        vec![("INV-777".to_string(), None)]
    );
    assert_eq!(journal(&ws)["tasks"][0]["status"], "reverted");

    docfiler(&ws)
        .arg("revert")
        .arg(&id)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("expected completed"));
}

#[test]
fn revert_keeps_a_new_scan_that_reused_the_name() {
    let ws = workspace();
    let source = document(&ws.inbox, "scan.pdf");
    docfiler(&ws)
        .arg("file")
        .arg(&source)
        .args(["-f", "Globex", "-f", "INV-777"])
        .assert()
        .success();
    fs::write(&source, "%PDF-1.4 next scan").expect("new scan");

    let id = journal(&ws)["tasks"][0]["id"]
        .as_str()
        .expect("task id")
        .to_string();
    docfiler(&ws)
        .arg("revert")
        .arg(&id)
        .assert()
        .success()
        .stdout(predicate::str::contains("reverted"));
    let warnings = journal(&ws)["tasks"][0]["warnings"].to_string();
    assert!(warnings.contains("scan_restored_"));

    assert_eq!(fs::read_to_string(&source).expect("scan"), "%PDF-1.4 next scan");
    let restored: Vec<_> = fs::read_dir(&ws.inbox)
        .expect("inbox")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.to_string_lossy().contains("scan_restored_"))
        .collect();
    assert_eq!(restored.len(), 1);
    assert_eq!(
        fs::read_to_string(&restored[0]).expect("restored"),
        "%PDF-1.4 scan.pdf"
    );
}

#[test]
fn second_session_is_refused_while_one_runs() {
    let ws = workspace();
    document(&ws.inbox, "a.pdf");
    let state = ws.home.join("state");
    fs::create_dir_all(&state).expect("state dir");
    let holder = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(state.join(".lock"))
        .expect("lock file");
    holder.try_lock_exclusive().expect("hold lock");

    docfiler(&ws)
        .arg("next")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("another docfiler session"));

    FileExt::unlock(&holder).expect("release");
    docfiler(&ws)
        .arg("next")
        .assert()
        .success()
        .stdout(predicate::str::contains("a.pdf"));
}

#[test]
fn tasks_lists_journal() {
    let ws = workspace();
    let source = document(&ws.inbox, "globex.pdf");
    docfiler(&ws)
        .arg("file")
        .arg(&source)
        .args(["-f", "Globex", "-f", "INV-777"])
        .assert()
        .success();

    docfiler(&ws)
        .args(["tasks", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"command\": \"tasks\""))
        .stdout(predicate::str::contains("globex.pdf"));

    docfiler(&ws)
        .args(["tasks", "--dismiss"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dismissed=1"));

    docfiler(&ws)
        .arg("tasks")
        .assert()
        .success()
        .stdout(predicate::str::contains("no tasks"));
}

#[test]
fn sheets_lists_names_and_columns() {
    let ws = workspace();

    docfiler(&ws)
        .arg("sheets")
        .assert()
        .success()
        .stdout(predicate::str::contains("Invoices"))
        .stdout(predicate::str::contains("Notes"));

    docfiler(&ws)
        .args(["sheets", "--sheet", "Invoices"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DATE FACTURE"));
}

#[test]
fn links_reports_missing_targets() {
    let ws = workspace();
    let source = document(&ws.inbox, "globex.pdf");
    docfiler(&ws)
        .arg("file")
        .arg(&source)
        .args(["-f", "Globex", "-f", "INV-777"])
        .assert()
        .success();

    docfiler(&ws)
        .arg("links")
        .assert()
        .success()
        .stdout(predicate::str::contains("linked_cells=1"))
        .stdout(predicate::str::contains("row 0: archive/"));

    fs::remove_dir_all(&ws.archive).expect("remove archive");
    docfiler(&ws)
        .arg("links")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("target missing"));
}

#[cfg(unix)]
#[test]
fn render_uses_placeholder_for_empty_values() {
    let ws = workspace();
    docfiler(&ws)
        .args(["render", "${a}/${b}.pdf", "-a", "a="])
        .assert()
        .success()
        .stdout(predicate::str::contains("_/_.pdf"));

    docfiler(&ws)
        .args([
            "render",
            "${d|date.year}/${s|str.upper}.pdf",
            "-a",
            "d=15/04/2025",
            "-a",
            "s=acme",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2025/ACME.pdf"));

    docfiler(&ws)
        .args(["render", "${a.pdf"])
        .assert()
        .code(2);
}

#[test]
fn status_flags_missing_configuration() {
    let ws = workspace();
    fs::write(&ws.config, "ledger_sheet = \"Invoices\"\n").expect("rewrite config");

    docfiler(&ws)
        .arg("status")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("missing output_template"))
        .stdout(predicate::str::contains("missing filter1_column"));
}

#[test]
fn batch_files_every_manifest_entry() {
    let ws = workspace();
    document(&ws.inbox, "one.pdf");
    document(&ws.inbox, "two.pdf");
    let manifest = ws.inbox.join("batch.json");
    fs::write(
        &manifest,
        r#"[
  {"path": "one.pdf", "filters": ["Acme Co", "INV-101", "01/05/2025"]},
  {"path": "two.pdf", "filters": ["Acme Co", "INV-102", "2025-06-02"]},
  {"path": "absent.pdf", "filters": ["Acme Co", "INV-103"]}
]"#,
    )
    .expect("write manifest");

    docfiler(&ws)
        .arg("batch")
        .arg(&manifest)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("queued=3"))
        .stdout(predicate::str::contains("absent.pdf"));

    assert!(ws.archive.join("2025").join("INV-101 Acme Co.pdf").is_file());
    assert!(ws.archive.join("2025").join("INV-102 Acme Co.pdf").is_file());
    let statuses: Vec<String> = journal(&ws)["tasks"]
        .as_array()
        .expect("tasks")
        .iter()
        .map(|task| task["status"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(statuses, ["completed", "completed", "failed"]);
}
