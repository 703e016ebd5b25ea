//! Failure evidence: `output.txt` plus an `index.html` linking every file in
//! the run directory.

use std::path::{Path, PathBuf};

use askama::Template;
use thiserror::Error;
use tracing::info;

use crate::archive::RunDates;

/// Captured output, headed by the failure message.
pub const OUTPUT_FILE: &str = "output.txt";
/// Generated listing of the run directory.
pub const INDEX_FILE: &str = "index.html";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list run directory {}: {source}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render index page: {0}")]
    Render(#[from] askama::Error),
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexPage<'a> {
    date_local: &'a str,
    date_global: &'a str,
    files: &'a [String],
}

/// Write `output.txt` and `index.html` into `run_dir` and return the public
/// link to the run: `base_url` followed by the directory name.
///
/// The link is built textually; nothing checks that it resolves.
pub fn build_failure_report(
    run_dir: &Path,
    message: &str,
    output: &str,
    dates: &RunDates,
    display_format: &str,
    base_url: &str,
) -> Result<String, ReportError> {
    let output_path = run_dir.join(OUTPUT_FILE);
    write_file(&output_path, &format!("{message}\n{output}"))?;

    let files = list_files(run_dir)?;
    let date_local = dates.local_display(display_format);
    let date_global = dates.global_display(display_format);
    let html = IndexPage {
        date_local: &date_local,
        date_global: &date_global,
        files: &files,
    }
    .render()?;
    write_file(&run_dir.join(INDEX_FILE), &html)?;

    let url = report_url(base_url, run_dir);
    info!(run_dir = %run_dir.display(), files = files.len(), %url, "failure report written");
    Ok(url)
}

/// `base_url` with the run directory's name appended verbatim.
pub fn report_url(base_url: &str, run_dir: &Path) -> String {
    let name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{base_url}{name}")
}

/// Names of the entries in `dir`, sorted.
fn list_files(dir: &Path) -> Result<Vec<String>, ReportError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ReportError::List {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ReportError::List {
            path: dir.to_path_buf(),
            source,
        })?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn write_file(path: &Path, content: &str) -> Result<(), ReportError> {
    std::fs::write(path, content).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
