// src/export/mod.rs
//! Downloadable artifacts. Every export is rendered into a temporary file,
//! read back as base64 and the file is removed before returning.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;

use crate::errors::Result;

pub mod excel;
pub mod pdf;

/// Renders into a temporary file named after the report and returns the
/// file's bytes; the file is gone when this returns.
pub fn render_artifact<F>(temp_dir: &Path, report: &str, extension: &str, render: F) -> Result<Vec<u8>>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let file = tempfile::Builder::new()
        .prefix(&format!("{}-", file_stem(report)))
        .suffix(extension)
        .tempfile_in(temp_dir)?;

    // on error the NamedTempFile is dropped and deletes itself
    render(file.path())?;
    let bytes = std::fs::read(file.path())?;
    file.close()?;

    Ok(bytes)
}

pub fn to_base64_artifact<F>(temp_dir: &Path, report: &str, extension: &str, render: F) -> Result<String>
where
    F: FnOnce(&Path) -> Result<()>,
{
    render_artifact(temp_dir, report, extension, render).map(|bytes| STANDARD.encode(bytes))
}

/// Report names come from the request; keep them safe as a file name prefix.
fn file_stem(report: &str) -> String {
    let stem: String = report
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(40)
        .collect();
    if stem.is_empty() { "report".to_string() } else { stem }
}
