// src/export/excel.rs
use rust_xlsxwriter::{Format, Workbook};
use std::path::Path;

use crate::errors::Result;
use crate::models::ReportTable;

const MAX_SHEET_NAME: usize = 31;

/// Writes the report table as a single-sheet workbook with a bold header row.
pub fn write_workbook(table: &ReportTable, path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();

    let worksheet = workbook.add_worksheet();
    worksheet.set_name(sheet_name(&table.title))?;

    for (col, caption) in table.columns.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, caption, &bold)?;
    }

    for (index, row) in table.rows.iter().enumerate() {
        let row_number = index as u32 + 1;
        for (col, value) in row.iter().enumerate() {
            match as_number(value) {
                Some(number) => worksheet.write_number(row_number, col as u16, number)?,
                None => worksheet.write_string(row_number, col as u16, value)?,
            };
        }
    }
    worksheet.autofit();

    workbook.save(path)?;
    Ok(())
}

/// Numbers become numeric cells; zero padded keys stay text.
fn as_number(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.len() > 1 && value.starts_with('0') && !value.starts_with("0.") {
        return None;
    }
    value.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn sheet_name(title: &str) -> String {
    let name: String = title
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(MAX_SHEET_NAME)
        .collect();
    let name = name.trim().trim_matches('\'').to_string();
    if name.is_empty() { "Report".to_string() } else { name }
}
