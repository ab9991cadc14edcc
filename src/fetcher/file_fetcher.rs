use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use calamine::{Data, Reader, open_workbook_auto};
use glob::glob;
use tracing::{info, warn};

use crate::errors::{PipelineError, Result};
use crate::models::RawRecord;

const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "xlsb", "ods"];

/// Header row plus data rows of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRecord>,
}

/// Expand every pattern and return the matching files, sorted and de-duplicated.
pub fn discover_files(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();

    for pattern in patterns.iter().filter(|p| !p.trim().is_empty()) {
        for entry in glob(pattern)? {
            match entry {
                Ok(path) if path.is_file() => {
                    files.insert(path);
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable path for pattern {}: {}", pattern, e),
            }
        }
    }

    info!("Discovered {} source files", files.len());
    Ok(files.into_iter().collect())
}

/// Read a source file into raw text rows. The format follows the file extension.
pub fn read_source(path: &Path) -> Result<SourceTable> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let table = if extension == "csv" {
        read_csv(path)?
    } else if SPREADSHEET_EXTENSIONS.contains(&extension.as_str()) {
        read_workbook(path)?
    } else {
        return Err(PipelineError::source_file(
            path,
            format!("unsupported file type: {:?}", extension),
        ));
    };

    info!(
        "Read {} rows ({} columns) from {}",
        table.rows.len(),
        table.headers.len(),
        path.display()
    );
    Ok(table)
}

fn read_csv(path: &Path) -> Result<SourceTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut rows = Vec::new();
    // Byte records, so one badly encoded row is quarantined instead of failing the file.
    for (index, record) in reader.byte_records().enumerate() {
        let record = record?;
        // Header occupies row 1.
        let mut raw = RawRecord::new(index as i64 + 2);
        for (header, bytes) in headers.iter().zip(record.iter()) {
            let value = match std::str::from_utf8(bytes) {
                Ok(text) => text.to_string(),
                Err(e) => {
                    raw.encoding_error
                        .get_or_insert_with(|| format!("invalid UTF-8 in column {:?}: {}", header, e));
                    String::from_utf8_lossy(bytes).into_owned()
                }
            };
            raw.values.insert(header.clone(), value);
        }
        if raw.encoding_error.is_some() {
            warn!("Row {} of {} is not valid UTF-8", raw.source_row, path.display());
        }
        if !raw.is_blank() {
            rows.push(raw);
        }
    }

    Ok(SourceTable { headers, rows })
}

/// First sheet only; row 1 is the header.
fn read_workbook(path: &Path) -> Result<SourceTable> {
    let mut workbook = open_workbook_auto(path)?;

    let sheet_names = workbook.sheet_names().to_vec();
    let Some(sheet_name) = sheet_names.first() else {
        return Err(PipelineError::source_file(path, "workbook has no sheets"));
    };

    let range = workbook.worksheet_range(sheet_name)?;
    let mut sheet_rows = range.rows();

    let Some(header_row) = sheet_rows.next() else {
        return Ok(SourceTable::default());
    };
    let headers: Vec<String> = header_row.iter().map(|cell| cell_to_text(cell).trim().to_string()).collect();

    // Sheets may not start at A1.
    let first_row = range.start().map(|(row, _)| row as i64 + 1).unwrap_or(1);

    let mut rows = Vec::new();
    for (offset, cells) in sheet_rows.enumerate() {
        let mut raw = RawRecord::new(first_row + offset as i64 + 1);
        for (header, cell) in headers.iter().zip(cells.iter()) {
            if header.is_empty() {
                continue;
            }
            raw.values.insert(header.clone(), cell_to_text(cell));
        }
        if !raw.is_blank() {
            rows.push(raw);
        }
    }

    Ok(SourceTable { headers, rows })
}

/// Render a cell the way a human would have typed it: integral floats lose
/// their decimals, date cells become ISO text.
pub(crate) fn cell_to_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|naive| naive.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_else(|| dt.as_f64().to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERROR {:?}", e),
    }
}
