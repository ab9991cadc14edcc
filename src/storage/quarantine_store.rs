use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::errors::{PipelineError, Result};
use crate::models::{QuarantinedRecord, RawRecord, RuleId};

/// Bookkeeping columns written ahead of the original source headers.
pub const QUARANTINE_COLUMNS: [&str; 4] = ["__source_file__", "__source_row__", "__rules__", "__reason__"];

/// Rejected rows of one run, kept with their original text for remediation.
pub struct QuarantineStore {
    dir: PathBuf,
}

impl QuarantineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source_path: &Path, run_id: &str) -> PathBuf {
        let stem = source_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        self.dir.join(format!("{}_{}_bad_rows.csv", stem, run_id))
    }

    /// Write every rejected row. Returns `None` when there is nothing to write.
    pub fn write(
        &self,
        source_path: &Path,
        run_id: &str,
        headers: &[String],
        records: &[QuarantinedRecord],
    ) -> Result<Option<PathBuf>> {
        if records.is_empty() {
            return Ok(None);
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(source_path, run_id);
        let mut writer = csv::Writer::from_path(&path)?;

        let source_headers: Vec<&String> = headers.iter().filter(|h| !h.is_empty()).collect();
        let mut header_row: Vec<&str> = QUARANTINE_COLUMNS.to_vec();
        header_row.extend(source_headers.iter().map(|h| h.as_str()));
        writer.write_record(&header_row)?;

        for record in records {
            let rules = record
                .rules
                .iter()
                .map(RuleId::as_str)
                .collect::<Vec<_>>()
                .join(";");
            let source_row = record.raw.source_row.to_string();

            let mut row: Vec<&str> = vec![
                record.source_file.as_str(),
                source_row.as_str(),
                rules.as_str(),
                record.reason.as_str(),
            ];
            row.extend(source_headers.iter().map(|h| record.raw.get(h).unwrap_or("")));
            writer.write_record(&row)?;
        }
        writer.flush()?;

        info!("Quarantined {} rows to {}", records.len(), path.display());
        Ok(Some(path))
    }

    /// Load a quarantine file back, e.g. for inspection or remediation.
    pub fn read(path: &Path) -> Result<Vec<QuarantinedRecord>> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        if headers.len() < QUARANTINE_COLUMNS.len()
            || headers[..QUARANTINE_COLUMNS.len()] != QUARANTINE_COLUMNS
        {
            return Err(PipelineError::source_file(path, "not a quarantine file"));
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let field = |i: usize| row.get(i).unwrap_or("").to_string();

            let source_row = field(1)
                .parse::<i64>()
                .map_err(|_| PipelineError::source_file(path, format!("bad source row {:?}", field(1))))?;

            let mut raw = RawRecord::new(source_row);
            for (i, header) in headers.iter().enumerate().skip(QUARANTINE_COLUMNS.len()) {
                raw.values.insert(header.clone(), field(i));
            }

            records.push(QuarantinedRecord {
                source_file: field(0),
                raw,
                rules: field(2).split(';').filter_map(RuleId::parse).collect(),
                reason: field(3),
            });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleViolation;

    #[test]
    fn test_quarantine_keeps_original_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path());

        let headers = vec!["Review Id".to_string(), "Review Rating".to_string()];
        let mut raw = RawRecord::new(7);
        raw.values.insert("Review Id".into(), "r-9".into());
        raw.values.insert("Review Rating".into(), "six, maybe".into());
        let record = QuarantinedRecord::from_violations(
            "reviews.xlsx",
            raw,
            &[
                RuleViolation::new(RuleId::Structural, "rating: not a number"),
                RuleViolation::new(RuleId::DuplicateReviewId, "duplicate"),
            ],
        );

        let path = store
            .write(Path::new("data/raw/reviews.xlsx"), "run-1", &headers, &[record.clone()])
            .unwrap()
            .unwrap();
        assert!(path.ends_with("reviews_run-1_bad_rows.csv"));

        let loaded = QuarantineStore::read(&path).unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn test_nothing_written_without_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path().join("q"));
        let written = store.write(Path::new("a.csv"), "run-2", &[], &[]).unwrap();
        assert!(written.is_none());
        assert!(!dir.path().join("q").exists());
    }
}
