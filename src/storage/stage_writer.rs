use std::fs::{self, File};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{PipelineError, Result};
use crate::models::{Lineage, StagedRecord};
use crate::processor::{format_timestamp, parse_timestamp};

/// Column order of the staged layer, identical in every format.
pub const STAGE_COLUMNS: [&str; 14] = [
    "review_id",
    "user_id",
    "business_id",
    "review_date",
    "review_rating",
    "review_title",
    "review_content",
    "review_ip_address",
    "email_address",
    "user_name",
    "reviewer_country",
    "business_name",
    "source_file",
    "source_row",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFormat {
    Parquet,
    Csv,
}

impl StageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StageFormat::Parquet => "parquet",
            StageFormat::Csv => "csv",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            "parquet" => Some(StageFormat::Parquet),
            "csv" => Some(StageFormat::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageArtifact {
    pub path: PathBuf,
    pub format: StageFormat,
    pub rows: usize,
}

/// Materializes a run's accepted rows as the replayable stage checkpoint.
pub struct StageWriter {
    stage_dir: PathBuf,
    columnar: bool,
}

impl StageWriter {
    pub fn new(stage_dir: impl Into<PathBuf>, columnar: bool) -> Self {
        Self {
            stage_dir: stage_dir.into(),
            columnar,
        }
    }

    /// Write `records` under `<stage_dir>/<run_key>.<ext>`. Parquet first, CSV
    /// when Parquet is disabled or fails.
    pub fn write(&self, run_key: &str, records: &[StagedRecord]) -> Result<StageArtifact> {
        fs::create_dir_all(&self.stage_dir)?;
        let mut df = records_to_dataframe(records)?;

        let columnar_error = if self.columnar {
            let path = self.artifact_path(run_key, StageFormat::Parquet);
            match write_parquet(&path, &mut df) {
                Ok(()) => {
                    info!("Staged {} rows as Parquet at {}", records.len(), path.display());
                    return Ok(StageArtifact {
                        path,
                        format: StageFormat::Parquet,
                        rows: records.len(),
                    });
                }
                Err(e) => {
                    warn!("Parquet stage write failed ({}); falling back to CSV", e);
                    let _ = fs::remove_file(&path);
                    e.to_string()
                }
            }
        } else {
            "columnar staging disabled".to_string()
        };

        let path = self.artifact_path(run_key, StageFormat::Csv);
        match write_csv(&path, &mut df) {
            Ok(()) => {
                info!("Staged {} rows as CSV at {}", records.len(), path.display());
                Ok(StageArtifact {
                    path,
                    format: StageFormat::Csv,
                    rows: records.len(),
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(PipelineError::StageWrite {
                    columnar: columnar_error,
                    fallback: e.to_string(),
                })
            }
        }
    }

    fn artifact_path(&self, run_key: &str, format: StageFormat) -> PathBuf {
        self.stage_dir.join(format!("{}.{}", run_key, format.extension()))
    }
}

fn write_parquet(path: &Path, df: &mut DataFrame) -> Result<()> {
    let file = File::create(path)?;
    ParquetWriter::new(file).finish(df)?;
    Ok(())
}

fn write_csv(path: &Path, df: &mut DataFrame) -> Result<()> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

fn records_to_dataframe(records: &[StagedRecord]) -> Result<DataFrame> {
    let text = |f: fn(&StagedRecord) -> &String| -> Vec<String> { records.iter().map(|r| f(r).clone()).collect() };
    let optional = |f: fn(&StagedRecord) -> &Option<String>| -> Vec<Option<String>> {
        records.iter().map(|r| f(r).clone()).collect()
    };

    let review_dates: Vec<String> = records.iter().map(|r| format_timestamp(&r.reviewed_at)).collect();
    let ratings: Vec<i64> = records.iter().map(|r| i64::from(r.rating)).collect();
    let source_rows: Vec<i64> = records.iter().map(|r| r.lineage.source_row).collect();

    let df = df!(
        "review_id" => text(|r| &r.review_id),
        "user_id" => text(|r| &r.reviewer_id),
        "business_id" => text(|r| &r.business_id),
        "review_date" => review_dates,
        "review_rating" => ratings,
        "review_title" => optional(|r| &r.title),
        "review_content" => optional(|r| &r.content),
        "review_ip_address" => optional(|r| &r.ip_address),
        "email_address" => optional(|r| &r.email),
        "user_name" => optional(|r| &r.reviewer_name),
        "reviewer_country" => optional(|r| &r.reviewer_country),
        "business_name" => optional(|r| &r.business_name),
        "source_file" => text(|r| &r.lineage.source_file),
        "source_row" => source_rows,
    )?;

    Ok(df)
}

/// Read a stage artifact back into records. The format is taken from the
/// file extension; both formats yield the same records.
pub fn read_stage(path: &Path) -> Result<Vec<StagedRecord>> {
    let format = StageFormat::from_path(path)
        .ok_or_else(|| PipelineError::source_file(path, "not a recognised stage artifact"))?;

    let df = match format {
        StageFormat::Parquet => ParquetReader::new(File::open(path)?).finish()?,
        StageFormat::Csv => CsvReadOptions::default()
            .with_has_header(true)
            // Read every column as text so identifiers are never coerced.
            .with_infer_schema_length(Some(0))
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?,
    };

    dataframe_to_records(path, &df)
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let column = df.column(name)?.cast(&DataType::String)?;
    Ok(column
        .str()?
        .into_iter()
        .map(|v| v.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string))
        .collect())
}

fn dataframe_to_records(path: &Path, df: &DataFrame) -> Result<Vec<StagedRecord>> {
    let mut columns = Vec::with_capacity(STAGE_COLUMNS.len());
    for name in STAGE_COLUMNS {
        columns.push(string_column(df, name)?);
    }

    let required = |column: usize, row: usize| -> Result<String> {
        columns[column][row].clone().ok_or_else(|| {
            PipelineError::source_file(
                path,
                format!("row {}: missing {}", row, STAGE_COLUMNS[column]),
            )
        })
    };
    let invalid = |row: usize, what: &str, value: &str| {
        PipelineError::source_file(path, format!("row {}: invalid {} {:?}", row, what, value))
    };

    let mut records = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let review_date = required(3, row)?;
        let rating = required(4, row)?;
        let source_row = required(13, row)?;

        records.push(StagedRecord {
            review_id: required(0, row)?,
            reviewer_id: required(1, row)?,
            business_id: required(2, row)?,
            reviewed_at: parse_timestamp(&review_date)
                .ok_or_else(|| invalid(row, "review_date", &review_date))?,
            rating: rating
                .parse::<u8>()
                .map_err(|_| invalid(row, "review_rating", &rating))?,
            title: columns[5][row].clone(),
            content: columns[6][row].clone(),
            ip_address: columns[7][row].clone(),
            email: columns[8][row].clone(),
            reviewer_name: columns[9][row].clone(),
            reviewer_country: columns[10][row].clone(),
            business_name: columns[11][row].clone(),
            lineage: Lineage {
                source_file: required(12, row)?,
                source_row: source_row
                    .parse::<i64>()
                    .map_err(|_| invalid(row, "source_row", &source_row))?,
            },
        });
    }

    Ok(records)
}
