//! Error types for the ingestion pipeline.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

/// A row that could not be typed. Carries the canonical field that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {cause}")]
pub struct StructuralError {
    pub field: &'static str,
    pub cause: String,
}

impl StructuralError {
    pub fn new(field: &'static str, cause: impl Into<String>) -> Self {
        Self {
            field,
            cause: cause.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Structural parse error: {0}")]
    StructuralParse(#[from] StructuralError),

    #[error("Source file {path}: {message}")]
    Source { path: PathBuf, message: String },

    #[error("Warehouse integrity violation: {0}")]
    WarehouseIntegrity(String),

    #[error("Stage write failed (columnar: {columnar}; row-oriented: {fallback})")]
    StageWrite { columnar: String, fallback: String },

    #[error("Another ingestion run holds the warehouse lock: {0}")]
    LockHeld(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("Glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl PipelineError {
    pub fn source_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Source {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Run-level errors that leave the warehouse untouched but must be audited.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::WarehouseIntegrity(_))
    }
}

// Constraint failures surface as integrity violations so callers never have to
// inspect SQLite result codes.
impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                Self::WarehouseIntegrity(err.to_string())
            }
            _ => Self::Sqlite(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
