//! Error taxonomy for the feature pipeline.
//!
//! Hard failures (malformed input, schema mismatch) surface here. Recoverable
//! conditions such as unknown categories, degenerate statistics and
//! non-finite cells are counted in [`crate::stats::TransformReport`] instead,
//! unless the configured policy asks for an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Malformed input at row {row}: {reason}")]
    MalformedInput { row: usize, reason: String },

    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Unknown {group} category: {value}")]
    UnknownCategory { group: &'static str, value: String },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Assembler has not been fit")]
    NotFitted,

    #[error("Cannot fit on an empty table")]
    EmptyInput,

    #[error("Station {name} listed twice with different coordinates")]
    DuplicateStation { name: String },

    #[error("Invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Group {group} produced {actual} rows, expected {expected}")]
    RowCountMismatch {
        group: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn malformed(row: usize, reason: impl Into<String>) -> Self {
        PipelineError::MalformedInput {
            row,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
