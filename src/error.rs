use std::path::PathBuf;

use thiserror::Error;

use crate::execution::PipelineStage;

/// Convenience result type for preprocessing operations.
pub type PreprocessResult<T> = Result<T, PreprocessError>;

/// Error type returned by every stage of the preprocessing pipeline.
///
/// All variants are fatal: the pipeline never publishes a partial vocabulary or a partially
/// shuffled dataset. Data errors carry the stage and day that raised them.
#[derive(Debug, Error)]
pub enum PreprocessError {
    /// Underlying I/O error (e.g. permission denied, disk full, failed mapping).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the delimited-text reader.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Error writing or reading the Parquet output.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Error reading or writing a JSON vocabulary / configuration file.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker thread pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// An option is out of range or inconsistent with the input.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A required input file does not exist.
    #[error("missing input path: {}", path.display())]
    MissingInput { path: PathBuf },

    /// A line did not have the expected number of delimited fields.
    #[error("[{stage}] day {day} row {row}: expected {expected} fields, found {found}")]
    FieldCount {
        stage: PipelineStage,
        day: usize,
        row: usize,
        expected: usize,
        found: usize,
    },

    /// A field could not be parsed into its numeric type.
    #[error("[{stage}] failed to parse value at day {day} row {row} column '{column}': {message} (raw='{raw}')")]
    ParseError {
        stage: PipelineStage,
        day: usize,
        row: usize,
        column: String,
        raw: String,
        message: String,
    },

    /// The number of rows seen for a day differs from the number recorded earlier.
    #[error("[{stage}] row count mismatch for day {day}: expected {expected}, found {actual}")]
    RowCountMismatch {
        stage: PipelineStage,
        day: usize,
        expected: usize,
        actual: usize,
    },

    /// No target bucket had room left for a row of `day`.
    #[error("[{stage}] bucket capacity overflow: no bucket has room for a row of source day {day} after {attempts} draws")]
    CapacityOverflow {
        stage: PipelineStage,
        day: usize,
        attempts: usize,
    },

    /// A persisted vocabulary is not a bijection onto `[0, count)`.
    #[error("invalid vocabulary for column {column}: {message}")]
    InvalidVocabulary { column: usize, message: String },

    /// The pipeline was asked to move to a stage that does not follow the current one.
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition {
        from: PipelineStage,
        to: PipelineStage,
    },
}

impl PreprocessError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
