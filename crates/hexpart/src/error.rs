//! Error types for the tiling pipeline.

use thiserror::Error;

/// Errors raised by planning, tiling, consolidation and escalation.
#[derive(Error, Debug)]
pub enum HexpartError {
    /// A user-named column (or a required column) is absent from the schema.
    #[error("column not found: {0}")]
    ColumnNotFound(String),

    /// A user-specified identifier column holds duplicate values.
    #[error("identifier column '{column}' is not unique ({rows} rows, {distinct} distinct values)")]
    NonUniqueIdentifier {
        column: String,
        rows: u64,
        distinct: u64,
    },

    /// A failed completion index has no entry in the tier's index mapping.
    #[error("completion index {index} is outside the index mapping (length {len})")]
    MappingOutOfRange { index: u32, len: usize },

    #[error("invalid resolution {0}: must be within 0..=15")]
    InvalidResolution(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometry(String),

    #[error("WKT parse error: {0}")]
    WktParse(String),

    /// The hex-cell primitive rejected its input.
    #[error("grid error: {0}")]
    Grid(String),

    #[error("invalid index range '{0}'")]
    InvalidIndexRange(String),

    #[error("invalid job specification: {0}")]
    JobSpec(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, HexpartError>;

/// The row count of a source could not be determined.
///
/// Kept apart from [`HexpartError`] so the planner's fallback is an explicit branch.
#[derive(Error, Debug)]
#[error("row count estimation failed: {reason}")]
pub struct EstimationFailed {
    pub reason: String,
}

impl EstimationFailed {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
