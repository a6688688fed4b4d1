use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CutoutError {
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("invalid band identifier: {0}")]
    InvalidBand(String),

    #[error("duplicate object id in catalog: {0}")]
    DuplicateObject(i64),

    #[error("failed to read catalog at {0}")]
    CatalogRead(PathBuf),

    #[error("catalog line {line}: {message}")]
    CatalogParse { line: usize, message: String },

    #[error("no catalog configured (set catalog.path in cutout-batch.json or pass --catalog)")]
    #[diagnostic(help("the catalog is a delimited text file with columns object_id, redshift, ra, dec"))]
    MissingCatalog,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("malformed request document: {0}")]
    MalformedDocument(String),

    #[error("cutout service request failed: {0}")]
    ServiceHttp(String),

    #[error("cutout service returned status {status}: {message}")]
    ServiceStatus { status: u16, message: String },

    #[error("unit {unit} still failing after {attempts} download attempts")]
    RetriesExhausted { unit: usize, attempts: u32 },

    #[error("archive extraction failed: {0}")]
    Extraction(String),

    #[error("invalid state transition for unit {unit}: {from} -> {to}")]
    InvalidTransition {
        unit: usize,
        from: String,
        to: String,
    },

    #[error("failed to parse state record {path}: {message}")]
    StateParse { path: PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("worker pool error: {0}")]
    Worker(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CutoutError {
    /// Whether a failed submission is worth retrying from the same worker slot.
    pub fn is_transient(&self) -> bool {
        match self {
            CutoutError::ServiceHttp(_) => true,
            CutoutError::ServiceStatus { status, .. } => !is_rejection_status(*status),
            _ => false,
        }
    }

    /// The service refused the request list itself; resubmitting the same bytes cannot succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CutoutError::ServiceStatus { status, .. } if is_rejection_status(*status)
        ) || matches!(self, CutoutError::MalformedDocument(_))
    }
}

fn is_rejection_status(status: u16) -> bool {
    matches!(status, 400 | 401 | 403 | 404 | 413 | 422)
}
