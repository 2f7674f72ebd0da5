use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::report::SkipKind;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid date range: {0}")]
    #[diagnostic(help("months are written as YYYY-MM and the start must not follow the end"))]
    InvalidRange(String),

    #[error("fetch of {locator} failed: {message}")]
    Fetch { locator: String, message: String },

    #[error("fetch of {locator} returned status {status}: {message}")]
    FetchStatus {
        locator: String,
        status: u16,
        message: String,
    },

    #[error("missing input file: {0}")]
    MissingInput(PathBuf),

    #[error("cannot georeference {path}: {reason}")]
    GeoTransform { path: PathBuf, reason: String },

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("invalid boundary: {0}")]
    Boundary(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("csv error: {0}")]
    Csv(String),
}

impl PipelineError {
    pub fn geo(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::GeoTransform {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Report bucket used when this error is absorbed by a single unit of work.
    pub fn kind(&self) -> SkipKind {
        match self {
            PipelineError::Fetch { .. } | PipelineError::FetchStatus { .. } => {
                SkipKind::FetchFailed
            }
            PipelineError::MissingInput(_) => SkipKind::MissingInput,
            PipelineError::GeoTransform { .. } => SkipKind::GeoTransform,
            PipelineError::CatalogUnavailable(_) => SkipKind::CatalogUnavailable,
            _ => SkipKind::Failed,
        }
    }
}
