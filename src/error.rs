//! Crate error type
//!
//! Only configuration mistakes, I/O problems and genuine numerical bugs are
//! errors. Expected per-voxel failures (singular matrices, zero variance,
//! perfect separation) are reported through `VoxelOutcome::Skipped` instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("NIfTI error: {0}")]
    Nifti(String),

    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("missing id column, cannot specify model")]
    MissingIdColumn,

    #[error("subject '{0}' is not present in the spreadsheet")]
    MissingSubject(String),

    #[error("unknown variable '{variable}' referenced by contrast '{contrast}'")]
    UnknownVariable { contrast: String, variable: String },

    #[error("duplicate contrast name '{0}'")]
    DuplicateContrast(String),

    #[error("invalid contrast '{name}': {reason}")]
    InvalidContrast { name: String, reason: String },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("z conversion of {statistic} did not converge below {max_digits} digits")]
    ConversionNonConvergence { statistic: f64, max_digits: u32 },

    #[error("division by zero in arbitrary precision arithmetic")]
    DivisionByZero,

    #[error("arbitrary precision domain error: {0}")]
    PrecisionDomain(&'static str),

    #[error("{0} did not converge at the working precision")]
    SeriesNonConvergence(&'static str),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}
