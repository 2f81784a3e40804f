use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the library. Binaries wrap these in `anyhow`.
#[derive(Debug, Error)]
pub enum SimsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "h5ad")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("missing column '{column}' in {source_name}")]
    MissingColumn { column: String, source_name: String },

    #[error("required file not found: {0}")]
    MissingFile(PathBuf),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("dataset is empty: {0}")]
    EmptyDataset(String),

    #[error("label '{0}' is not known to the label encoder")]
    UnknownLabel(String),

    #[error("class index {0} is out of range for the label encoder")]
    UnknownClass(usize),

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("data module not prepared: call prepare_data() and setup() first ({0})")]
    NotPrepared(&'static str),

    #[error("'{0}' is missing locally and no remote store is configured")]
    NoRemoteStore(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl SimsError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SimsError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SimsError>;
