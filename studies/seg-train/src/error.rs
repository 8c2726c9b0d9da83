use std::path::PathBuf;
use thiserror::Error;

pub type SegResult<T> = Result<T, SegError>;

#[derive(Debug, Error)]
pub enum SegError {
    #[error("shape mismatch in {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("batch writes columns {start}..{end} but the metrics buffer holds {total} samples")]
    ColumnRange {
        start: usize,
        end: usize,
        total: usize,
    },
    #[error("{mode} metrics contain {count} non-finite values")]
    NonFiniteMetrics {
        mode: String,
        count: usize,
    },
    #[error("tensor data conversion failed: {0}")]
    TensorData(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint error at {path}: {msg}")]
    Checkpoint {
        path: PathBuf,
        msg: String,
    },
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("image error for {tag}: {source}")]
    Image {
        tag: String,
        #[source]
        source: image::ImageError,
    },
    #[error("csv error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SegError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SegError::Io { path: path.into(), source }
    }
}
