use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported format for {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("corrupt source {path}: {reason}")]
    CorruptSource { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),
}

impl IngestError {
    pub(crate) fn corrupt(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::CorruptSource {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn unsupported(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Retryable provider failure: rate limit, timeout or transport error.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    #[error("embedding provider unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("embedding request rejected: {0}")]
    Rejected(String),

    #[error("embedding dimension {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("collection {collection} has dimension {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("invalid collection name: {0}")]
    InvalidCollectionName(String),
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Unavailable(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Unavailable(format!("serialize error: {value}"))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set. Add it to your environment or .env file.")]
    MissingCredential(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Errors that abort a whole indexing batch.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("embedding dimension {actual} does not match collection dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error("collection {collection} has dimension {expected}, query embedder produces {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("answer generation failed: {0}")]
    Generation(String),
}

#[derive(Debug, Error)]
pub enum TableDetectionError {
    #[error("invalid detection options: {0}")]
    InvalidOptions(String),

    #[error("image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("detector exited with {status}: {stderr}")]
    DetectorFailed { status: String, stderr: String },

    #[error("invalid detection report: {0}")]
    InvalidReport(#[from] serde_json::Error),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
