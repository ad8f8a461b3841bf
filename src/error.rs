use std::path::PathBuf;

use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Corpus format error in {path:?}: {reason}")]
    CorpusFormat { path: PathBuf, reason: String },
    #[error("Corpus is empty, no index can be built")]
    EmptyCorpus,
    #[error("No persisted index at {0:?}")]
    IndexNotFound(PathBuf),
    #[error("Persisted index at {path:?} is unusable: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("Generation backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Generation request failed: {0}")]
    BackendRequest(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
}

impl PipelineError {
    /// Index load failures that a rebuild from the corpus can recover from.
    pub fn is_recoverable_index_error(&self) -> bool {
        matches!(self, Self::IndexNotFound(_) | Self::IndexCorrupt { .. })
    }

    pub(crate) fn corpus_format(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorpusFormat {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn index_corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::IndexCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
