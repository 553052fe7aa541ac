//! Error types for chatlens
//!
//! Stage boundaries of the clustering pipeline return [`Result`]; provider
//! internals use `anyhow` and are wrapped into a variant naming the stage.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for chatlens operations
#[derive(Error, Debug)]
pub enum ChatLensError {
    /// Invalid configuration or call parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// `fit` was called with no texts
    #[error("Cannot fit on an empty corpus")]
    EmptyCorpus,

    /// Caller-supplied arrays disagree on their number of rows
    #[error("Shape mismatch for {what}: expected {expected} rows, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Embedding backend failure
    #[error("Embedding failed: {0:#}")]
    Embedding(#[source] anyhow::Error),

    /// Dimensionality reduction failure
    #[error("Projection failed: {0}")]
    Projection(String),

    /// Density clustering failure
    #[error("Clustering error: {0}")]
    Clustering(String),

    /// Similarity index failure
    #[error("Index error: {0}")]
    Index(String),

    /// `infer` or an accessor was used before `fit`/`load`
    #[error("Clusterer is not fitted; call fit or load first")]
    NotFitted,

    /// `load` target folder does not exist
    #[error("Artifact bundle not found at {}", .0.display())]
    BundleNotFound(PathBuf),

    /// Reading or writing one bundle file failed
    #[error("Persistence error for {}: {source:#}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// LLM provider errors
    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatLensError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        ChatLensError::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Result type alias for chatlens operations
pub type Result<T> = std::result::Result<T, ChatLensError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_stage() {
        let err = ChatLensError::Projection("too few samples".to_string());
        assert_eq!(err.to_string(), "Projection failed: too few samples");

        let err = ChatLensError::Embedding(anyhow::anyhow!("model missing"));
        assert!(err.to_string().starts_with("Embedding failed"));
    }

    #[test]
    fn test_bundle_not_found_includes_path() {
        let err = ChatLensError::BundleNotFound(PathBuf::from("/tmp/nowhere"));
        assert!(err.to_string().contains("/tmp/nowhere"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ChatLensError = io.into();
        assert!(matches!(err, ChatLensError::Io(_)));
    }
}
