use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("document is not valid utf-8: {0}")]
    InvalidEncoding(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("dimension mismatch: index holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("text generation failed: {0}")]
    GenerationFailed(String),

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("index rebuild failed: {0}")]
    RebuildFailed(#[source] Box<RagError>),

    #[error("persisted index is corrupt: {0}")]
    CorruptIndex(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl RagError {
    /// Stable short name of the error kind, safe to show to end users.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::InvalidConfiguration(_) => "invalid_configuration",
            RagError::InvalidRequest(_) => "invalid_request",
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::EmbeddingUnavailable(_) => "embedding_unavailable",
            RagError::GenerationFailed(_) => "generation_failed",
            RagError::Timeout { .. } => "timeout",
            RagError::RebuildFailed(_) => "rebuild_failed",
            RagError::CorruptIndex(_) => "corrupt_index",
            RagError::Io(_) => "io",
            RagError::Serialization(_) => "serialization",
            RagError::Ingest(_) => "ingest",
        }
    }

    /// Collaborator failures that may succeed on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingUnavailable(_)
                | RagError::GenerationFailed(_)
                | RagError::Timeout { .. }
        )
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
