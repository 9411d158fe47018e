use kmem_core::pipeline::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("missing data directory")]
    MissingDataDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("sqlite-vec initialization error: {0}")]
    SqliteVec(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(#[from] ValidationError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown {kind} backend: {name}")]
    UnknownBackend { kind: &'static str, name: String },
    #[error("pipeline status not found: {index}/{document_id}")]
    StatusNotFound { index: String, document_id: String },
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("invalid artifact name: {0:?}")]
    InvalidArtifactName(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("decoding failed: {0}")]
    Decode(String),
    #[error("text exceeds the token limit: {tokens} > {max_tokens}")]
    TokenLimitExceeded { tokens: usize, max_tokens: usize },
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("embedding rejected: {0}")]
    EmbeddingRejected(String),
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("queue error: {0}")]
    Queue(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Network and storage hiccups are transient; malformed input and
    /// contract errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Sqlx(_)
            | Self::Http(_)
            | Self::Embedding(_)
            | Self::Queue(_)
            | Self::Cancelled => true,
            Self::MissingDataDir
            | Self::Json(_)
            | Self::Migrate(_)
            | Self::SqliteVec(_)
            | Self::InvalidPipeline(_)
            | Self::InvalidRequest(_)
            | Self::UnknownBackend { .. }
            | Self::StatusNotFound { .. }
            | Self::ArtifactNotFound(_)
            | Self::InvalidArtifactName(_)
            | Self::UnsupportedFormat(_)
            | Self::Decode(_)
            | Self::TokenLimitExceeded { .. }
            | Self::EmbeddingRejected(_)
            | Self::IndexNotFound(_)
            | Self::DimensionMismatch { .. } => false,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_errors() {
        assert!(PipelineError::Embedding("503".into()).is_transient());
        assert!(PipelineError::Cancelled.is_transient());
        assert!(!PipelineError::UnsupportedFormat("image/png".into()).is_transient());
        assert!(!PipelineError::IndexNotFound("default".into()).is_transient());
        assert!(!PipelineError::InvalidPipeline(ValidationError::EmptySteps).is_transient());
    }
}
