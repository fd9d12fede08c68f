use thiserror::Error;

/// Blob Store error taxonomy.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob transport error: {0}")]
    TransportError(String),

    #[error("blob already exists: {0}")]
    Exists(String),

    #[error("digest mismatch for {key}: expected {expected}, got {actual}")]
    DigestMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}
