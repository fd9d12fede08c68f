use thiserror::Error;

/// The error taxonomy shared by every mandatory-judge and leaf-crate
/// boundary. Orchestration crates wrap this in
/// `anyhow::Result` with `.context(...)`; leaf crates return it
/// directly so a caller can match on the category without string
/// parsing.
#[derive(Debug, Error)]
pub enum SandkeepError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("policy denied: {0}")]
    Policy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("policy breach: {0}")]
    PolicyBreach(String),

    #[error("required external tool missing: {0}")]
    ToolMissing(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl SandkeepError {
    /// Whether a caller should retry the operation that produced this
    /// error. Only `Transient` failures are retryable; everything else
    /// reflects a decision that will not change on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
