use thiserror::Error;

/// Image Builder error taxonomy.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("layer entry escapes out_dir: {0}")]
    PathTraversal(String),

    #[error("required external tool not found: {0}")]
    ToolMissing(String),

    #[error("scanner rejected image: {0}")]
    ScanFailed(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("registry transport error: {0}")]
    Transport(String),
}
