//! Content-addressed blob store: a local stage-and-rename
//! backend and an opendal-backed remote backend with local
//! read-through caching, behind one `BlobBackend` trait so callers
//! (Image Builder, Snapshot Manager, Sleep Manager) never care which
//! one is wired up.

mod error;
mod local;
mod remote;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

pub use error::BlobError;
pub use local::LocalBackend;
pub use remote::{RemoteBackend, RemoteConfig};

/// Keys are opaque strings of the shape `category/digest_or_id[/suffix]`
///. Implementations never parse them; they only route
/// bytes to storage.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), BlobError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;
    async fn exists(&self, key: &str) -> Result<bool, BlobError>;
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// Build the canonical key for a content-addressed image layer.
pub fn layer_key(digest_hex: &str) -> String {
    format!("layers/{digest_hex}")
}

fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

/// Write `data` under `layers/<digest_hex>`, verifying its SHA-256
/// matches `digest_hex` first. Layer keys encode their own digest, so
/// a mismatch here means the caller computed the wrong key or the
/// bytes were corrupted in transit — either way the write must not
/// land, since layer-cache correctness depends on content-addressing
/// actually holding.
pub async fn put_with_digest(
    backend: &dyn BlobBackend,
    digest_hex: &str,
    data: &[u8],
) -> Result<(), BlobError> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let actual = encode_hex(&hasher.finalize());

    if actual != digest_hex {
        return Err(BlobError::DigestMismatch {
            key: layer_key(digest_hex),
            expected: digest_hex.to_string(),
            actual,
        });
    }

    backend.put(&layer_key(digest_hex), data).await
}
