use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::BlobError;
use crate::BlobBackend;

/// Stores blobs under `{basepath}/{key}`, one file per key. Writes stage
/// into a sibling temp file and rename into place so a reader never
/// observes a partially written blob.
pub struct LocalBackend {
    basepath: PathBuf,
}

impl LocalBackend {
    pub fn new(basepath: impl Into<PathBuf>) -> Self {
        Self {
            basepath: basepath.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.basepath.join(key)
    }
}

#[async_trait]
impl BlobBackend for LocalBackend {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), BlobError> {
        let dest = self.path_for(key);
        let dir = dest
            .parent()
            .ok_or_else(|| BlobError::TransportError(format!("invalid key path: {key}")))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| BlobError::TransportError(e.to_string()))?;

        let dir = dir.to_path_buf();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || stage_and_rename(&dir, &dest, &data))
            .await
            .map_err(|e| BlobError::TransportError(e.to_string()))?
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BlobError::NotFound(key.to_string()),
                _ => BlobError::TransportError(e.to_string()),
            })
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(tokio::fs::try_exists(self.path_for(key))
            .await
            .map_err(|e| BlobError::TransportError(e.to_string()))?)
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::TransportError(e.to_string())),
        }
    }
}

fn stage_and_rename(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), BlobError> {
    let mut staged = tempfile::Builder::new()
        .prefix(".sandkeep-blob-")
        .tempfile_in(dir)
        .map_err(|e| BlobError::TransportError(e.to_string()))?;
    staged
        .write_all(data)
        .map_err(|e| BlobError::TransportError(e.to_string()))?;
    staged
        .flush()
        .map_err(|e| BlobError::TransportError(e.to_string()))?;
    staged
        .persist(dest)
        .map_err(|e| BlobError::TransportError(e.error.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.put("layers/abc", b"hello").await.unwrap();
        let data = backend.get("layers/abc").await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let err = backend.get("nope").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent_on_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.delete("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn exists_reflects_put_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        assert!(!backend.exists("k").await.unwrap());
        backend.put("k", b"x").await.unwrap();
        assert!(backend.exists("k").await.unwrap());
        backend.delete("k").await.unwrap();
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_never_exposes_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.put("k", b"first").await.unwrap();
        backend.put("k", b"second-and-longer").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), b"second-and-longer");
    }
}
