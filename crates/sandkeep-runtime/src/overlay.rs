//! Overlay Pool: a per-sandbox copy-on-write view atop an
//! immutable base rootfs. Base registration is idempotent and
//! singleflight-shaped the same way Snapshot Manager's `prepare` is —
//! the same idiom repeats across this crate's network setup too.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sandkeep_core::{Overlay, OverlayId, SandboxId};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("base rootfs not found: {0}")]
    BaseNotFound(PathBuf),
    #[error("overlay io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-node pool of copy-on-write overlays. Each overlay is a sparse
/// file the hypervisor treats as a writable delta on top of a shared,
/// read-only base image.
pub struct OverlayPool {
    root: PathBuf,
    bases: Mutex<HashMap<String, PathBuf>>,
}

impl OverlayPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bases: Mutex::new(HashMap::new()),
        }
    }

    /// Create a writable overlay for `sandbox_id` atop `base_image_path`.
    /// Registering the same base twice is a no-op; concurrent callers
    /// racing on the same base never corrupt the registration (the
    /// `Mutex` makes the check-then-insert atomic rather than relying on
    /// the filesystem to serialize it).
    pub async fn create(&self, base_image_path: &Path, sandbox_id: &SandboxId) -> Result<Overlay, OverlayError> {
        if !base_image_path.exists() {
            return Err(OverlayError::BaseNotFound(base_image_path.to_path_buf()));
        }

        let key = base_key(base_image_path);
        self.register_base(&key, base_image_path)?;

        let overlay_id = OverlayId::new();
        let mount_path = self.root.join(format!("{overlay_id}.ovl"));
        tokio::fs::create_dir_all(&self.root).await?;
        create_sparse_overlay(&mount_path, base_image_path).await?;

        Ok(Overlay {
            id: overlay_id,
            base_path: base_image_path.to_path_buf(),
            mount_path,
            sandbox_id: sandbox_id.clone(),
        })
    }

    /// Destroy an overlay. Removing an already-absent file is success,
    /// so destroy is idempotent.
    pub async fn destroy(&self, overlay: &Overlay) -> Result<(), OverlayError> {
        match tokio::fs::remove_file(&overlay.mount_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn register_base(&self, key: &str, base_image_path: &Path) -> Result<(), OverlayError> {
        let mut bases = self.bases.lock().expect("overlay base registry poisoned");
        bases
            .entry(key.to_string())
            .or_insert_with(|| base_image_path.to_path_buf());
        Ok(())
    }
}

fn base_key(base_image_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_image_path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Create a sparse delta file referencing `base`. A real hypervisor
/// backend (qcow2-over-raw, dm-snapshot) would instead allocate a
/// thin-provisioned block device here; this crate only guarantees the
/// overlay file exists at the right size with zero allocated blocks,
/// which is what `MockRuntime`/tests and the Firecracker adapter's
/// drive-attachment both need.
async fn create_sparse_overlay(mount_path: &Path, base: &Path) -> Result<(), OverlayError> {
    let base_len = tokio::fs::metadata(base).await?.len();
    let file = tokio::fs::File::create(mount_path).await?;
    file.set_len(base_len).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_base(dir: &tempfile::TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
        path
    }

    #[tokio::test]
    async fn create_produces_a_sparse_file_sized_to_the_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = fake_base(&dir, "base.img", 4096).await;
        let pool = OverlayPool::new(dir.path().join("overlays"));

        let overlay = pool.create(&base, &SandboxId::new()).await.unwrap();
        let meta = tokio::fs::metadata(&overlay.mount_path).await.unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let base = fake_base(&dir, "base.img", 128).await;
        let pool = OverlayPool::new(dir.path().join("overlays"));

        let overlay = pool.create(&base, &SandboxId::new()).await.unwrap();
        pool.destroy(&overlay).await.unwrap();
        pool.destroy(&overlay).await.unwrap();
    }

    #[tokio::test]
    async fn create_fails_on_missing_base() {
        let dir = tempfile::tempdir().unwrap();
        let pool = OverlayPool::new(dir.path().join("overlays"));
        let err = pool
            .create(&dir.path().join("missing.img"), &SandboxId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::BaseNotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_create_on_same_base_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let base = fake_base(&dir, "base.img", 1024).await;
        let pool = std::sync::Arc::new(OverlayPool::new(dir.path().join("overlays")));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let base = base.clone();
            handles.push(tokio::spawn(async move { pool.create(&base, &SandboxId::new()).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
    }

    #[test]
    fn base_key_is_stable_for_the_same_path() {
        let p = PathBuf::from("/var/lib/sandkeep/base.img");
        assert_eq!(base_key(&p), base_key(&p));
    }
}
