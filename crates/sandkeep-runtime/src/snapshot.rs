//! Snapshot Manager: per-template pre-warmed VM memory and
//! disk snapshots. `prepare` is the expensive path (assemble a rootfs,
//! boot a short-lived microVM, pause it, snapshot it, publish) and is
//! singleflighted per template the same way [`crate::overlay::OverlayPool`]
//! singleflights base registration — duplicate callers wait on the
//! in-flight attempt rather than repeating the work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sandkeep_build::{assemble, build_rootfs, RegistryClient, ScanHook};
use sandkeep_core::{SandboxId, SandboxRequest, Snapshot, SnapshotId, TemplateId, TemplateSpec, NETWORK_NONE};
use sandkeep_store::BlobBackend;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::runtime::{Runtime, RuntimeError, Stdio, VmConfig};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no snapshot exists for template {0}")]
    NotFound(TemplateId),
    #[error("blob store error: {0}")]
    Blob(#[from] sandkeep_store::BlobError),
    #[error("image build error: {0}")]
    Build(#[from] sandkeep_build::BuildError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn meta_key(template_id: &TemplateId) -> String {
    format!("snapshots/{template_id}/index.json")
}

/// Prepares, caches and invalidates per-template snapshots. The local
/// index is a per-node map; on a miss it reads through to the blob
/// store's published metadata before declaring `NotFound`.
pub struct SnapshotManager<R: RegistryClient, S: ScanHook> {
    store: Arc<dyn BlobBackend>,
    runtime: Arc<dyn Runtime>,
    registry: Arc<R>,
    scan: Option<Arc<S>>,
    staging_dir: PathBuf,
    rootfs_tool_path: String,
    index: Mutex<HashMap<TemplateId, Snapshot>>,
    inflight: Mutex<HashMap<TemplateId, Arc<Notify>>>,
}

impl<R: RegistryClient, S: ScanHook> SnapshotManager<R, S> {
    pub fn new(
        store: Arc<dyn BlobBackend>,
        runtime: Arc<dyn Runtime>,
        registry: Arc<R>,
        scan: Option<Arc<S>>,
        staging_dir: impl Into<PathBuf>,
        rootfs_tool_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            runtime,
            registry,
            scan,
            staging_dir: staging_dir.into(),
            rootfs_tool_path: rootfs_tool_path.into(),
            index: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a warm snapshot exists for `template`, building one if
    /// necessary. At most one build runs per template at a time;
    /// concurrent callers wait for that build's result instead of
    /// repeating it.
    #[instrument(skip_all, fields(template_id = %template.id))]
    pub async fn prepare(&self, template: &TemplateSpec) -> Result<Snapshot, SnapshotError> {
        if let Ok(existing) = self.get(&template.id).await {
            return Ok(existing);
        }

        let (notify, is_leader) = {
            let mut inflight = self.inflight.lock().expect("snapshot inflight map poisoned");
            match inflight.get(&template.id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let notify = Arc::new(Notify::new());
                    inflight.insert(template.id.clone(), notify.clone());
                    (notify, true)
                }
            }
        };

        if !is_leader {
            notify.notified().await;
            return self.get(&template.id).await;
        }

        // Re-check under the singleflight: another `prepare` may have
        // landed between the first `get` above and winning the slot.
        let result = if let Ok(existing) = self.get(&template.id).await {
            Ok(existing)
        } else {
            self.build(template).await
        };

        self.inflight.lock().expect("snapshot inflight map poisoned").remove(&template.id);
        notify.notify_waiters();
        result
    }

    async fn build(&self, template: &TemplateSpec) -> Result<Snapshot, SnapshotError> {
        let work_dir = self.staging_dir.join(format!("prepare-{}", template.id));
        let rootfs_dir = work_dir.join("rootfs");
        tokio::fs::create_dir_all(&rootfs_dir).await?;

        assemble(
            self.registry.as_ref(),
            self.store.as_ref(),
            self.scan.as_deref().map(|s| s as &dyn ScanHook),
            &template.base_image_ref,
            &rootfs_dir,
        )
        .await?;

        let rootfs_image = work_dir.join("rootfs.img");
        build_rootfs(&rootfs_dir, &rootfs_image, &self.rootfs_tool_path).await?;

        let boot_id = SandboxId::new();
        let vm_config = VmConfig {
            vcpus: template.default_resources.cpu_millicpu.max(1000) / 1000,
            mem_mb: template.default_resources.mem_mb,
            rootfs_path: rootfs_image.to_string_lossy().into_owned(),
            kernel_path: template.kernel_image_ref.clone(),
            tap_device: None,
            ip: None,
            snapshot: None,
        };
        let boot_request = SandboxRequest {
            id: boot_id.clone(),
            template_id: template.id.clone(),
            tenant_id: sandkeep_core::TenantId::from("sandkeep-system"),
            command: "/sbin/init".into(),
            args: vec![],
            env: Default::default(),
            resources: template.default_resources,
            network_ref: NETWORK_NONE.into(),
            heat_level: sandkeep_core::HeatLevel::Cold,
            retention: Default::default(),
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
        };

        self.runtime.launch(&boot_request, vm_config).await?;

        if let Some(cmd) = &template.warmup_command {
            let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if !argv.is_empty() {
                self.runtime.exec(&boot_id, &argv, Stdio::Null).await?;
            }
        }

        self.runtime.pause(&boot_id).await?;

        let snapshot_id = SnapshotId::new();
        let mem_staging = work_dir.join("snapshot.mem");
        let disk_staging = work_dir.join("snapshot.disk");
        self.runtime
            .create_snapshot(
                &boot_id,
                &mem_staging.to_string_lossy(),
                &disk_staging.to_string_lossy(),
            )
            .await?;

        let mem_key = Snapshot::mem_key(&template.id, &snapshot_id);
        let disk_key = Snapshot::disk_key(&template.id, &snapshot_id);
        self.store.put(&mem_key, &tokio::fs::read(&mem_staging).await?).await?;
        self.store.put(&disk_key, &tokio::fs::read(&disk_staging).await?).await?;

        if let Err(e) = self.runtime.kill(&boot_id).await {
            warn!(error = %e, "failed to tear down warmup VM after snapshot, leaking a mock entry");
        }
        let _ = tokio::fs::remove_dir_all(&work_dir).await;

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("source_image".to_string(), template.base_image_ref.clone());
        metadata.insert("kernel".to_string(), template.kernel_image_ref.clone());
        metadata.insert("cpu_millicpu".to_string(), template.default_resources.cpu_millicpu.to_string());
        metadata.insert("mem_mb".to_string(), template.default_resources.mem_mb.to_string());

        let snapshot = Snapshot {
            id: snapshot_id,
            template_id: template.id.clone(),
            mem_key,
            disk_key,
            created_at: chrono::Utc::now(),
            metadata,
        };

        self.store
            .put(&meta_key(&template.id), serde_json::to_vec(&snapshot)?.as_slice())
            .await?;
        self.index.lock().expect("snapshot index poisoned").insert(template.id.clone(), snapshot.clone());

        info!(snapshot_id = %snapshot.id, "published snapshot");
        Ok(snapshot)
    }

    /// Read-through lookup: local index first, then the blob store's
    /// published metadata.
    pub async fn get(&self, template_id: &TemplateId) -> Result<Snapshot, SnapshotError> {
        if let Some(snapshot) = self.index.lock().expect("snapshot index poisoned").get(template_id) {
            return Ok(snapshot.clone());
        }

        match self.store.get(&meta_key(template_id)).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                self.index
                    .lock()
                    .expect("snapshot index poisoned")
                    .insert(template_id.clone(), snapshot.clone());
                Ok(snapshot)
            }
            Err(sandkeep_store::BlobError::NotFound(_)) => Err(SnapshotError::NotFound(template_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// At most one published snapshot exists per template at a time, so
    /// this returns zero or one entries; the plural contract is kept
    /// for forward compatibility with multi-snapshot templates.
    pub async fn list(&self, template_id: &TemplateId) -> Result<Vec<Snapshot>, SnapshotError> {
        match self.get(template_id).await {
            Ok(snapshot) => Ok(vec![snapshot]),
            Err(SnapshotError::NotFound(_)) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    /// Clear the local-index and blob-store entries for `template_id`.
    pub async fn invalidate(&self, template_id: &TemplateId) -> Result<(), SnapshotError> {
        let removed = self.index.lock().expect("snapshot index poisoned").remove(template_id);
        let snapshot = match removed {
            Some(s) => Some(s),
            None => self.get(template_id).await.ok(),
        };

        if let Some(snapshot) = snapshot {
            let _ = self.store.delete(&snapshot.mem_key).await;
            let _ = self.store.delete(&snapshot.disk_key).await;
        }
        let _ = self.store.delete(&meta_key(template_id)).await;
        Ok(())
    }

    /// Delete one specific snapshot by id, regardless of whether it is
    /// the template's currently-indexed snapshot.
    pub async fn delete(&self, template_id: &TemplateId, snapshot_id: &SnapshotId) -> Result<(), SnapshotError> {
        {
            let mut index = self.index.lock().expect("snapshot index poisoned");
            if matches!(index.get(template_id), Some(s) if &s.id == snapshot_id) {
                index.remove(template_id);
                let _ = self.store.delete(&meta_key(template_id)).await;
            }
        }
        self.store.delete(&Snapshot::mem_key(template_id, snapshot_id)).await?;
        self.store.delete(&Snapshot::disk_key(template_id, snapshot_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use sandkeep_build::Manifest;
    use sandkeep_core::ResourceSpec;
    use sandkeep_store::LocalBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EmptyRegistry {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl RegistryClient for EmptyRegistry {
        async fn manifest(&self, _image_ref: &str) -> Result<Manifest, sandkeep_build::BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Manifest {
                schema_version: 2,
                layers: vec![],
            })
        }

        async fn fetch_layer(&self, digest: &str) -> Result<Vec<u8>, sandkeep_build::BuildError> {
            Err(sandkeep_build::BuildError::Transport(format!("no layer {digest}")))
        }
    }

    struct NoopScan;

    #[async_trait::async_trait]
    impl ScanHook for NoopScan {
        async fn scan(&self, _rootfs_dir: &Path) -> Result<(), sandkeep_build::BuildError> {
            Ok(())
        }
    }

    fn template() -> TemplateSpec {
        TemplateSpec {
            id: TemplateId::from("tpl-demo"),
            base_image_ref: "demo:latest".into(),
            kernel_image_ref: "/boot/vmlinux".into(),
            default_resources: ResourceSpec {
                cpu_millicpu: 1000,
                mem_mb: 256,
                gpu: 0,
            },
            warmup_command: None,
            default_retention: Default::default(),
        }
    }

    fn manager(dir: &tempfile::TempDir) -> SnapshotManager<EmptyRegistry, NoopScan> {
        let store: Arc<dyn BlobBackend> = Arc::new(LocalBackend::new(dir.path().join("blobs")));
        let runtime: Arc<dyn Runtime> = Arc::new(MockRuntime::new());
        let registry = Arc::new(EmptyRegistry { calls: AtomicU32::new(0) });
        SnapshotManager::new(store, runtime, registry, Some(Arc::new(NoopScan)), dir.path().join("stage"), "true")
    }

    #[tokio::test]
    async fn get_before_prepare_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let err = mgr.get(&TemplateId::from("tpl-demo")).await.unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound(_)));
    }

    #[tokio::test]
    async fn prepare_publishes_and_get_reads_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let tpl = template();

        let snapshot = mgr.prepare(&tpl).await.unwrap();
        assert_eq!(snapshot.template_id, tpl.id);

        let fetched = mgr.get(&tpl.id).await.unwrap();
        assert_eq!(fetched.id, snapshot.id);

        let listed = mgr.list(&tpl.id).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn second_prepare_reuses_the_published_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let tpl = template();

        let first = mgr.prepare(&tpl).await.unwrap();
        let second = mgr.prepare(&tpl).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn invalidate_clears_index_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let tpl = template();

        mgr.prepare(&tpl).await.unwrap();
        mgr.invalidate(&tpl.id).await.unwrap();

        let err = mgr.get(&tpl.id).await.unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_prepare_calls_singleflight_to_one_build() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(&dir));
        let tpl = template();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let mgr = mgr.clone();
            let tpl = tpl.clone();
            handles.push(tokio::spawn(async move { mgr.prepare(&tpl).await }));
        }

        let mut ids = std::collections::HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 1, "every concurrent prepare should observe the same snapshot id");
    }
}
