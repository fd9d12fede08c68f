//! Sleep Manager: hibernate a running sandbox's memory and
//! disk state to the blob store, freeing its runtime slot, and later
//! restore it as a fresh launch pointed at the recovered snapshot
//! files. Structured the same read-staging-then-publish way as
//! [`sandkeep_runtime::snapshot::SnapshotManager`]'s `build`, minus the
//! singleflight — a sandbox can only be put to sleep once at a time by
//! construction (it isn't running anywhere else to race with).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sandkeep_core::{SandboxId, SandboxRun, SleepRecord};
use sandkeep_runtime::runtime::{Runtime, RuntimeError, SnapshotBase, VmConfig};
use sandkeep_store::BlobBackend;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum SleepError {
    #[error("no sleep record for sandbox {0}")]
    NotFound(SandboxId),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("blob store error: {0}")]
    Blob(#[from] sandkeep_store::BlobError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vm_config serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Options for [`SleepManager::sleep`].
#[derive(Debug, Clone)]
pub struct SleepOptions {
    /// Attempt `runtime.shutdown` before `runtime.kill` — shut down
    /// gracefully first, then kill to free the slot regardless.
    pub graceful_shutdown: bool,
}

impl Default for SleepOptions {
    fn default() -> Self {
        Self { graceful_shutdown: true }
    }
}

pub struct SleepManager {
    runtime: Arc<dyn Runtime>,
    store: Arc<dyn BlobBackend>,
    staging_dir: PathBuf,
    records: Mutex<HashMap<SandboxId, SleepRecord>>,
}

impl SleepManager {
    pub fn new(runtime: Arc<dyn Runtime>, store: Arc<dyn BlobBackend>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            store,
            staging_dir: staging_dir.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip_all, fields(sandbox_id = %id))]
    pub async fn sleep(&self, id: &SandboxId, opts: SleepOptions) -> Result<SleepRecord, SleepError> {
        let (vm_config, request) = self.runtime.get_config(id).await?;
        self.runtime.pause(id).await?;

        let work_dir = self.staging_dir.join(format!("sleep-{id}"));
        tokio::fs::create_dir_all(&work_dir).await?;
        let mem_staging = work_dir.join("sleep.mem");
        let disk_staging = work_dir.join("sleep.disk");

        if let Err(e) = self
            .runtime
            .create_snapshot(id, &mem_staging.to_string_lossy(), &disk_staging.to_string_lossy())
            .await
        {
            warn!(error = %e, "snapshot failed during sleep, attempting best-effort resume");
            let _ = self.runtime.resume(id).await;
            let _ = tokio::fs::remove_dir_all(&work_dir).await;
            return Err(e.into());
        }

        if opts.graceful_shutdown {
            let _ = self.runtime.shutdown(id).await;
        }
        if let Err(e) = self.runtime.kill(id).await {
            warn!(error = %e, "failed to free runtime slot after sleep snapshot");
        }

        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let record = SleepRecord {
            sandbox_id: id.clone(),
            snapshot_key_base: format!("sleep/{id}/{nanos}"),
            created_at: chrono::Utc::now(),
            vm_config: serde_json::to_value(&vm_config)?,
            original_request: request,
        };

        self.store.put(&record.mem_key(), &tokio::fs::read(&mem_staging).await?).await?;
        self.store.put(&record.disk_key(), &tokio::fs::read(&disk_staging).await?).await?;
        let _ = tokio::fs::remove_dir_all(&work_dir).await;

        self.records.lock().expect("sleep record map poisoned").insert(id.clone(), record.clone());
        info!("sandbox hibernated");
        Ok(record)
    }

    #[instrument(skip_all, fields(sandbox_id = %id))]
    pub async fn wake(&self, id: &SandboxId) -> Result<SandboxRun, SleepError> {
        let record = self
            .records
            .lock()
            .expect("sleep record map poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| SleepError::NotFound(id.clone()))?;

        let work_dir = self.staging_dir.join(format!("wake-{id}"));
        tokio::fs::create_dir_all(&work_dir).await?;
        let mem_staging = work_dir.join("wake.mem");
        let disk_staging = work_dir.join("wake.disk");

        // A failure anywhere below leaves the record in place so the
        // caller can retry wake later.
        let mem_bytes = self.store.get(&record.mem_key()).await?;
        let disk_bytes = self.store.get(&record.disk_key()).await?;
        tokio::fs::write(&mem_staging, &mem_bytes).await?;
        tokio::fs::write(&disk_staging, &disk_bytes).await?;

        let mut vm_config: VmConfig = serde_json::from_value(record.vm_config.clone())?;
        vm_config.snapshot = Some(SnapshotBase {
            mem_path: mem_staging.to_string_lossy().into_owned(),
            disk_path: disk_staging.to_string_lossy().into_owned(),
        });

        let run = self.runtime.launch(&record.original_request, vm_config).await?;

        self.records.lock().expect("sleep record map poisoned").remove(id);
        let _ = tokio::fs::remove_dir_all(&work_dir).await;
        info!("sandbox woken");
        Ok(run)
    }

    pub fn has_record(&self, id: &SandboxId) -> bool {
        self.records.lock().expect("sleep record map poisoned").contains_key(id)
    }
}
