use serde::{Deserialize, Serialize};

use crate::ids::SandboxId;
use crate::request::SandboxRequest;

/// Bookkeeping for a hibernated sandbox, written by the Sleep Manager's
/// `sleep` and consumed by its `wake`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepRecord {
    pub sandbox_id: SandboxId,
    /// Blob-store key prefix shared by the `.mem`/`.disk` artifacts,
    /// e.g. `sleep/<sandbox_id>/<unix_nanos>`.
    pub snapshot_key_base: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub vm_config: serde_json::Value,
    pub original_request: SandboxRequest,
}

impl SleepRecord {
    pub fn mem_key(&self) -> String {
        format!("{}.mem", self.snapshot_key_base)
    }

    pub fn disk_key(&self) -> String {
        format!("{}.disk", self.snapshot_key_base)
    }
}
