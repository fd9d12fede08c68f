use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{SnapshotId, TemplateId};

/// A per-template pre-warmed VM memory+disk snapshot.
///
/// Invariant: `(mem_key, disk_key)` both exist in the blob store for any
/// `Snapshot` reachable from the Snapshot Manager's index or the blob
/// store's `snapshots/` prefix. Snapshots are immutable once published —
/// no field is ever mutated after [`crate::snapshot::Snapshot::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub template_id: TemplateId,
    pub mem_key: String,
    pub disk_key: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn blob_key_prefix(template_id: &TemplateId, snapshot_id: &SnapshotId) -> String {
        format!("snapshots/{}/{}", template_id, snapshot_id)
    }

    pub fn mem_key(template_id: &TemplateId, snapshot_id: &SnapshotId) -> String {
        format!("{}.mem", Self::blob_key_prefix(template_id, snapshot_id))
    }

    pub fn disk_key(template_id: &TemplateId, snapshot_id: &SnapshotId) -> String {
        format!("{}.disk", Self::blob_key_prefix(template_id, snapshot_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_keys_follow_the_spec_layout() {
        let t = TemplateId::from("tpl-base");
        let s = SnapshotId::from("snap-1");
        assert_eq!(Snapshot::mem_key(&t, &s), "snapshots/tpl-base/snap-1.mem");
        assert_eq!(Snapshot::disk_key(&t, &s), "snapshots/tpl-base/snap-1.disk");
    }
}
