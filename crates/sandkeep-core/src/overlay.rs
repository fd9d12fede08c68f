use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{OverlayId, SandboxId};

/// A writable copy-on-write view atop an immutable base rootfs.
///
/// Created at attach, destroyed on terminate. Exclusive owner is the
/// sandbox named by `sandbox_id`; overlays are never reused across
/// sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overlay {
    pub id: OverlayId,
    pub base_path: PathBuf,
    pub mount_path: PathBuf,
    pub sandbox_id: SandboxId,
}
