use serde::{Deserialize, Serialize};

use crate::ids::TemplateId;
use crate::request::ResourceSpec;

/// Per-template resource and network policy. Owned and persisted by the
/// Policy Store (`sandkeep-policy`); referenced read-only from here so
/// every crate can speak about a policy without depending on its store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub template_id: TemplateId,
    pub max_resources: ResourceSpec,
    pub max_runtime_secs: u64,
    pub max_memory_mb: u32,
    pub network_policy_ref: String,
    pub kill_on_breach: bool,
    pub grace_policy_ref: String,
}

/// A named set of egress rules bound to a sandbox via `network_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkContract {
    pub id: String,
    pub allowed_cidrs: Vec<String>,
    pub deny_private: bool,
    pub deny_metadata: bool,
}

/// Grace policy referenced by a [`SandboxPolicy`] and resolved by the
/// Shutdown Controller. `{reason -> policy} ∪ {template -> policy} ∪ default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GracePolicy {
    pub id: String,
    pub default_grace_secs: u64,
    pub max_grace_secs: u64,
    pub checkpoint_first: bool,
    pub export_logs: bool,
    pub export_artifacts: bool,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self {
            id: "default".into(),
            default_grace_secs: 5,
            max_grace_secs: 300,
            checkpoint_first: false,
            export_logs: false,
            export_artifacts: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_policy_default_matches_spec_floor_and_cap() {
        let p = GracePolicy::default();
        assert_eq!(p.default_grace_secs, 5);
        assert_eq!(p.max_grace_secs, 300);
    }
}
