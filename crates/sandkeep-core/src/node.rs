use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::request::ResourceSpec;

/// Worker node identity, capacity and current allocation as tracked by
/// the Registry (K). Invariant: `allocated <= capacity` on every
/// dimension — enforced by the Scheduler (never written directly here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub capacity: ResourceSpec,
    pub allocated: ResourceSpec,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
}

impl NodeInfo {
    /// True if `req` fits in the node's remaining capacity on every
    /// resource dimension.
    pub fn can_fit(&self, req: &ResourceSpec) -> bool {
        let remaining = self.capacity.saturating_sub(&self.allocated);
        req.fits_within(&remaining)
    }

    /// Fraction of CPU capacity currently allocated, used by the
    /// least-loaded scheduling strategy. Returns 0.0 for a
    /// node with zero CPU capacity (never selectable since nothing fits).
    pub fn cpu_load_ratio(&self) -> f64 {
        if self.capacity.cpu_millicpu == 0 {
            return f64::INFINITY;
        }
        self.allocated.cpu_millicpu as f64 / self.capacity.cpu_millicpu as f64
    }

    /// True if the last heartbeat is within `staleness` of `now`.
    pub fn is_fresh(&self, now: chrono::DateTime<chrono::Utc>, staleness: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) <= staleness
    }
}
