use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{SandboxId, TemplateId, TenantId};

/// Resource dimensions a sandbox requests or a policy caps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_millicpu: u32,
    pub mem_mb: u32,
    #[serde(default)]
    pub gpu: u32,
}

impl ResourceSpec {
    pub const ZERO: ResourceSpec = ResourceSpec {
        cpu_millicpu: 0,
        mem_mb: 0,
        gpu: 0,
    };

    /// True if every dimension of `self` is within `cap`.
    pub fn fits_within(&self, cap: &ResourceSpec) -> bool {
        self.cpu_millicpu <= cap.cpu_millicpu && self.mem_mb <= cap.mem_mb && self.gpu <= cap.gpu
    }

    pub fn saturating_add(&self, other: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu_millicpu: self.cpu_millicpu.saturating_add(other.cpu_millicpu),
            mem_mb: self.mem_mb.saturating_add(other.mem_mb),
            gpu: self.gpu.saturating_add(other.gpu),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu_millicpu: self.cpu_millicpu.saturating_sub(other.cpu_millicpu),
            mem_mb: self.mem_mb.saturating_sub(other.mem_mb),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }
}

/// Retention policy attached to a request or inherited from its template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retention {
    /// Maximum age, in seconds, before a terminal run record is eligible for GC.
    pub max_age_secs: u64,
    pub keep_outputs: bool,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_age_secs: 7 * 24 * 3600,
            keep_outputs: false,
        }
    }
}

/// A request to run a single sandbox, as submitted to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    #[serde(default)]
    pub id: SandboxId,
    pub template_id: TemplateId,
    pub tenant_id: TenantId,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    /// Identifier of the network contract to apply, or a lockdown keyword
    /// (see [`NETWORK_NONE`]) understood by the Network Judge.
    pub network_ref: String,
    #[serde(default)]
    pub heat_level: HeatLevel,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Lockdown keyword accepted by the Network Judge in place of a real
/// network contract id — denies all egress.
pub const NETWORK_NONE: &str = "no-net";

/// How eagerly the scheduler should prefer a pre-warmed snapshot for this
/// request. `Cold` requests never reuse a warm snapshot's overlay base in
/// a way that would change spec semantics; this only affects hinting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatLevel {
    #[default]
    Warm,
    Cold,
}

impl SandboxRequest {
    /// True if `network_ref` is the lockdown keyword rather than a real
    /// network contract identifier.
    pub fn wants_no_network(&self) -> bool {
        self.network_ref == NETWORK_NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SandboxRequest {
        SandboxRequest {
            id: SandboxId::new(),
            template_id: TemplateId::from("tpl-base"),
            tenant_id: TenantId::from("tnt-acme"),
            command: "/bin/echo".into(),
            args: vec!["hi".into()],
            env: BTreeMap::new(),
            resources: ResourceSpec {
                cpu_millicpu: 500,
                mem_mb: 256,
                gpu: 0,
            },
            network_ref: NETWORK_NONE.into(),
            heat_level: HeatLevel::Warm,
            retention: Retention::default(),
            metadata: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn resource_fit_checks_every_dimension() {
        let cap = ResourceSpec {
            cpu_millicpu: 1000,
            mem_mb: 512,
            gpu: 0,
        };
        let within = ResourceSpec {
            cpu_millicpu: 500,
            mem_mb: 256,
            gpu: 0,
        };
        let over = ResourceSpec {
            cpu_millicpu: 2000,
            mem_mb: 256,
            gpu: 0,
        };
        assert!(within.fits_within(&cap));
        assert!(!over.fits_within(&cap));
    }

    #[test]
    fn no_net_keyword_is_recognized() {
        assert!(sample().wants_no_network());
    }

    #[test]
    fn request_roundtrips_through_json() {
        let req = sample();
        let json = serde_json::to_string(&req).unwrap();
        let back: SandboxRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, req.id);
        assert_eq!(back.resources, req.resources);
    }

    #[test]
    fn saturating_add_and_sub_are_inverse_on_fit_values() {
        let a = ResourceSpec {
            cpu_millicpu: 100,
            mem_mb: 100,
            gpu: 0,
        };
        let b = ResourceSpec {
            cpu_millicpu: 50,
            mem_mb: 25,
            gpu: 0,
        };
        let summed = a.saturating_add(&b);
        assert_eq!(summed.saturating_sub(&b).cpu_millicpu, a.cpu_millicpu);
    }
}
