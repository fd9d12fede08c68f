use std::sync::Arc;

use async_trait::async_trait;
use sandkeep_core::SandboxRequest;
use sandkeep_policy::PolicyStore;

use crate::judge::{Judge, Verdict};

/// Rejects a request if any resource dimension exceeds its template's
/// declared policy cap. A template with no registered
/// policy is treated as unbounded — Resource Judge is advisory only
/// where no cap has been configured, not a default-deny gate.
pub struct ResourceJudge {
    policies: Arc<PolicyStore>,
}

impl ResourceJudge {
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self { policies }
    }
}

#[async_trait]
impl Judge for ResourceJudge {
    fn name(&self) -> &str {
        "resource"
    }

    async fn pre_admit(&self, request: &SandboxRequest) -> Verdict {
        let Some(policy) = self.policies.get_policy(&request.template_id).await else {
            return Verdict::Accept;
        };

        if request.resources.fits_within(&policy.max_resources) {
            Verdict::Accept
        } else {
            Verdict::Reject(format!(
                "requested resources {:?} exceed policy cap {:?} for template {}",
                request.resources, policy.max_resources, request.template_id
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::{ResourceSpec, SandboxPolicy, SandboxRequest, TemplateId};

    fn request_with(cpu: u32, mem: u32) -> SandboxRequest {
        SandboxRequest {
            id: sandkeep_core::SandboxId::new(),
            template_id: TemplateId::from("tpl-demo"),
            tenant_id: sandkeep_core::TenantId::from("tnt-acme"),
            command: "true".into(),
            args: vec![],
            env: Default::default(),
            resources: ResourceSpec {
                cpu_millicpu: cpu,
                mem_mb: mem,
                gpu: 0,
            },
            network_ref: "no-net".into(),
            heat_level: Default::default(),
            retention: Default::default(),
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn accepts_when_no_policy_registered() {
        let store = Arc::new(PolicyStore::new(vec![]));
        let judge = ResourceJudge::new(store);
        assert_eq!(judge.pre_admit(&request_with(4000, 8192)).await, Verdict::Accept);
    }

    #[tokio::test]
    async fn rejects_when_any_dimension_exceeds_cap() {
        let store = Arc::new(PolicyStore::new(vec![]));
        store
            .put_policy(SandboxPolicy {
                template_id: TemplateId::from("tpl-demo"),
                max_resources: ResourceSpec {
                    cpu_millicpu: 1000,
                    mem_mb: 512,
                    gpu: 0,
                },
                max_runtime_secs: 3600,
                max_memory_mb: 512,
                network_policy_ref: "net-default".into(),
                kill_on_breach: true,
                grace_policy_ref: "default".into(),
            })
            .await;
        let judge = ResourceJudge::new(store);

        assert_eq!(
            judge.pre_admit(&request_with(500, 256)).await,
            Verdict::Accept
        );
        assert!(matches!(
            judge.pre_admit(&request_with(2000, 256)).await,
            Verdict::Reject(_)
        ));
    }
}
