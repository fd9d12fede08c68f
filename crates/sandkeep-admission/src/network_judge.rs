use std::sync::Arc;

use async_trait::async_trait;
use sandkeep_core::{SandboxRequest, NETWORK_NONE};
use sandkeep_policy::PolicyStore;

use crate::judge::{Judge, Verdict};

/// Enforces that a request's `network_ref` names either the lockdown
/// keyword or a network contract that actually exists.
pub struct NetworkJudge {
    policies: Arc<PolicyStore>,
}

impl NetworkJudge {
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self { policies }
    }
}

#[async_trait]
impl Judge for NetworkJudge {
    fn name(&self) -> &str {
        "network"
    }

    async fn pre_admit(&self, request: &SandboxRequest) -> Verdict {
        if request.wants_no_network() {
            return Verdict::Accept;
        }

        match self.policies.get_network_contract(&request.network_ref).await {
            Some(_) => Verdict::Accept,
            None => Verdict::Reject(format!(
                "network_ref '{}' is neither '{}' nor a registered network contract",
                request.network_ref, NETWORK_NONE
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::{NetworkContract, ResourceSpec, SandboxRequest, TemplateId};

    fn request_with_network(network_ref: &str) -> SandboxRequest {
        SandboxRequest {
            id: sandkeep_core::SandboxId::new(),
            template_id: TemplateId::from("tpl-demo"),
            tenant_id: sandkeep_core::TenantId::from("tnt-acme"),
            command: "true".into(),
            args: vec![],
            env: Default::default(),
            resources: ResourceSpec::ZERO,
            network_ref: network_ref.into(),
            heat_level: Default::default(),
            retention: Default::default(),
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn accepts_lockdown_keyword() {
        let store = Arc::new(PolicyStore::new(vec![]));
        let judge = NetworkJudge::new(store);
        assert_eq!(
            judge.pre_admit(&request_with_network("no-net")).await,
            Verdict::Accept
        );
    }

    #[tokio::test]
    async fn rejects_unknown_network_ref() {
        let store = Arc::new(PolicyStore::new(vec![]));
        let judge = NetworkJudge::new(store);
        assert!(matches!(
            judge.pre_admit(&request_with_network("net-ghost")).await,
            Verdict::Reject(_)
        ));
    }

    #[tokio::test]
    async fn accepts_registered_network_contract() {
        let store = Arc::new(PolicyStore::new(vec![]));
        store
            .put_network_contract(NetworkContract {
                id: "net-default".into(),
                allowed_cidrs: vec!["10.0.0.0/8".into()],
                deny_private: false,
                deny_metadata: true,
            })
            .await;
        let judge = NetworkJudge::new(store);
        assert_eq!(
            judge.pre_admit(&request_with_network("net-default")).await,
            Verdict::Accept
        );
    }
}
