use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use sandkeep_core::{GracePolicy, NetworkContract, SandboxPolicy, TemplateId};
use sandkeep_plan::{verify_and_extract, SignedPayload};
use tokio::sync::RwLock;

use crate::error::PolicyError;

/// Holds the three policy bundle shapes the Admission Chain and
/// Shutdown Controller consult. Locally-authored bundles are inserted
/// directly; bundles crossing a trust boundary (e.g. an external admin
/// surface) should arrive signed and pass through
/// [`PolicyStore::put_signed_policy`] instead: no trusted keys
/// configured means signing is simply not in use for this deployment,
/// not a silent skip of a configured requirement.
pub struct PolicyStore {
    policies: RwLock<HashMap<String, SandboxPolicy>>,
    networks: RwLock<HashMap<String, NetworkContract>>,
    grace_policies: RwLock<HashMap<String, GracePolicy>>,
    trusted_keys: Vec<VerifyingKey>,
}

impl PolicyStore {
    pub fn new(trusted_keys: Vec<VerifyingKey>) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashMap::new()),
            grace_policies: RwLock::new(HashMap::new()),
            trusted_keys,
        }
    }

    pub async fn put_policy(&self, policy: SandboxPolicy) {
        self.policies
            .write()
            .await
            .insert(policy.template_id.as_str().to_string(), policy);
    }

    pub async fn put_signed_policy(&self, signed: &SignedPayload) -> Result<(), PolicyError> {
        let policy: SandboxPolicy = verify_and_extract(signed, &self.trusted_keys)
            .map_err(|e| PolicyError::Unverified(e.to_string()))?;
        self.put_policy(policy).await;
        Ok(())
    }

    pub async fn get_policy(&self, template_id: &TemplateId) -> Option<SandboxPolicy> {
        self.policies.read().await.get(template_id.as_str()).cloned()
    }

    pub async fn put_network_contract(&self, contract: NetworkContract) {
        self.networks
            .write()
            .await
            .insert(contract.id.clone(), contract);
    }

    pub async fn get_network_contract(&self, id: &str) -> Option<NetworkContract> {
        self.networks.read().await.get(id).cloned()
    }

    pub async fn put_grace_policy(&self, policy: GracePolicy) {
        self.grace_policies
            .write()
            .await
            .insert(policy.id.clone(), policy);
    }

    /// Resolve a grace policy by id, falling back to the built-in
    /// default (5s / 300s) when nothing is registered.
    pub async fn get_grace_policy(&self, id: &str) -> GracePolicy {
        self.grace_policies
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up a grace policy by id without falling back to the
    /// default, so a caller resolving `{reason} -> {template} ->
    /// default` in priority order can tell a registered policy from an
    /// absent one.
    pub async fn find_grace_policy(&self, id: &str) -> Option<GracePolicy> {
        self.grace_policies.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::ResourceSpec;
    use sandkeep_plan::{generate_keypair, sign_payload};

    fn sample_policy() -> SandboxPolicy {
        SandboxPolicy {
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
        }
    }

    #[tokio::test]
    async fn put_then_get_policy_roundtrips() {
        let store = PolicyStore::new(vec![]);
        store.put_policy(sample_policy()).await;
        let fetched = store
            .get_policy(&TemplateId::from("tpl-demo"))
            .await
            .unwrap();
        assert_eq!(fetched.max_runtime_secs, 3600);
    }

    #[tokio::test]
    async fn missing_policy_returns_none() {
        let store = PolicyStore::new(vec![]);
        assert!(store.get_policy(&TemplateId::from("nope")).await.is_none());
    }

    #[tokio::test]
    async fn signed_policy_requires_a_trusted_key() {
        let (key, _) = generate_keypair();
        let bytes = serde_json::to_vec(&sample_policy()).unwrap();
        let signed = sign_payload(&bytes, &key, "admin");

        let untrusted_store = PolicyStore::new(vec![]);
        assert!(untrusted_store.put_signed_policy(&signed).await.is_err());

        let trusted_store = PolicyStore::new(vec![key.verifying_key()]);
        trusted_store.put_signed_policy(&signed).await.unwrap();
        assert!(trusted_store
            .get_policy(&TemplateId::from("tpl-demo"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn grace_policy_falls_back_to_default() {
        let store = PolicyStore::new(vec![]);
        let grace = store.get_grace_policy("unregistered").await;
        assert_eq!(grace.default_grace_secs, 5);
        assert_eq!(grace.max_grace_secs, 300);
    }

    #[tokio::test]
    async fn network_contract_roundtrips() {
        let store = PolicyStore::new(vec![]);
        store
            .put_network_contract(NetworkContract {
                id: "net-default".into(),
                allowed_cidrs: vec!["10.0.0.0/8".into()],
                deny_private: true,
                deny_metadata: true,
            })
            .await;
        let fetched = store.get_network_contract("net-default").await.unwrap();
        assert!(fetched.deny_metadata);
    }
}
