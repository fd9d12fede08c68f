use ed25519_dalek::{SigningKey, VerifyingKey};
use sandkeep_core::{SandboxRequest, TemplateSpec};
use serde::{Deserialize, Serialize};

use crate::signing::{sign_payload, verify_and_extract, SignedPayload, SigningError};

/// A submission-time contract: the request a tenant wants scheduled
/// plus the template it targets, bundled so a signature covers both
/// together. Locally-authored submissions skip signing entirely;
/// submissions crossing a trust boundary (an external admin surface)
/// should travel as a [`SignedPayload`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub request: SandboxRequest,
    pub template: TemplateSpec,
}

impl Plan {
    pub fn sign(&self, key: &SigningKey, signer_id: &str) -> Result<SignedPayload, SigningError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| SigningError::Deserialize(e.to_string()))?;
        Ok(sign_payload(&bytes, key, signer_id))
    }

    pub fn from_signed(
        signed: &SignedPayload,
        trusted_keys: &[VerifyingKey],
    ) -> Result<Self, SigningError> {
        verify_and_extract(signed, trusted_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::generate_keypair;
    use sandkeep_core::ResourceSpec;

    fn sample_plan() -> Plan {
        Plan {
            request: SandboxRequest {
                id: sandkeep_core::SandboxId::new(),
                template_id: sandkeep_core::TemplateId::from("tpl-demo"),
                tenant_id: sandkeep_core::TenantId::from("tnt-acme"),
                command: "true".into(),
                args: vec![],
                env: Default::default(),
                resources: ResourceSpec {
                    cpu_millicpu: 500,
                    mem_mb: 256,
                    gpu: 0,
                },
                network_ref: "no-net".into(),
                heat_level: sandkeep_core::HeatLevel::Warm,
                retention: Default::default(),
                metadata: Default::default(),
                created_at: chrono::Utc::now(),
            },
            template: TemplateSpec {
                id: sandkeep_core::TemplateId::from("tpl-demo"),
                base_image_ref: "demo:latest".into(),
                kernel_image_ref: "kernel:5.10".into(),
                default_resources: ResourceSpec::ZERO,
                warmup_command: None,
                default_retention: Default::default(),
            },
        }
    }

    #[test]
    fn sign_then_from_signed_roundtrips() {
        let (key, _) = generate_keypair();
        let plan = sample_plan();
        let signed = plan.sign(&key, "submitter-1").unwrap();
        let recovered = Plan::from_signed(&signed, &[key.verifying_key()]).unwrap();
        assert_eq!(recovered.request.command, "true");
        assert_eq!(recovered.template.base_image_ref, "demo:latest");
    }

    #[test]
    fn from_signed_rejects_untrusted_key() {
        let (key, _) = generate_keypair();
        let (other, _) = generate_keypair();
        let plan = sample_plan();
        let signed = plan.sign(&key, "submitter-1").unwrap();
        assert!(Plan::from_signed(&signed, &[other.verifying_key()]).is_err());
    }
}
