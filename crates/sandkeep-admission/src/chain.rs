use sandkeep_core::SandboxRequest;

use crate::judge::{Judge, Verdict};

/// Runs a fixed, ordered list of judges against a request strictly
/// sequentially, short-circuiting on the first non-`Accept` verdict
///. Judges are assembled once at startup; there is no
/// runtime plugin loading.
pub struct AdmissionChain {
    judges: Vec<Box<dyn Judge>>,
}

impl AdmissionChain {
    pub fn new(judges: Vec<Box<dyn Judge>>) -> Self {
        Self { judges }
    }

    /// Evaluate every judge in order. Returns the first non-`Accept`
    /// verdict along with the name of the judge that produced it, or
    /// `Verdict::Accept` if every judge accepted.
    pub async fn evaluate(&self, request: &SandboxRequest) -> (Verdict, Option<&str>) {
        for judge in &self.judges {
            let verdict = judge.pre_admit(request).await;
            if !verdict.is_accept() {
                return (verdict, Some(judge.name()));
            }
        }
        (Verdict::Accept, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandkeep_core::{HeatLevel, ResourceSpec, SandboxId, TemplateId, TenantId};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingJudge {
        name: &'static str,
        verdict: Verdict,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Judge for CountingJudge {
        fn name(&self) -> &str {
            self.name
        }

        async fn pre_admit(&self, _request: &SandboxRequest) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict.clone()
        }
    }

    fn sample_request() -> SandboxRequest {
        SandboxRequest {
            id: SandboxId::new(),
            template_id: TemplateId::from("tpl-demo"),
            tenant_id: TenantId::from("tnt-acme"),
            command: "true".into(),
            args: vec![],
            env: BTreeMap::new(),
            resources: ResourceSpec::ZERO,
            network_ref: "no-net".into(),
            heat_level: HeatLevel::Warm,
            retention: Default::default(),
            metadata: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn all_judges_accept_means_chain_accepts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = AdmissionChain::new(vec![
            Box::new(CountingJudge {
                name: "a",
                verdict: Verdict::Accept,
                calls: calls.clone(),
            }),
            Box::new(CountingJudge {
                name: "b",
                verdict: Verdict::Accept,
                calls: calls.clone(),
            }),
        ]);

        let (verdict, culprit) = chain.evaluate(&sample_request()).await;
        assert_eq!(verdict, Verdict::Accept);
        assert!(culprit.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_rejection_short_circuits_remaining_judges() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = AdmissionChain::new(vec![
            Box::new(CountingJudge {
                name: "a",
                verdict: Verdict::Reject("no".into()),
                calls: calls.clone(),
            }),
            Box::new(CountingJudge {
                name: "b",
                verdict: Verdict::Accept,
                calls: calls.clone(),
            }),
        ]);

        let (verdict, culprit) = chain.evaluate(&sample_request()).await;
        assert!(matches!(verdict, Verdict::Reject(_)));
        assert_eq!(culprit, Some("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
