use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandkeep_core::SandboxRequest;
use tokio::sync::Mutex;

use crate::judge::{Judge, Verdict};

/// Optional per-tenant admission rate limiter, disabled by default. The
/// teacher's security crate declares rate limiting as part of its scope
/// but never implements it for this surface; here it exists as an
/// opt-in enrichment judge rather than a mandatory chain member, so a
/// deployment with no configured limits pays no tax.
pub struct RateJudge {
    enabled: bool,
    window: Duration,
    max_per_window: u32,
    history: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateJudge {
    /// A rate judge that accepts every request, for chains that don't
    /// want admission rate limiting at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            window: Duration::from_secs(60),
            max_per_window: 0,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(window: Duration, max_per_window: u32) -> Self {
        Self {
            enabled: true,
            window,
            max_per_window,
            history: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Judge for RateJudge {
    fn name(&self) -> &str {
        "rate"
    }

    async fn pre_admit(&self, request: &SandboxRequest) -> Verdict {
        if !self.enabled {
            return Verdict::Accept;
        }

        let now = Instant::now();
        let mut history = self.history.lock().await;
        let entries = history.entry(request.tenant_id.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < self.window);

        if entries.len() as u32 >= self.max_per_window {
            return Verdict::Reject(format!(
                "tenant {} exceeded {} admissions per {:?}",
                request.tenant_id, self.max_per_window, self.window
            ));
        }

        entries.push(now);
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::{HeatLevel, ResourceSpec, SandboxId, TemplateId, TenantId};
    use std::collections::BTreeMap;

    fn request_for(tenant: &str) -> SandboxRequest {
        SandboxRequest {
            id: SandboxId::new(),
            template_id: TemplateId::from("tpl-demo"),
            tenant_id: TenantId::from(tenant),
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
    async fn disabled_judge_always_accepts() {
        let judge = RateJudge::disabled();
        for _ in 0..100 {
            assert_eq!(judge.pre_admit(&request_for("tnt-acme")).await, Verdict::Accept);
        }
    }

    #[tokio::test]
    async fn enabled_judge_rejects_once_window_is_full() {
        let judge = RateJudge::enabled(Duration::from_secs(60), 2);
        assert_eq!(judge.pre_admit(&request_for("tnt-acme")).await, Verdict::Accept);
        assert_eq!(judge.pre_admit(&request_for("tnt-acme")).await, Verdict::Accept);
        assert!(matches!(
            judge.pre_admit(&request_for("tnt-acme")).await,
            Verdict::Reject(_)
        ));
    }

    #[tokio::test]
    async fn limits_are_tracked_independently_per_tenant() {
        let judge = RateJudge::enabled(Duration::from_secs(60), 1);
        assert_eq!(judge.pre_admit(&request_for("tnt-acme")).await, Verdict::Accept);
        assert_eq!(judge.pre_admit(&request_for("tnt-other")).await, Verdict::Accept);
    }
}
