use std::sync::Arc;

use async_trait::async_trait;
use sandkeep_core::{AuditEvent, AuditId, AuditResource, AuditResult, SandboxRequest};
use tokio::sync::Mutex;
use tracing::warn;

use crate::audit_chain::seal;
use crate::judge::{Judge, Verdict};
use crate::sink::AuditSink;

/// Stamps an `AuditEvent` for every admission attempt and seals it into
/// the hash chain before handing it to the configured sink. Always
/// accepts — the Audit Judge only records, it never gates —
/// and a sink failure is logged, not propagated, so a storage hiccup can
/// never stall admission.
pub struct AuditJudge {
    sink: Arc<dyn AuditSink>,
    secret: Vec<u8>,
    last_hash: Mutex<String>,
}

impl AuditJudge {
    pub fn new(sink: Arc<dyn AuditSink>, secret: Vec<u8>) -> Self {
        Self {
            sink,
            secret,
            last_hash: Mutex::new(String::new()),
        }
    }
}

#[async_trait]
impl Judge for AuditJudge {
    fn name(&self) -> &str {
        "audit"
    }

    async fn pre_admit(&self, request: &SandboxRequest) -> Verdict {
        let mut previous = self.last_hash.lock().await;

        let mut event = AuditEvent {
            id: AuditId::new(),
            timestamp: chrono::Utc::now(),
            action: "admission_attempt".into(),
            result: AuditResult::Accepted,
            resource: AuditResource {
                kind: "sandbox_request".into(),
                id: request.id.to_string(),
            },
            identity: request.tenant_id.to_string(),
            metadata: request.metadata.clone(),
            previous_hash: previous.clone(),
            hash: String::new(),
        };
        seal(&mut event, &self.secret);
        *previous = event.hash.clone();
        drop(previous);

        if let Err(err) = self.sink.record(&event).await {
            warn!(error = %err, audit_id = %event.id, "audit sink failed to record event");
        }

        Verdict::Accept
    }
}
