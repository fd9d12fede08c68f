//! Shutdown Controller "thanatos": resolves a grace
//! policy, optionally exports logs/artifacts and checkpoints via the
//! Sleep Manager, then drives `runtime.shutdown` + `runtime.wait`
//! bounded by the effective grace period before force-killing. Also
//! supports deferred, cancelable termination via `schedule`.
//!
//! State machine: Initiated -> (Export?) -> (Checkpoint?) -> Graceful
//! -> (Completed | Killed | Failed).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sandkeep_admission::{seal, AuditSink};
use sandkeep_core::{
    AuditEvent, AuditId, AuditResource, AuditResult, GracePolicy, RunStatus, SandboxId, SandboxRun,
    TemplateId, TerminationId,
};
use sandkeep_policy::PolicyStore;
use sandkeep_runtime::runtime::{Runtime, RuntimeError};
use sandkeep_store::BlobBackend;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::metrics::Metrics;
use crate::sleep::{SleepManager, SleepOptions};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("blob store error: {0}")]
    Blob(#[from] sandkeep_store::BlobError),
    #[error("a termination is already pending for sandbox {0}")]
    AlreadyScheduled(SandboxId),
}

#[derive(Debug, Clone)]
pub struct TerminationRequest {
    pub sandbox_id: SandboxId,
    pub template_id: TemplateId,
    pub reason: String,
    pub requested_by: String,
    pub force_timeout: Option<Duration>,
    pub skip_export: bool,
    pub skip_checkpoint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPhase {
    Checkpointed,
    Completed,
    Killed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TerminationOutcome {
    pub phase: TerminationPhase,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub checkpoint_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

/// Grace hard bounds: never above 5 minutes, never below 5s unless
/// the caller explicitly requested less.
const HARD_CAP: Duration = Duration::from_secs(300);
const SOFT_FLOOR: Duration = Duration::from_secs(5);

fn effective_grace(policy: &GracePolicy, requested: Option<Duration>) -> Duration {
    let max_grace = Duration::from_secs(policy.max_grace_secs).min(HARD_CAP);
    match requested {
        Some(ft) => ft.min(max_grace),
        None => Duration::from_secs(policy.default_grace_secs).max(SOFT_FLOOR).min(max_grace),
    }
}

struct DeferredEntry {
    sandbox_id: SandboxId,
    status: Arc<Mutex<DeferredStatus>>,
    cancel: Arc<Notify>,
}

pub struct ShutdownController {
    runtime: Arc<dyn Runtime>,
    store: Arc<dyn BlobBackend>,
    policies: Arc<PolicyStore>,
    sleep_manager: Arc<SleepManager>,
    metrics: Arc<Metrics>,
    audit_sink: Arc<dyn AuditSink>,
    audit_secret: Vec<u8>,
    chain_state: Arc<tokio::sync::Mutex<String>>,
    deferred: Mutex<HashMap<TerminationId, DeferredEntry>>,
    pending_by_sandbox: Mutex<HashMap<SandboxId, TerminationId>>,
}

impl ShutdownController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn Runtime>,
        store: Arc<dyn BlobBackend>,
        policies: Arc<PolicyStore>,
        sleep_manager: Arc<SleepManager>,
        metrics: Arc<Metrics>,
        audit_sink: Arc<dyn AuditSink>,
        audit_secret: Vec<u8>,
    ) -> Self {
        Self {
            runtime,
            store,
            policies,
            sleep_manager,
            metrics,
            audit_sink,
            audit_secret,
            chain_state: Arc::new(tokio::sync::Mutex::new(String::new())),
            deferred: Mutex::new(HashMap::new()),
            pending_by_sandbox: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve GracePolicy via `{reason -> policy} ∪ {template -> policy}
    /// ∪ default`, reason first.
    async fn resolve_grace_policy(&self, req: &TerminationRequest) -> GracePolicy {
        if let Some(p) = self.policies.find_grace_policy(&format!("reason:{}", req.reason)).await {
            return p;
        }
        if let Some(p) = self.policies.find_grace_policy(&format!("template:{}", req.template_id)).await {
            return p;
        }
        GracePolicy::default()
    }

    async fn export(&self, id: &SandboxId) -> Result<(), ShutdownError> {
        let mut buf = Vec::new();
        self.runtime.stream_logs(id, &mut buf, false).await?;
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        self.store.put(&format!("exports/{id}/logs/{nanos}.log"), &buf).await?;
        Ok(())
    }

    async fn graceful_shutdown(&self, id: &SandboxId, grace: Duration) -> Result<TerminationOutcome, ShutdownError> {
        self.runtime.shutdown(id).await?;
        match self.runtime.wait(id, grace).await {
            Ok(run) => {
                self.metrics.record_completed();
                Ok(TerminationOutcome {
                    phase: TerminationPhase::Completed,
                    exit_code: run.exit_code,
                    error_message: None,
                    checkpoint_key: None,
                })
            }
            Err(RuntimeError::WaitTimedOut) => {
                self.runtime.kill(id).await?;
                self.metrics.record_grace_timeout();
                Ok(TerminationOutcome {
                    phase: TerminationPhase::Killed,
                    exit_code: None,
                    error_message: Some("grace period exceeded".into()),
                    checkpoint_key: None,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn emit_audit(&self, req: &TerminationRequest, outcome: &TerminationOutcome) {
        let result = match outcome.phase {
            TerminationPhase::Completed | TerminationPhase::Checkpointed => AuditResult::Completed,
            TerminationPhase::Killed => AuditResult::Killed,
            TerminationPhase::Failed => AuditResult::Failed,
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("phase".to_string(), format!("{:?}", outcome.phase).to_lowercase());
        metadata.insert("reason".to_string(), req.reason.clone());
        if let Some(msg) = &outcome.error_message {
            metadata.insert("error_message".to_string(), msg.clone());
        }

        let mut previous = self.chain_state.lock().await;
        let mut event = AuditEvent {
            id: AuditId::new(),
            timestamp: chrono::Utc::now(),
            action: "terminated".into(),
            result,
            resource: AuditResource { kind: "sandbox".into(), id: req.sandbox_id.to_string() },
            identity: req.requested_by.clone(),
            metadata,
            previous_hash: previous.clone(),
            hash: String::new(),
        };
        seal(&mut event, &self.audit_secret);
        *previous = event.hash.clone();
        drop(previous);

        if let Err(e) = self.audit_sink.record(&event).await {
            warn!(error = %e, audit_id = %event.id, "audit sink failed to record shutdown event");
        }
    }

    /// Record a terminal `AuditEvent` for a sandbox that reached
    /// `Succeeded`/`Failed` on its own, with no call into
    /// `request_termination` at all. Every accepted request ends in
    /// exactly one terminal `AuditEvent` whether it was force-terminated
    /// or ran to completion naturally, so this is the happy-path
    /// counterpart to `emit_audit`'s other call site.
    pub async fn record_completion(&self, req: &TerminationRequest, run: &SandboxRun) {
        let outcome = TerminationOutcome {
            phase: if run.status == RunStatus::Succeeded { TerminationPhase::Completed } else { TerminationPhase::Failed },
            exit_code: run.exit_code,
            error_message: run.error_message.clone(),
            checkpoint_key: None,
        };
        self.emit_audit(req, &outcome).await;
    }

    /// Drive `req` through the termination state machine synchronously.
    #[instrument(skip_all, fields(sandbox_id = %req.sandbox_id, reason = %req.reason))]
    pub async fn request_termination(&self, req: TerminationRequest) -> Result<TerminationOutcome, ShutdownError> {
        let policy = self.resolve_grace_policy(&req).await;
        let grace = effective_grace(&policy, req.force_timeout);

        if !req.skip_export && (policy.export_logs || policy.export_artifacts) {
            if let Err(e) = self.export(&req.sandbox_id).await {
                warn!(error = %e, "log export failed during shutdown, continuing without it");
            }
        }

        if !req.skip_checkpoint && policy.checkpoint_first {
            match self.sleep_manager.sleep(&req.sandbox_id, SleepOptions::default()).await {
                Ok(record) => {
                    let outcome = TerminationOutcome {
                        phase: TerminationPhase::Checkpointed,
                        exit_code: None,
                        error_message: None,
                        checkpoint_key: Some(record.mem_key()),
                    };
                    self.emit_audit(&req, &outcome).await;
                    return Ok(outcome);
                }
                Err(e) => warn!(error = %e, "checkpoint-first failed, falling back to graceful shutdown"),
            }
        }

        let outcome = match self.graceful_shutdown(&req.sandbox_id, grace).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let outcome = TerminationOutcome {
                    phase: TerminationPhase::Failed,
                    exit_code: None,
                    error_message: Some(e.to_string()),
                    checkpoint_key: None,
                };
                self.emit_audit(&req, &outcome).await;
                return Err(e);
            }
        };
        self.emit_audit(&req, &outcome).await;
        info!(phase = ?outcome.phase, "termination complete");
        Ok(outcome)
    }

    /// Schedule a termination to run after `delay`. At most one Pending
    /// deferred termination may exist per sandbox at a time.
    pub fn schedule(self: &Arc<Self>, delay: Duration, req: TerminationRequest) -> Result<(TerminationId, DeferredStatus), ShutdownError> {
        let sandbox_id = req.sandbox_id.clone();
        if self.pending_by_sandbox.lock().expect("deferred map poisoned").contains_key(&sandbox_id) {
            return Err(ShutdownError::AlreadyScheduled(sandbox_id));
        }

        let termination_id = TerminationId::new();
        let status = Arc::new(Mutex::new(DeferredStatus::Pending));
        let cancel = Arc::new(Notify::new());

        self.pending_by_sandbox.lock().expect("deferred map poisoned").insert(sandbox_id.clone(), termination_id.clone());
        self.deferred.lock().expect("deferred map poisoned").insert(
            termination_id.clone(),
            DeferredEntry { sandbox_id: sandbox_id.clone(), status: status.clone(), cancel: cancel.clone() },
        );

        let controller = Arc::clone(self);
        let tid = termination_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.notified() => {
                    *status.lock().expect("deferred status poisoned") = DeferredStatus::Cancelled;
                    controller.pending_by_sandbox.lock().expect("deferred map poisoned").remove(&sandbox_id);
                    return;
                }
            }

            {
                let mut s = status.lock().expect("deferred status poisoned");
                if *s != DeferredStatus::Pending {
                    return;
                }
                *s = DeferredStatus::InProgress;
            }
            controller.pending_by_sandbox.lock().expect("deferred map poisoned").remove(&sandbox_id);

            let result = controller.request_termination(req).await;
            let mut s = status.lock().expect("deferred status poisoned");
            *s = match result {
                Ok(_) => DeferredStatus::Completed,
                Err(e) => {
                    warn!(termination_id = %tid, error = %e, "scheduled termination failed");
                    DeferredStatus::Failed
                }
            };
        });

        Ok((termination_id, DeferredStatus::Pending))
    }

    /// Cancel a deferred termination while it is still Pending. Returns
    /// `false` if it has already started or doesn't exist.
    pub fn cancel(&self, termination_id: &TerminationId) -> bool {
        let deferred = self.deferred.lock().expect("deferred map poisoned");
        let Some(entry) = deferred.get(termination_id) else { return false };

        let mut status = entry.status.lock().expect("deferred status poisoned");
        if *status != DeferredStatus::Pending {
            return false;
        }
        *status = DeferredStatus::Cancelled;
        entry.cancel.notify_one();
        let sandbox_id = entry.sandbox_id.clone();
        drop(status);
        drop(deferred);

        self.pending_by_sandbox.lock().expect("deferred map poisoned").remove(&sandbox_id);
        true
    }

    pub fn status(&self, termination_id: &TerminationId) -> Option<DeferredStatus> {
        self.deferred
            .lock()
            .expect("deferred map poisoned")
            .get(termination_id)
            .map(|e| *e.status.lock().expect("deferred status poisoned"))
    }
}
