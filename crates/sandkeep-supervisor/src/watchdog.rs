//! Watchdog: a per-run background task that polls the
//! runtime adapter and kills a sandbox that outlives its policy's
//! `max_runtime`. One spawned task per armed run, torn down by
//! aborting its stored `JoinHandle` rather than by a shared
//! cancellation flag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use sandkeep_core::{SandboxId, SandboxPolicy, SandboxRun};
use sandkeep_runtime::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::Metrics;

const DEFAULT_BASE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval with a small jitter so many watchdogs armed around the
/// same moment don't all wake the runtime adapter on the same tick.
fn poll_interval(base: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..200);
    base + Duration::from_millis(jitter_ms)
}

pub struct Watchdog {
    runtime: Arc<dyn Runtime>,
    metrics: Arc<Metrics>,
    base_poll_interval: Duration,
    tasks: Mutex<HashMap<SandboxId, JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(runtime: Arc<dyn Runtime>, metrics: Arc<Metrics>) -> Self {
        Self::with_poll_interval(runtime, metrics, DEFAULT_BASE_POLL_INTERVAL)
    }

    /// Build a watchdog that polls at `base_poll_interval` (plus
    /// jitter) instead of the default 1s.
    pub fn with_poll_interval(runtime: Arc<dyn Runtime>, metrics: Arc<Metrics>, base_poll_interval: Duration) -> Self {
        Self {
            runtime,
            metrics,
            base_poll_interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Arm enforcement for `run` under `policy`. A no-op when the
    /// policy doesn't ask for enforcement; re-arming an already-armed
    /// run replaces its task.
    pub fn arm(&self, run: &SandboxRun, policy: SandboxPolicy) {
        if !policy.kill_on_breach {
            return;
        }

        let id = run.id.clone();
        let started_at = run.started_at.unwrap_or_else(chrono::Utc::now);
        let max_runtime = Duration::from_secs(policy.max_runtime_secs);
        let runtime = self.runtime.clone();
        let metrics = self.metrics.clone();
        let base_poll_interval = self.base_poll_interval;
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval(base_poll_interval)).await;

                let run = match runtime.inspect(&id).await {
                    Ok(run) => run,
                    Err(_) => return,
                };
                if run.status.is_terminal() {
                    return;
                }

                let elapsed = chrono::Utc::now().signed_duration_since(started_at);
                let elapsed = elapsed.to_std().unwrap_or(Duration::ZERO);
                if elapsed >= max_runtime {
                    warn!(sandbox_id = %id, elapsed_secs = elapsed.as_secs(), "runtime exceeded, killing");
                    metrics.record_kill("runtime_exceeded");
                    if let Err(e) = runtime.kill(&id).await {
                        warn!(sandbox_id = %id, error = %e, "watchdog kill failed");
                    }
                    return;
                }

                // Memory and network counters would be checked here
                // against `policy.max_memory_mb` and a network policy
                // ref, but `Runtime` exposes neither per sandbox, so
                // that check is skipped rather than guessed at.
            }
        });

        self.metrics.record_arm();
        if let Some(previous) = self.tasks.lock().expect("watchdog task map poisoned").insert(task_id, handle) {
            previous.abort();
        }
    }

    /// Disarm enforcement for `id`. Idempotent: disarming an unarmed or
    /// already-disarmed run is a no-op.
    pub fn disarm(&self, id: &SandboxId) {
        if let Some(handle) = self.tasks.lock().expect("watchdog task map poisoned").remove(id) {
            handle.abort();
            self.metrics.record_disarm();
            info!(sandbox_id = %id, "watchdog disarmed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::{HeatLevel, ResourceSpec, SandboxRequest, TemplateId, TenantId, NETWORK_NONE};
    use sandkeep_runtime::runtime::{MockRuntime, VmConfig};
    use std::collections::BTreeMap;

    fn policy(max_runtime_secs: u64, kill_on_breach: bool) -> SandboxPolicy {
        SandboxPolicy {
            template_id: TemplateId::from("tpl-demo"),
            max_resources: ResourceSpec { cpu_millicpu: 1000, mem_mb: 512, gpu: 0 },
            max_runtime_secs,
            max_memory_mb: 512,
            network_policy_ref: "net-default".into(),
            kill_on_breach,
            grace_policy_ref: "default".into(),
        }
    }

    async fn launch(runtime: &MockRuntime) -> SandboxRun {
        let req = SandboxRequest {
            id: SandboxId::new(),
            template_id: TemplateId::from("tpl-demo"),
            tenant_id: TenantId::from("tnt-acme"),
            command: "/bin/sleep".into(),
            args: vec!["infinity".into()],
            env: BTreeMap::new(),
            resources: ResourceSpec { cpu_millicpu: 500, mem_mb: 256, gpu: 0 },
            network_ref: NETWORK_NONE.into(),
            heat_level: HeatLevel::Warm,
            retention: Default::default(),
            metadata: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        };
        let vm_config = VmConfig {
            vcpus: 1,
            mem_mb: 256,
            rootfs_path: "/tmp/rootfs".into(),
            kernel_path: "/tmp/vmlinux".into(),
            tap_device: None,
            ip: None,
            snapshot: None,
        };
        runtime.launch(&req, vm_config).await.unwrap()
    }

    #[tokio::test]
    async fn disarm_before_breach_prevents_kill() {
        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(Metrics::new());
        let watchdog = Watchdog::new(runtime.clone(), metrics.clone());

        let run = launch(&runtime).await;
        watchdog.arm(&run, policy(3600, true));
        watchdog.disarm(&run.id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let inspected = runtime.inspect(&run.id).await.unwrap();
        assert_eq!(inspected.status, sandkeep_core::RunStatus::Running);
    }

    #[tokio::test]
    async fn kill_on_breach_false_never_arms() {
        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(Metrics::new());
        let watchdog = Watchdog::new(runtime.clone(), metrics.clone());

        let run = launch(&runtime).await;
        watchdog.arm(&run, policy(0, false));

        assert!(watchdog.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn kills_when_runtime_exceeds_policy() {
        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(Metrics::new());
        let watchdog = Watchdog::with_poll_interval(runtime.clone(), metrics.clone(), Duration::from_millis(10));

        let run = launch(&runtime).await;
        watchdog.arm(&run, policy(0, true));

        for _ in 0..50 {
            if runtime.inspect(&run.id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let inspected = runtime.inspect(&run.id).await.unwrap();
        assert_eq!(inspected.status, sandkeep_core::RunStatus::Failed);
        assert_eq!(metrics.kill_total("runtime_exceeded"), 1);
    }

    #[tokio::test]
    async fn disarm_is_idempotent() {
        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(Metrics::new());
        let watchdog = Watchdog::new(runtime, metrics);
        let id = SandboxId::new();
        watchdog.disarm(&id);
        watchdog.disarm(&id);
    }
}
