//! Node Agent: the one long-running process per node that
//! drains its dispatch queue, drives each sandbox through launch, watch
//! and teardown, and keeps the control plane's registry warm with
//! heartbeats and run updates.
//!
//! Three loops run concurrently: [`Agent::run_queue_drain`] leases work
//! and spawns a lifecycle task per request, [`Agent::run_heartbeat`]
//! reports this node's capacity every [`HEARTBEAT_INTERVAL`] and
//! returns any out-of-band [`ControlCommand`]s, and
//! [`Agent::handle_control_command`] (driven by the heartbeat loop's
//! own results) turns a `Cancel`/`Sleep`/`Wake` into action against
//! whatever this node currently has in flight.
//!
//! `Agent` is generic over the same `RegistryClient`/`ScanHook` type
//! parameters as [`sandkeep_runtime::snapshot::SnapshotManager`], since
//! it owns one directly and nothing else in the workspace makes that
//! manager a trait object.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sandkeep_build::{RegistryClient, ScanHook};
use sandkeep_control::{ControlClient, ControlCommand, DispatchQueue, Registry};
use sandkeep_core::{
    NodeId, NodeInfo, Overlay, ResourceSpec, RunStatus, SandboxId, SandboxRequest, SandboxRun,
    TemplateId, TemplateSpec,
};
use sandkeep_policy::PolicyStore;
use sandkeep_runtime::network::{NetworkError, NetworkGateway};
use sandkeep_runtime::overlay::{OverlayError, OverlayPool};
use sandkeep_runtime::runtime::{Runtime, RuntimeError, SnapshotBase, VmConfig};
use sandkeep_runtime::snapshot::{SnapshotError, SnapshotManager};
use sandkeep_store::BlobBackend;
use sandkeep_supervisor::{ShutdownController, SleepManager, SleepOptions, TerminationPhase, TerminationRequest, Watchdog};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{info, instrument, warn};

/// How often the agent reports capacity to the control plane.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long a leased request stays invisible to other consumers while
/// this node works it.
const LEASE_VISIBILITY: Duration = Duration::from_secs(30);
/// Backstop wait for a sandbox that reaches neither a terminal runtime
/// state nor a control signal — only hit if watchdog enforcement is
/// disabled for the sandbox's policy and the guest hangs forever.
const MAX_WAIT: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no template registered for {0}")]
    UnknownTemplate(TemplateId),
    #[error("no policy registered for template {0}")]
    UnknownPolicy(TemplateId),
    #[error("network contract {0} not found for template {1}")]
    UnknownNetworkContract(String, TemplateId),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("blob store error: {0}")]
    Blob(#[from] sandkeep_store::BlobError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bookkeeping for a sandbox this node currently has in flight, kept
/// just long enough to route a control signal into its lifecycle task
/// and to release its overlay/network attachment on every exit path.
struct ActiveRun {
    overlay: Overlay,
    has_network: bool,
    cancel: Arc<Notify>,
}

/// One node's worth of capability handles plus the templates it has
/// been told about. Construct once per node process and call the three
/// `run_*` loops concurrently (typically via `tokio::join!` in the
/// binary's `main`).
pub struct Agent<R: RegistryClient, S: ScanHook> {
    node_id: NodeId,
    capacity: ResourceSpec,
    queue: Arc<dyn DispatchQueue>,
    registry: Arc<dyn Registry>,
    snapshots: Arc<SnapshotManager<R, S>>,
    overlays: Arc<OverlayPool>,
    network: Arc<NetworkGateway>,
    runtime: Arc<dyn Runtime>,
    store: Arc<dyn BlobBackend>,
    watchdog: Arc<Watchdog>,
    shutdown: Arc<ShutdownController>,
    sleep_manager: Arc<SleepManager>,
    policies: Arc<PolicyStore>,
    control: Arc<ControlClient>,
    control_addr: SocketAddr,
    control_server_name: String,
    node_address: String,
    rootfs_cache_dir: PathBuf,
    templates: Mutex<HashMap<TemplateId, TemplateSpec>>,
    active: Mutex<HashMap<SandboxId, ActiveRun>>,
}

#[allow(clippy::too_many_arguments)]
impl<R: RegistryClient + 'static, S: ScanHook + 'static> Agent<R, S> {
    pub fn new(
        node_id: NodeId,
        capacity: ResourceSpec,
        queue: Arc<dyn DispatchQueue>,
        registry: Arc<dyn Registry>,
        snapshots: Arc<SnapshotManager<R, S>>,
        overlays: Arc<OverlayPool>,
        network: Arc<NetworkGateway>,
        runtime: Arc<dyn Runtime>,
        store: Arc<dyn BlobBackend>,
        watchdog: Arc<Watchdog>,
        shutdown: Arc<ShutdownController>,
        sleep_manager: Arc<SleepManager>,
        policies: Arc<PolicyStore>,
        control: Arc<ControlClient>,
        control_addr: SocketAddr,
        control_server_name: impl Into<String>,
        node_address: impl Into<String>,
        rootfs_cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id,
            capacity,
            queue,
            registry,
            snapshots,
            overlays,
            network,
            runtime,
            store,
            watchdog,
            shutdown,
            sleep_manager,
            policies,
            control,
            control_addr,
            control_server_name: control_server_name.into(),
            node_address: node_address.into(),
            rootfs_cache_dir: rootfs_cache_dir.into(),
            templates: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_template(&self, template: TemplateSpec) {
        self.templates.lock().await.insert(template.id.clone(), template);
    }

    async fn template(&self, id: &TemplateId) -> Option<TemplateSpec> {
        self.templates.lock().await.get(id).cloned()
    }

    /// Queue-drain loop: lease the head of this node's visible queue,
    /// run the lifecycle to completion, then ack or nack. Runs forever;
    /// callers join it alongside `run_heartbeat`.
    pub async fn run_queue_drain(self: &Arc<Self>) {
        let consumer_id = format!("{}-agent", self.node_id);
        loop {
            let leased = self.queue.lease(&self.node_id, &consumer_id, LEASE_VISIBILITY).await;
            let Some((lease_id, request)) = leased else {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };

            let agent = Arc::clone(self);
            tokio::spawn(async move {
                let sandbox_id = request.id.clone();
                match agent.run_lifecycle(request).await {
                    Ok(()) => agent.queue.ack(&lease_id).await,
                    Err(e) => {
                        warn!(sandbox_id = %sandbox_id, error = %e, "lifecycle failed, nacking for redelivery");
                        agent.queue.nack(&lease_id).await;
                    }
                }
            });
        }
    }

    /// Heartbeat loop: report capacity every [`HEARTBEAT_INTERVAL`] and
    /// act on whatever out-of-band commands come back.
    pub async fn run_heartbeat(self: &Arc<Self>) {
        loop {
            let allocated = self.allocated().await;
            let node = NodeInfo {
                id: self.node_id.clone(),
                address: self.node_address.clone(),
                labels: Default::default(),
                capacity: self.capacity,
                allocated,
                last_heartbeat: chrono::Utc::now(),
            };

            match self.control.heartbeat(self.control_addr, &self.control_server_name, node).await {
                Ok(commands) => {
                    for command in commands {
                        self.handle_control_command(command).await;
                    }
                }
                Err(e) => warn!(error = %e, "heartbeat failed"),
            }

            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        }
    }

    async fn allocated(&self) -> ResourceSpec {
        self.runtime
            .allocation()
            .await
            .map(|a| a.allocated)
            .unwrap_or(ResourceSpec::ZERO)
    }

    /// Route a pushed command to whatever this node currently has in
    /// flight for its sandbox. Cancel and Sleep both need an active
    /// lifecycle task to act on; an unknown or already-finished sandbox
    /// is logged and otherwise ignored, since by the time the command
    /// arrived the work may already be done.
    #[instrument(skip(self))]
    async fn handle_control_command(self: &Arc<Self>, command: ControlCommand) {
        match command {
            ControlCommand::Cancel { sandbox_id } => {
                if let Some(active) = self.active.lock().await.get(&sandbox_id) {
                    active.cancel.notify_one();
                } else {
                    warn!(sandbox_id = %sandbox_id, "cancel for a sandbox this node has no active run for");
                }
            }
            ControlCommand::Sleep { sandbox_id } => {
                let agent = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = agent.sleep_manager.sleep(&sandbox_id, SleepOptions::default()).await {
                        warn!(sandbox_id = %sandbox_id, error = %e, "sleep command failed");
                    } else if let Some(active) = agent.active.lock().await.get(&sandbox_id) {
                        // The sandbox is already gone from the runtime;
                        // unblock the lifecycle task waiting on it so it
                        // runs step 8's cleanup instead of the 24h backstop.
                        active.cancel.notify_one();
                    }
                });
            }
            ControlCommand::Wake { sandbox_id } => {
                let agent = Arc::clone(self);
                tokio::spawn(async move {
                    match agent.sleep_manager.wake(&sandbox_id).await {
                        Ok(run) => agent.registry.upsert_run(run).await,
                        Err(e) => warn!(sandbox_id = %sandbox_id, error = %e, "wake command failed"),
                    }
                });
            }
        }
    }

    /// Fetch a blob to a local cache path keyed by its own key, skipping
    /// the round-trip if already present. Shared by the overlay base and
    /// the snapshot restore files, both of which are read from the same
    /// per-template snapshot.
    async fn fetch_to_cache(&self, key: &str, file_name: &str) -> Result<PathBuf, LifecycleError> {
        tokio::fs::create_dir_all(&self.rootfs_cache_dir).await?;
        let path = self.rootfs_cache_dir.join(file_name);
        if !path.exists() {
            let bytes = self.store.get(key).await?;
            tokio::fs::write(&path, &bytes).await?;
        }
        Ok(path)
    }

    /// The eight-step per-request lifecycle. Every resource
    /// acquired from step 2 onward is released on every exit path,
    /// including a failure partway through: each fallible step below
    /// tears down whatever prior steps already acquired before
    /// propagating its error.
    #[instrument(skip_all, fields(sandbox_id = %request.id, template_id = %request.template_id))]
    async fn run_lifecycle(self: &Arc<Self>, request: SandboxRequest) -> Result<(), LifecycleError> {
        let template = self
            .template(&request.template_id)
            .await
            .ok_or_else(|| LifecycleError::UnknownTemplate(request.template_id.clone()))?;

        // 1. Ensure a warm snapshot exists for this template.
        let snapshot = match self.snapshots.get(&request.template_id).await {
            Ok(s) => s,
            Err(_) => self.snapshots.prepare(&template).await?,
        };

        let local_disk = self
            .fetch_to_cache(&snapshot.disk_key, &format!("{}.disk", snapshot.id))
            .await?;
        let local_mem = self
            .fetch_to_cache(&snapshot.mem_key, &format!("{}.mem", snapshot.id))
            .await?;

        // 2. Allocate a per-sandbox overlay atop the snapshot's disk.
        let overlay = self.overlays.create(&local_disk, &request.id).await?;
        let cancel = Arc::new(Notify::new());
        self.active.lock().await.insert(
            request.id.clone(),
            ActiveRun { overlay: overlay.clone(), has_network: !request.wants_no_network(), cancel: cancel.clone() },
        );

        // 3. Attach network, unless the request opted out.
        let attachment = if request.wants_no_network() {
            None
        } else {
            match self.attach_network(&request).await {
                Ok(a) => Some(a),
                Err(e) => {
                    let _ = self.overlays.destroy(&overlay).await;
                    self.active.lock().await.remove(&request.id);
                    return Err(e);
                }
            }
        };

        // 4. Build the VmConfig.
        let vm_config = VmConfig {
            vcpus: (request.resources.cpu_millicpu / 1000).max(1),
            mem_mb: request.resources.mem_mb,
            rootfs_path: overlay.mount_path.to_string_lossy().into_owned(),
            kernel_path: template.kernel_image_ref.clone(),
            tap_device: attachment.as_ref().map(|a| a.tap_name.clone()),
            ip: attachment.as_ref().map(|a| a.ip.to_string()),
            snapshot: Some(SnapshotBase {
                mem_path: local_mem.to_string_lossy().into_owned(),
                disk_path: local_disk.to_string_lossy().into_owned(),
            }),
        };

        // 5. Launch.
        let mut run = match self.runtime.launch(&request, vm_config).await {
            Ok(run) => run,
            Err(e) => {
                if attachment.is_some() {
                    let _ = self.network.detach(&request.id).await;
                }
                let _ = self.overlays.destroy(&overlay).await;
                self.active.lock().await.remove(&request.id);
                return Err(e.into());
            }
        };
        run.node_id = Some(self.node_id.clone());
        run.overlay_id = Some(overlay.id.clone());
        run.snapshot_id = Some(snapshot.id.clone());
        self.registry.upsert_run(run.clone()).await;

        // 6. Arm the watchdog.
        let policy = self.policies.get_policy(&request.template_id).await;
        if let Some(policy) = &policy {
            self.watchdog.arm(&run, policy.clone());
        }

        // 7. Wait for a terminal runtime state or a control signal.
        let wait_timeout = policy
            .as_ref()
            .map(|p| Duration::from_secs(p.max_runtime_secs).min(MAX_WAIT))
            .unwrap_or(MAX_WAIT);

        let final_run = tokio::select! {
            result = self.runtime.wait(&request.id, wait_timeout) => {
                match result {
                    Ok(terminal) => {
                        let term_req = TerminationRequest {
                            sandbox_id: request.id.clone(),
                            template_id: request.template_id.clone(),
                            reason: "natural_completion".to_string(),
                            requested_by: format!("node:{}", self.node_id),
                            force_timeout: None,
                            skip_export: false,
                            skip_checkpoint: true,
                        };
                        self.shutdown.record_completion(&term_req, &terminal).await;
                        terminal
                    }
                    Err(_) => self.force_terminate(&request, run.clone(), "wait_timed_out").await,
                }
            }
            _ = cancel.notified() => self.force_terminate(&request, run.clone(), "control_signal").await,
        };

        // 8. Release everything steps 2-6 acquired.
        self.watchdog.disarm(&request.id);
        if attachment.is_some() {
            let _ = self.network.detach(&request.id).await;
        }
        let _ = self.overlays.destroy(&overlay).await;
        self.active.lock().await.remove(&request.id);
        self.registry.upsert_run(final_run).await;

        Ok(())
    }

    async fn attach_network(&self, request: &SandboxRequest) -> Result<sandkeep_runtime::network::Attachment, LifecycleError> {
        let policy = self
            .policies
            .get_policy(&request.template_id)
            .await
            .ok_or_else(|| LifecycleError::UnknownPolicy(request.template_id.clone()))?;
        let contract = self
            .policies
            .get_network_contract(&policy.network_policy_ref)
            .await
            .ok_or_else(|| LifecycleError::UnknownNetworkContract(policy.network_policy_ref.clone(), request.template_id.clone()))?;
        Ok(self.network.attach(&request.id, &contract).await?)
    }

    /// Delegate an in-flight sandbox to the Shutdown Controller and
    /// fold its outcome back onto the local `run` record, since the
    /// controller reports a [`TerminationOutcome`](sandkeep_supervisor::TerminationOutcome)
    /// rather than a [`SandboxRun`]. Called only for terminations this
    /// node itself initiated (a control signal, or `wait` erroring
    /// rather than observing a natural terminal state). A run that
    /// reaches `Succeeded`/`Failed` on its own goes through
    /// `ShutdownController::record_completion` instead, which records
    /// the same audit trail without the checkpoint/kill machinery.
    async fn force_terminate(&self, request: &SandboxRequest, mut run: SandboxRun, reason: &str) -> SandboxRun {
        let term_req = TerminationRequest {
            sandbox_id: request.id.clone(),
            template_id: request.template_id.clone(),
            reason: reason.to_string(),
            requested_by: format!("node:{}", self.node_id),
            force_timeout: None,
            skip_export: false,
            skip_checkpoint: false,
        };

        let now = chrono::Utc::now();
        match self.shutdown.request_termination(term_req).await {
            Ok(outcome) => match outcome.phase {
                TerminationPhase::Checkpointed => run.status = RunStatus::Sleeping,
                TerminationPhase::Completed => {
                    let _ = run.transition(RunStatus::Terminating, now);
                    let _ = run.transition(RunStatus::Succeeded, now);
                    run.exit_code = outcome.exit_code;
                }
                TerminationPhase::Killed | TerminationPhase::Failed => {
                    let _ = run.transition(RunStatus::Terminating, now);
                    let _ = run.transition(RunStatus::Failed, now);
                    run.error_message = outcome.error_message;
                }
            },
            Err(e) => {
                warn!(sandbox_id = %request.id, error = %e, "forced termination itself failed");
                let _ = run.transition(RunStatus::Terminating, now);
                let _ = run.transition(RunStatus::Failed, now);
                run.error_message = Some(e.to_string());
            }
        }
        info!(sandbox_id = %request.id, status = %run.status, "lifecycle terminated");
        run
    }
}
