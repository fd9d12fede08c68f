//! [`Runtime`] implementation that delegates privileged hypervisor
//! operations to a `sandkeep-hostd` process over its control socket,
//! reusing `sandkeep_core::protocol`'s length-prefixed JSON framing and
//! `AdapterRequest`/`AdapterResponse` enums rather than inventing a new
//! wire format. Bookkeeping that hostd has no opinion about — run
//! status, resource allocation, config lookup — stays in this adapter's
//! own process, the same privileged/unprivileged split `hostd.rs`
//! draws against the rest of this crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use sandkeep_core::protocol::{recv_response, send_request, AdapterRequest, AdapterResponse};
use sandkeep_core::{ResourceSpec, SandboxId, SandboxRequest, SandboxRun};
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tracing::instrument;

use crate::runtime::{ExecOutput, ResourceCapacity, Runtime, RuntimeError, Stdio, VmConfig};

struct Entry {
    run: SandboxRun,
    config: VmConfig,
    request: SandboxRequest,
}

pub struct FirecrackerRuntime {
    socket_path: PathBuf,
    entries: Mutex<HashMap<SandboxId, Entry>>,
    changed: Notify,
}

impl FirecrackerRuntime {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    #[instrument(skip(self, req))]
    async fn call(&self, req: AdapterRequest) -> Result<AdapterResponse, RuntimeError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| RuntimeError::Transport(format!("connecting to hostd: {e}")))?;
        send_request(&mut stream, &req)
            .await
            .map_err(|e| RuntimeError::Transport(format!("sending to hostd: {e}")))?;
        recv_response(&mut stream)
            .await
            .map_err(|e| RuntimeError::Transport(format!("reading from hostd: {e}")))
    }

    fn with_entry<T>(&self, id: &SandboxId, f: impl FnOnce(&mut Entry) -> T) -> Result<T, RuntimeError> {
        let mut entries = self.entries.lock().expect("firecracker runtime state poisoned");
        let entry = entries.get_mut(id).ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
        Ok(f(entry))
    }

    fn set_status(&self, id: &SandboxId, to: sandkeep_core::RunStatus) -> Result<(), RuntimeError> {
        self.with_entry(id, |e| {
            let _ = e.run.transition(to, chrono::Utc::now());
        })?;
        self.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Runtime for FirecrackerRuntime {
    async fn launch(&self, req: &SandboxRequest, vm_config: VmConfig) -> Result<SandboxRun, RuntimeError> {
        {
            let entries = self.entries.lock().expect("firecracker runtime state poisoned");
            if entries.contains_key(&req.id) {
                return Err(RuntimeError::AlreadyExists(req.id.clone()));
            }
        }

        let vm_config_json = serde_json::to_value(&vm_config)
            .map_err(|e| RuntimeError::Transport(format!("serializing vm config: {e}")))?;
        let resp = self
            .call(AdapterRequest::Launch {
                sandbox_id: req.id.clone(),
                vm_config: vm_config_json,
            })
            .await?;
        match resp {
            AdapterResponse::Ok => {}
            AdapterResponse::Error { message } => return Err(RuntimeError::Transport(message)),
            other => return Err(RuntimeError::Transport(format!("unexpected hostd response to launch: {other:?}"))),
        }

        let now = chrono::Utc::now();
        let mut run = SandboxRun::pending(req.id.clone(), req.template_id.clone(), now);
        run.transition(sandkeep_core::RunStatus::Scheduled, now).ok();
        run.transition(sandkeep_core::RunStatus::Preparing, now).ok();
        run.transition(sandkeep_core::RunStatus::Running, now).ok();
        run.tap_device = vm_config.tap_device.clone();
        run.ip = vm_config.ip.clone();

        let result = run.clone();
        self.entries.lock().expect("firecracker runtime state poisoned").insert(
            req.id.clone(),
            Entry {
                run,
                config: vm_config,
                request: req.clone(),
            },
        );
        Ok(result)
    }

    async fn pause(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.with_entry(id, |_| ())?;
        match self.call(AdapterRequest::Pause { sandbox_id: id.clone() }).await? {
            AdapterResponse::Ok => self.set_status(id, sandkeep_core::RunStatus::Pausing),
            AdapterResponse::Error { message } => Err(RuntimeError::Transport(message)),
            other => Err(RuntimeError::Transport(format!("unexpected hostd response to pause: {other:?}"))),
        }
    }

    /// hostd's control protocol has no resume primitive (Firecracker
    /// exposes one over its own API, which hostd does not yet proxy);
    /// this only advances the tracked status, so pause/resume is not
    /// actually reversible against the real hypervisor yet.
    async fn resume(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.set_status(id, sandkeep_core::RunStatus::Running)
    }

    async fn shutdown(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.with_entry(id, |_| ())?;
        match self.call(AdapterRequest::Kill { sandbox_id: id.clone(), force: false }).await? {
            AdapterResponse::Ok | AdapterResponse::Exited { .. } => {
                self.with_entry(id, |e| e.run.exit_code = Some(0))?;
                self.set_status(id, sandkeep_core::RunStatus::Terminating)?;
                self.set_status(id, sandkeep_core::RunStatus::Succeeded)
            }
            AdapterResponse::Error { message } => Err(RuntimeError::Transport(message)),
            other => Err(RuntimeError::Transport(format!("unexpected hostd response to shutdown: {other:?}"))),
        }
    }

    async fn wait(&self, id: &SandboxId, timeout: std::time::Duration) -> Result<SandboxRun, RuntimeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.inspect(id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RuntimeError::WaitTimedOut);
            }
            tokio::select! {
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    async fn kill(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.with_entry(id, |_| ())?;
        match self.call(AdapterRequest::Kill { sandbox_id: id.clone(), force: true }).await? {
            AdapterResponse::Ok | AdapterResponse::Exited { .. } => {
                self.with_entry(id, |e| e.run.error_message = Some("grace period exceeded".into()))?;
                self.set_status(id, sandkeep_core::RunStatus::Terminating)?;
                self.set_status(id, sandkeep_core::RunStatus::Failed)
            }
            AdapterResponse::Error { message } => Err(RuntimeError::Transport(message)),
            other => Err(RuntimeError::Transport(format!("unexpected hostd response to kill: {other:?}"))),
        }
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxRun, RuntimeError> {
        self.with_entry(id, |e| e.run.clone())
    }

    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError> {
        Ok(self
            .entries
            .lock()
            .expect("firecracker runtime state poisoned")
            .values()
            .map(|e| e.run.clone())
            .collect())
    }

    async fn allocation(&self) -> Result<ResourceCapacity, RuntimeError> {
        let entries = self.entries.lock().expect("firecracker runtime state poisoned");
        let allocated = entries
            .values()
            .filter(|e| !e.run.status.is_terminal())
            .fold(ResourceSpec::ZERO, |acc, e| acc.saturating_add(&e.request.resources));
        Ok(ResourceCapacity { allocated })
    }

    async fn get_config(&self, id: &SandboxId) -> Result<(VmConfig, SandboxRequest), RuntimeError> {
        self.with_entry(id, |e| (e.config.clone(), e.request.clone()))
    }

    async fn create_snapshot(&self, id: &SandboxId, mem_path: &str, disk_path: &str) -> Result<(), RuntimeError> {
        self.with_entry(id, |_| ())?;
        match self
            .call(AdapterRequest::Snapshot {
                sandbox_id: id.clone(),
                mem_key: mem_path.to_string(),
                disk_key: disk_path.to_string(),
            })
            .await?
        {
            AdapterResponse::Ok => Ok(()),
            AdapterResponse::Error { message } => Err(RuntimeError::Transport(message)),
            other => Err(RuntimeError::Transport(format!("unexpected hostd response to snapshot: {other:?}"))),
        }
    }

    async fn stream_logs(&self, id: &SandboxId, _writer: &mut (dyn std::io::Write + Send), _follow: bool) -> Result<(), RuntimeError> {
        self.with_entry(id, |_| ())?;
        Err(RuntimeError::Transport("log streaming is not yet proxied through hostd".into()))
    }

    async fn exec(&self, id: &SandboxId, _argv: &[String], _stdio: Stdio) -> Result<ExecOutput, RuntimeError> {
        self.with_entry(id, |_| ())?;
        Err(RuntimeError::Transport("exec is not yet proxied through hostd".into()))
    }
}
