//! Runtime Adapter: a uniform interface over a concrete
//! hypervisor. Two implementations satisfy it — [`MockRuntime`], an
//! in-memory stand-in used by tests and by driving the node agent's
//! lifecycle end-to-end, and [`crate::firecracker::FirecrackerRuntime`],
//! which talks to a real Firecracker process over its control socket.
//! Callers hold an `Arc<dyn Runtime>` and never know which backend
//! they have.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Mutex;

use async_trait::async_trait;
use sandkeep_core::{ResourceSpec, SandboxId, SandboxRequest, SandboxRun};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),
    #[error("sandbox {0} already exists")]
    AlreadyExists(SandboxId),
    #[error("runtime transport error: {0}")]
    Transport(String),
    #[error("wait timed out before the sandbox reached a terminal state")]
    WaitTimedOut,
}

/// Base to restore from when launching, as opposed to a cold boot from
/// `rootfs_path` + `kernel_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBase {
    pub mem_path: String,
    pub disk_path: String,
}

/// Everything the hypervisor needs to boot one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub vcpus: u32,
    pub mem_mb: u32,
    pub rootfs_path: String,
    pub kernel_path: String,
    pub tap_device: Option<String>,
    pub ip: Option<String>,
    #[serde(default)]
    pub snapshot: Option<SnapshotBase>,
}

/// Sum of allocated resources across all non-terminal runs (spec
/// §4.6's `allocation()`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub allocated: ResourceSpec,
}

/// How a sandbox should receive stdio for `exec`.
#[derive(Debug, Clone)]
pub enum Stdio {
    Null,
    Capture,
}

/// Result of an `exec` call.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn launch(&self, req: &SandboxRequest, vm_config: VmConfig) -> Result<SandboxRun, RuntimeError>;
    async fn pause(&self, id: &SandboxId) -> Result<(), RuntimeError>;
    async fn resume(&self, id: &SandboxId) -> Result<(), RuntimeError>;
    async fn shutdown(&self, id: &SandboxId) -> Result<(), RuntimeError>;
    /// Block until `id` reaches a terminal status or `timeout` elapses.
    /// A caller that wants true cancellation races this future against
    /// its own cancellation signal with `tokio::select!` rather than
    /// passing a token in, since the adapter itself has no notion of
    /// "why" a wait should stop early.
    async fn wait(&self, id: &SandboxId, timeout: std::time::Duration) -> Result<SandboxRun, RuntimeError>;
    async fn kill(&self, id: &SandboxId) -> Result<(), RuntimeError>;
    async fn inspect(&self, id: &SandboxId) -> Result<SandboxRun, RuntimeError>;
    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError>;
    async fn allocation(&self) -> Result<ResourceCapacity, RuntimeError>;
    async fn get_config(&self, id: &SandboxId) -> Result<(VmConfig, SandboxRequest), RuntimeError>;
    async fn create_snapshot(&self, id: &SandboxId, mem_path: &str, disk_path: &str) -> Result<(), RuntimeError>;
    async fn stream_logs(&self, id: &SandboxId, writer: &mut (dyn std::io::Write + Send), follow: bool) -> Result<(), RuntimeError>;
    async fn exec(&self, id: &SandboxId, argv: &[String], stdio: Stdio) -> Result<ExecOutput, RuntimeError>;
}

struct Entry {
    run: SandboxRun,
    config: VmConfig,
    request: SandboxRequest,
    logs: Vec<u8>,
}

/// In-memory [`Runtime`] used by tests and by the node agent's own
/// lifecycle tests. Every state transition is immediate; `wait`
/// resolves as soon as the run is terminal, polling on a `Notify`
/// rather than a busy loop.
pub struct MockRuntime {
    entries: Mutex<HashMap<SandboxId, Entry>>,
    changed: Notify,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    fn with_entry<T>(&self, id: &SandboxId, f: impl FnOnce(&mut Entry) -> T) -> Result<T, RuntimeError> {
        let mut entries = self.entries.lock().expect("mock runtime poisoned");
        let entry = entries.get_mut(id).ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
        Ok(f(entry))
    }

    fn transition(&self, id: &SandboxId, to: sandkeep_core::RunStatus) -> Result<(), RuntimeError> {
        self.with_entry(id, |e| {
            let now = chrono::Utc::now();
            let _ = e.run.transition(to, now);
        })?;
        self.changed.notify_waiters();
        Ok(())
    }

    /// Test/simulation hook: mark a run as having exited on its own,
    /// as a real hypervisor process would.
    pub fn simulate_exit(&self, id: &SandboxId, exit_code: i32) -> Result<(), RuntimeError> {
        self.with_entry(id, |e| {
            e.run.exit_code = Some(exit_code);
        })?;
        self.transition(id, sandkeep_core::RunStatus::Terminating)?;
        self.transition(
            id,
            if exit_code == 0 {
                sandkeep_core::RunStatus::Succeeded
            } else {
                sandkeep_core::RunStatus::Failed
            },
        )
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn launch(&self, req: &SandboxRequest, vm_config: VmConfig) -> Result<SandboxRun, RuntimeError> {
        let mut entries = self.entries.lock().expect("mock runtime poisoned");
        // A terminal entry's id is free to reuse (the sleep/wake cycle
        // relaunches the same `SandboxId`); only a still-live run
        // blocks a second launch under the same id.
        if let Some(existing) = entries.get(&req.id) {
            if !existing.run.status.is_terminal() {
                return Err(RuntimeError::AlreadyExists(req.id.clone()));
            }
        }
        let now = chrono::Utc::now();
        let mut run = SandboxRun::pending(req.id.clone(), req.template_id.clone(), now);
        run.transition(sandkeep_core::RunStatus::Scheduled, now).ok();
        run.transition(sandkeep_core::RunStatus::Preparing, now).ok();
        run.transition(sandkeep_core::RunStatus::Running, now).ok();
        run.tap_device = vm_config.tap_device.clone();
        run.ip = vm_config.ip.clone();

        let result = run.clone();
        entries.insert(
            req.id.clone(),
            Entry {
                run,
                config: vm_config,
                request: req.clone(),
                logs: Vec::new(),
            },
        );
        Ok(result)
    }

    async fn pause(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.transition(id, sandkeep_core::RunStatus::Pausing)
    }

    async fn resume(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.transition(id, sandkeep_core::RunStatus::Running)
    }

    async fn shutdown(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.with_entry(id, |e| {
            e.run.exit_code = Some(0);
        })?;
        self.transition(id, sandkeep_core::RunStatus::Terminating)?;
        self.transition(id, sandkeep_core::RunStatus::Succeeded)
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
        self.with_entry(id, |e| {
            e.run.exit_code = None;
            e.run.error_message = Some("grace period exceeded".into());
        })?;
        self.transition(id, sandkeep_core::RunStatus::Terminating)?;
        self.transition(id, sandkeep_core::RunStatus::Failed)
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxRun, RuntimeError> {
        self.with_entry(id, |e| e.run.clone())
    }

    async fn list(&self) -> Result<Vec<SandboxRun>, RuntimeError> {
        Ok(self
            .entries
            .lock()
            .expect("mock runtime poisoned")
            .values()
            .map(|e| e.run.clone())
            .collect())
    }

    async fn allocation(&self) -> Result<ResourceCapacity, RuntimeError> {
        let entries = self.entries.lock().expect("mock runtime poisoned");
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
        tokio::fs::write(mem_path, b"mock-mem-snapshot")
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        tokio::fs::write(disk_path, b"mock-disk-snapshot")
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn stream_logs(&self, id: &SandboxId, writer: &mut (dyn std::io::Write + Send), _follow: bool) -> Result<(), RuntimeError> {
        let logs = self.with_entry(id, |e| e.logs.clone())?;
        writer.write_all(&logs).map_err(|e| RuntimeError::Transport(e.to_string()))
    }

    async fn exec(&self, id: &SandboxId, argv: &[String], _stdio: Stdio) -> Result<ExecOutput, RuntimeError> {
        self.with_entry(id, |_| ())?;
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("mock exec: {}", argv.join(" ")).into_bytes(),
            stderr: Vec::new(),
        })
    }
}
