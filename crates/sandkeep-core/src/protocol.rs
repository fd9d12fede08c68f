use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ids::SandboxId;

/// Default Unix domain socket path for the node agent's local control
/// channel to the runtime adapter.
pub const AGENT_SOCKET_PATH: &str = "/run/sandkeep/agentd.sock";

/// Maximum frame size for agentd IPC (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ============================================================================
// Request/Response types
// ============================================================================

/// Request from the node agent to the runtime adapter (privileged
/// executor). Each variant maps to exactly one privileged operation the
/// agent does not perform itself: the agent decides WHAT to do, the
/// adapter decides HOW against the concrete hypervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdapterRequest {
    /// Launch a prepared sandbox (overlay + TAP already attached).
    Launch {
        sandbox_id: SandboxId,
        vm_config: serde_json::Value,
    },
    /// Pause a running sandbox ahead of a sleep snapshot.
    Pause { sandbox_id: SandboxId },
    /// Snapshot a paused sandbox to the given memory/disk blob keys.
    Snapshot {
        sandbox_id: SandboxId,
        mem_key: String,
        disk_key: String,
    },
    /// Restore a sandbox from a snapshot's memory/disk blob keys.
    Restore {
        sandbox_id: SandboxId,
        mem_key: String,
        disk_key: String,
    },
    /// Kill a sandbox, optionally forcibly (SIGKILL rather than graceful).
    Kill { sandbox_id: SandboxId, force: bool },
    /// Health check.
    Ping,
}

/// Response from the runtime adapter to the node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdapterResponse {
    /// Operation succeeded.
    Ok,
    /// Operation succeeded and the sandbox exited with this code.
    Exited { exit_code: i32 },
    /// Error with description.
    Error { message: String },
    /// Pong response to Ping.
    Pong,
}

// ============================================================================
// Frame protocol (length-prefixed JSON over Unix socket)
// ============================================================================

/// Read a length-prefixed JSON frame from a tokio AsyncRead.
pub async fn read_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .with_context(|| "failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .with_context(|| "failed to read frame body")?;

    Ok(buf)
}

/// Write a length-prefixed JSON frame to a tokio AsyncWrite.
pub async fn write_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .with_context(|| "failed to write frame length")?;
    writer
        .write_all(data)
        .await
        .with_context(|| "failed to write frame body")?;
    writer
        .flush()
        .await
        .with_context(|| "failed to flush frame")?;
    Ok(())
}

/// Serialize and send a request.
pub async fn send_request<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    req: &AdapterRequest,
) -> Result<()> {
    let data = serde_json::to_vec(req).with_context(|| "failed to serialize request")?;
    write_frame(writer, &data).await
}

/// Read and deserialize a request.
pub async fn recv_request<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<AdapterRequest> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).with_context(|| "failed to deserialize request")
}

/// Serialize and send a response.
pub async fn send_response<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    resp: &AdapterResponse,
) -> Result<()> {
    let data = serde_json::to_vec(resp).with_context(|| "failed to serialize response")?;
    write_frame(writer, &data).await
}

/// Read and deserialize a response.
pub async fn recv_response<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<AdapterResponse> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).with_context(|| "failed to deserialize response")
}

// ============================================================================
// Tests
// ============================================================================
