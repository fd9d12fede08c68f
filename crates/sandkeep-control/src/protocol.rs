use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sandkeep_core::protocol::{read_frame, write_frame};
use sandkeep_core::{NodeInfo, SandboxId, SandboxRequest, SandboxRun};

/// One message sent to the control server over its QUIC bidirectional
/// stream. Node agents only ever send `Heartbeat`; `Submit`, `Status`
/// and `Cancel` are the thin operator surface used by the CLI client,
/// sharing the same wire transport and connection-per-request shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Periodic liveness report; also registers the node on first
    /// contact.
    Heartbeat(NodeInfo),
    /// Admit and schedule a new sandbox run.
    Submit(SandboxRequest),
    /// Look up the current state of a run.
    Status(SandboxId),
    /// Cancel a run: direct transition if it hasn't been leased by a
    /// node yet, otherwise a queued `ControlCommand::Cancel` delivered
    /// on the owning node's next heartbeat.
    Cancel(SandboxId),
}

/// A out-of-band instruction the control plane pushes down to a node
/// agent, piggybacked on the next heartbeat response rather than opening
/// a new connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    Cancel { sandbox_id: SandboxId },
    Sleep { sandbox_id: SandboxId },
    Wake { sandbox_id: SandboxId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Commands(Vec<ControlCommand>),
    Submitted { sandbox_id: SandboxId, node_id: sandkeep_core::NodeId },
    Status(Option<SandboxRun>),
    Canceled,
    Error { message: String },
}

pub async fn send_request<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    req: &ControlRequest,
) -> Result<()> {
    let data = serde_json::to_vec(req).context("failed to serialize control request")?;
    write_frame(writer, &data).await
}

pub async fn recv_request<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<ControlRequest> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).context("failed to deserialize control request")
}

pub async fn send_response<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    resp: &ControlResponse,
) -> Result<()> {
    let data = serde_json::to_vec(resp).context("failed to serialize control response")?;
    write_frame(writer, &data).await
}

pub async fn recv_response<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<ControlResponse> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).context("failed to deserialize control response")
}
