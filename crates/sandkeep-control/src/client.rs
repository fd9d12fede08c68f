use std::net::SocketAddr;

use anyhow::{Context, Result};
use sandkeep_core::{NodeId, NodeInfo, SandboxId, SandboxRequest, SandboxRun};
use tracing::{debug, info};

use crate::protocol::{self, ControlCommand, ControlRequest, ControlResponse};
use crate::tls;

/// QUIC client used by node agents to deliver heartbeats, and by
/// anything pushing commands (the CLI, the supervisor) to reach the
/// control server through the same transport.
pub struct ControlClient {
    endpoint: quinn::Endpoint,
}

impl ControlClient {
    pub fn new() -> Result<Self> {
        let client_config = tls::client_config()?;

        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse()?)
            .context("failed to create QUIC client endpoint")?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint })
    }

    /// Send one heartbeat and return the commands queued for this node.
    pub async fn heartbeat(&self, addr: SocketAddr, server_name: &str, node: NodeInfo) -> Result<Vec<ControlCommand>> {
        debug!(%addr, node = %node.id, "sending heartbeat");
        let connection = self
            .endpoint
            .connect(addr, server_name)
            .with_context(|| format!("failed to initiate connection to {addr}"))?
            .await
            .with_context(|| format!("failed to establish connection to {addr}"))?;

        let (mut send, mut recv) = connection.open_bi().await.context("failed to open bi-directional stream")?;

        protocol::send_request(&mut send, &ControlRequest::Heartbeat(node)).await?;
        send.finish().context("finishing heartbeat stream")?;

        let response = protocol::recv_response(&mut recv).await?;
        connection.close(quinn::VarInt::from_u32(0), b"done");

        match response {
            ControlResponse::Commands(commands) => Ok(commands),
            ControlResponse::Error { message } => anyhow::bail!(message),
            other => anyhow::bail!("unexpected response to heartbeat: {other:?}"),
        }
    }

    /// Open a connection, send one request, and return the raw response.
    /// `heartbeat` has its own inline copy of this shape since it needs
    /// the connection kept open for `heartbeat_multi`'s spawned tasks;
    /// everything else goes through here.
    async fn call(&self, addr: SocketAddr, server_name: &str, req: ControlRequest) -> Result<ControlResponse> {
        let connection = self
            .endpoint
            .connect(addr, server_name)
            .with_context(|| format!("failed to initiate connection to {addr}"))?
            .await
            .with_context(|| format!("failed to establish connection to {addr}"))?;

        let (mut send, mut recv) = connection.open_bi().await.context("failed to open bi-directional stream")?;
        protocol::send_request(&mut send, &req).await?;
        send.finish().context("finishing request stream")?;

        let response = protocol::recv_response(&mut recv).await?;
        connection.close(quinn::VarInt::from_u32(0), b"done");
        Ok(response)
    }

    /// Submit a new sandbox run and return the node it was scheduled on.
    pub async fn submit(&self, addr: SocketAddr, server_name: &str, request: SandboxRequest) -> Result<NodeId> {
        match self.call(addr, server_name, ControlRequest::Submit(request)).await? {
            ControlResponse::Submitted { node_id, .. } => Ok(node_id),
            ControlResponse::Error { message } => anyhow::bail!(message),
            other => anyhow::bail!("unexpected response to submit: {other:?}"),
        }
    }

    /// Look up the current state of a run, `None` if the control plane
    /// has no record of it.
    pub async fn status(&self, addr: SocketAddr, server_name: &str, id: SandboxId) -> Result<Option<SandboxRun>> {
        match self.call(addr, server_name, ControlRequest::Status(id)).await? {
            ControlResponse::Status(run) => Ok(run),
            ControlResponse::Error { message } => anyhow::bail!(message),
            other => anyhow::bail!("unexpected response to status: {other:?}"),
        }
    }

    /// Cancel a run, pending or already scheduled.
    pub async fn cancel(&self, addr: SocketAddr, server_name: &str, id: SandboxId) -> Result<()> {
        match self.call(addr, server_name, ControlRequest::Cancel(id)).await? {
            ControlResponse::Canceled => Ok(()),
            ControlResponse::Error { message } => anyhow::bail!(message),
            other => anyhow::bail!("unexpected response to cancel: {other:?}"),
        }
    }

    /// Send heartbeats to multiple control-plane replicas in parallel,
    /// collecting all responses (useful once a control plane runs more
    /// than one listener behind a discovery layer).
    pub async fn heartbeat_multi(
        &self,
        targets: &[(SocketAddr, &str)],
        node: NodeInfo,
    ) -> Vec<(SocketAddr, Result<Vec<ControlCommand>>)> {
        let mut set = tokio::task::JoinSet::new();

        for (addr, server_name) in targets {
            let addr = *addr;
            let server_name = server_name.to_string();
            let node = node.clone();
            let endpoint = self.endpoint.clone();

            set.spawn(async move {
                let client = ControlClient { endpoint };
                let result = client.heartbeat(addr, &server_name, node).await;
                (addr, result)
            });
        }

        let mut results = Vec::new();
        while let Some(join_result) = set.join_next().await {
            match join_result {
                Ok(pair) => results.push(pair),
                Err(err) => info!(error = %err, "heartbeat task panicked"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_endpoint_constructs() {
        assert!(ControlClient::new().is_ok());
    }
}
