use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sandkeep_core::observability::metrics;
use sandkeep_core::{NodeId, RunStatus, SandboxRun};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::protocol::{self, ControlCommand, ControlRequest, ControlResponse};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::tls;

/// Attempts the scheduler makes before giving up on a CLI-submitted
/// request and reporting `Error` back to the caller.
const SUBMIT_MAX_ATTEMPTS: u32 = 3;

/// Commands queued for delivery to a node agent on its next heartbeat,
/// piggybacked rather than pushed over a new connection.
#[derive(Clone, Default)]
pub struct CommandOutbox {
    by_node: Arc<Mutex<HashMap<NodeId, Vec<ControlCommand>>>>,
}

impl CommandOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, node_id: NodeId, command: ControlCommand) {
        self.by_node.lock().await.entry(node_id).or_default().push(command);
    }

    async fn drain(&self, node_id: &NodeId) -> Vec<ControlCommand> {
        self.by_node.lock().await.remove(node_id).unwrap_or_default()
    }
}

/// QUIC server accepting node-agent heartbeats and replying with any
/// commands queued for that node.
pub struct ControlServer {
    registry: Arc<dyn Registry>,
    outbox: CommandOutbox,
    scheduler: Arc<Scheduler>,
}

impl ControlServer {
    pub fn new(registry: Arc<dyn Registry>, outbox: CommandOutbox, scheduler: Arc<Scheduler>) -> Self {
        Self {
            registry,
            outbox,
            scheduler,
        }
    }

    /// Bind and serve until SIGINT. Each node agent connection carries a
    /// stream of heartbeats; the connection itself is long-lived, a new
    /// bi-directional stream is opened per heartbeat.
    pub async fn serve(self: Arc<Self>, listen: SocketAddr, identity: &tls::Identity) -> Result<()> {
        let server_config = tls::server_config(identity)?;
        let endpoint = quinn::Endpoint::server(server_config, listen)
            .with_context(|| format!("failed to bind control-plane QUIC endpoint on {listen}"))?;

        info!(%listen, "control server listening");

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                incoming = endpoint.accept() => {
                    match incoming {
                        Some(incoming) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = this.handle_connection(incoming).await {
                                    warn!(error = %err, "control connection ended with error");
                                }
                            });
                        }
                        None => break,
                    }
                }
                _ = &mut shutdown => {
                    info!("control server received shutdown signal");
                    break;
                }
            }
        }

        endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, incoming: quinn::Incoming) -> Result<()> {
        let connection = match incoming.await {
            Ok(connection) => {
                metrics().connections_accepted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                connection
            }
            Err(err) => {
                metrics().connections_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(err).context("failed to accept control connection");
            }
        };

        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.handle_stream(send, recv).await {
                            error!(error = %err, "control stream failed");
                        }
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_)) => break,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    async fn handle_stream(&self, mut send: quinn::SendStream, mut recv: quinn::RecvStream) -> Result<()> {
        use std::sync::atomic::Ordering;

        let request = protocol::recv_request(&mut recv).await?;
        metrics().requests_total.fetch_add(1, Ordering::Relaxed);

        let response = match request {
            ControlRequest::Heartbeat(node) => {
                metrics().requests_heartbeat.fetch_add(1, Ordering::Relaxed);
                let node_id = node.id.clone();
                self.registry.update_heartbeat(node).await;
                ControlResponse::Commands(self.outbox.drain(&node_id).await)
            }
            ControlRequest::Submit(request) => {
                metrics().requests_submit.fetch_add(1, Ordering::Relaxed);
                self.handle_submit(request).await
            }
            ControlRequest::Status(id) => {
                metrics().requests_status.fetch_add(1, Ordering::Relaxed);
                ControlResponse::Status(self.registry.get_run(&id).await)
            }
            ControlRequest::Cancel(id) => {
                metrics().requests_cancel.fetch_add(1, Ordering::Relaxed);
                self.handle_cancel(id).await
            }
        };

        if matches!(response, ControlResponse::Error { .. }) {
            metrics().requests_failed.fetch_add(1, Ordering::Relaxed);
        }

        protocol::send_response(&mut send, &response).await?;
        send.finish().context("finishing control response stream")?;
        Ok(())
    }

    async fn handle_submit(&self, request: sandkeep_core::SandboxRequest) -> ControlResponse {
        use std::sync::atomic::Ordering;

        let sandbox_id = request.id.clone();
        let template_id = request.template_id.clone();
        metrics().schedule_attempts.fetch_add(1, Ordering::Relaxed);
        match self.scheduler.schedule(request, SUBMIT_MAX_ATTEMPTS).await {
            Ok(node_id) => {
                let mut run = SandboxRun::pending(sandbox_id.clone(), template_id, chrono::Utc::now());
                run.node_id = Some(node_id.clone());
                let _ = run.transition(RunStatus::Scheduled, chrono::Utc::now());
                self.registry.upsert_run(run).await;
                metrics().runs_scheduled.fetch_add(1, Ordering::Relaxed);
                ControlResponse::Submitted { sandbox_id, node_id }
            }
            Err(err) => {
                metrics().schedule_failures.fetch_add(1, Ordering::Relaxed);
                ControlResponse::Error { message: err.to_string() }
            }
        }
    }

    /// Cancel before a node has leased the run transitions it directly;
    /// once a node owns it, cancellation is delivered as a queued
    /// command on that node's next heartbeat instead.
    async fn handle_cancel(&self, id: sandkeep_core::SandboxId) -> ControlResponse {
        let Some(mut run) = self.registry.get_run(&id).await else {
            return ControlResponse::Error { message: format!("no such run: {id}") };
        };

        match run.node_id.clone() {
            Some(node_id) => {
                self.outbox.push(node_id, ControlCommand::Cancel { sandbox_id: id }).await;
                ControlResponse::Canceled
            }
            None => match run.transition(RunStatus::Canceled, chrono::Utc::now()) {
                Ok(()) => {
                    self.registry.upsert_run(run).await;
                    metrics().runs_canceled.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    ControlResponse::Canceled
                }
                Err(err) => ControlResponse::Error { message: err.to_string() },
            },
        }
    }
}
