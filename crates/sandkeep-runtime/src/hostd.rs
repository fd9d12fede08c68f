//! Privileged executor daemon: accepts one `AdapterRequest` per Unix
//! connection and serves it against a concrete [`Runtime`], the same
//! one-request-per-connection shape a privileged helper process uses
//! to keep hypervisor access out of the unprivileged adapter
//! ([`crate::firecracker::FirecrackerRuntime`]).

use std::path::Path;
use std::sync::Arc;

use sandkeep_core::protocol::{recv_request, send_response, AdapterRequest, AdapterResponse};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, instrument, warn};

use crate::runtime::{Runtime, VmConfig};

/// Listen on `socket_path`, serving requests against `runtime` until
/// ctrl-c. Removes a stale socket file left behind by a previous,
/// uncleanly-terminated run before binding.
pub async fn serve(socket_path: impl Into<String>, runtime: Arc<dyn Runtime>) -> anyhow::Result<()> {
    let socket_path = socket_path.into();
    if let Some(parent) = Path::new(&socket_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _ = tokio::fs::remove_file(&socket_path).await;

    let listener = UnixListener::bind(&socket_path)?;
    info!(%socket_path, "hostd listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, runtime).await {
                        warn!(error = %e, "hostd connection ended with an error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("hostd received shutdown signal");
                let _ = tokio::fs::remove_file(&socket_path).await;
                return Ok(());
            }
        }
    }
}

#[instrument(skip(stream, runtime))]
async fn handle_connection(mut stream: UnixStream, runtime: Arc<dyn Runtime>) -> anyhow::Result<()> {
    let request = recv_request(&mut stream).await?;
    let response = dispatch(&runtime, request).await;
    send_response(&mut stream, &response).await?;
    Ok(())
}

async fn dispatch(runtime: &Arc<dyn Runtime>, request: AdapterRequest) -> AdapterResponse {
    match request {
        AdapterRequest::Ping => AdapterResponse::Pong,
        AdapterRequest::Launch { sandbox_id, vm_config } => {
            let vm_config: VmConfig = match serde_json::from_value(vm_config) {
                Ok(c) => c,
                Err(e) => return AdapterResponse::Error { message: format!("invalid vm_config: {e}") },
            };
            let (_config, request) = match runtime.get_config(&sandbox_id).await {
                Ok(existing) => existing,
                Err(_) => (vm_config.clone(), placeholder_request(&sandbox_id)),
            };
            match runtime.launch(&request, vm_config).await {
                Ok(_) => AdapterResponse::Ok,
                Err(e) => AdapterResponse::Error { message: e.to_string() },
            }
        }
        AdapterRequest::Pause { sandbox_id } => respond(runtime.pause(&sandbox_id).await.map(|_| ())),
        AdapterRequest::Snapshot { sandbox_id, mem_key, disk_key } => {
            respond(runtime.create_snapshot(&sandbox_id, &mem_key, &disk_key).await.map(|_| ()))
        }
        AdapterRequest::Restore { sandbox_id, .. } => {
            warn!(%sandbox_id, "restore is not yet implemented by this hostd");
            AdapterResponse::Error { message: "restore not supported".into() }
        }
        AdapterRequest::Kill { sandbox_id, force } => {
            let result = if force { runtime.kill(&sandbox_id).await } else { runtime.shutdown(&sandbox_id).await };
            match (result, runtime.inspect(&sandbox_id).await) {
                (Ok(()), Ok(run)) => match run.exit_code {
                    Some(code) => AdapterResponse::Exited { exit_code: code },
                    None => AdapterResponse::Ok,
                },
                (Ok(()), Err(_)) => AdapterResponse::Ok,
                (Err(e), _) => AdapterResponse::Error { message: e.to_string() },
            }
        }
    }
}

fn respond(result: Result<(), crate::runtime::RuntimeError>) -> AdapterResponse {
    match result {
        Ok(()) => AdapterResponse::Ok,
        Err(e) => {
            error!(error = %e, "hostd operation failed");
            AdapterResponse::Error { message: e.to_string() }
        }
    }
}

/// Launching via the wire protocol only carries a `vm_config`, not the
/// full `SandboxRequest` the in-process `Runtime` trait expects for
/// bookkeeping (resource accounting, tenant id). A request arriving
/// through hostd for a sandbox id hostd has not already seen is only
/// possible in dev/test wiring, never in the node agent's real launch
/// path, which calls `Runtime::launch` in-process and only proxies the
/// privileged follow-up calls through hostd.
fn placeholder_request(sandbox_id: &sandkeep_core::SandboxId) -> sandkeep_core::SandboxRequest {
    sandkeep_core::SandboxRequest {
        id: sandbox_id.clone(),
        template_id: sandkeep_core::TemplateId::from("tpl-unknown"),
        tenant_id: sandkeep_core::TenantId::from("tnt-unknown"),
        command: String::new(),
        args: vec![],
        env: Default::default(),
        resources: sandkeep_core::ResourceSpec::ZERO,
        network_ref: sandkeep_core::NETWORK_NONE.into(),
        heat_level: Default::default(),
        retention: Default::default(),
        metadata: Default::default(),
        created_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use sandkeep_core::protocol::{send_request, recv_response};
    use sandkeep_core::SandboxId;

    #[tokio::test]
    async fn ping_round_trips_pong() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("hostd.sock");
        let runtime: Arc<dyn Runtime> = Arc::new(MockRuntime::new());

        let socket_path_str = socket_path.to_string_lossy().into_owned();
        let server = tokio::spawn(serve(socket_path_str.clone(), runtime));

        // Give the listener a moment to bind.
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        send_request(&mut stream, &AdapterRequest::Ping).await.unwrap();
        let response = recv_response(&mut stream).await.unwrap();
        assert!(matches!(response, AdapterResponse::Pong));

        server.abort();
    }

    #[tokio::test]
    async fn kill_on_unknown_sandbox_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("hostd.sock");
        let runtime: Arc<dyn Runtime> = Arc::new(MockRuntime::new());

        let socket_path_str = socket_path.to_string_lossy().into_owned();
        let server = tokio::spawn(serve(socket_path_str.clone(), runtime));
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        send_request(
            &mut stream,
            &AdapterRequest::Kill { sandbox_id: SandboxId::new(), force: true },
        )
        .await
        .unwrap();
        let response = recv_response(&mut stream).await.unwrap();
        assert!(matches!(response, AdapterResponse::Error { .. }));

        server.abort();
    }
}
