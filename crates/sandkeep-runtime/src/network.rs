//! Network Gateway: a TAP device per sandbox, attached to a
//! single process-wide bridge, with egress iptables rules derived from
//! a [`NetworkContract`]. Grounded on `vm/bridge.rs`'s idempotent
//! bridge/NAT-rule setup, but this gateway runs on the node host
//! itself rather than shelling into a guest VM, so it drives `ip`/
//! `iptables` directly via `tokio::process::Command`.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use sandkeep_core::{NetworkContract, SandboxId};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IP pool exhausted")]
    PoolExhausted,
    #[error("sandbox {0} has no attachment")]
    NotAttached(SandboxId),
    #[error("command {0} failed: {1}")]
    CommandFailed(String, String),
    #[error("command {0} could not be run: {1}")]
    ToolMissing(String, String),
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub tap_name: String,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet_prefix: u8,
}

/// A process-wide bridge plus the per-sandbox TAP/iptables attachments
/// created on top of it. IP allocation is a simple in-memory pool;
/// addresses return to the pool on `detach`.
pub struct NetworkGateway {
    bridge_name: String,
    gateway: Ipv4Addr,
    subnet_prefix: u8,
    pool: Mutex<VecDeque<Ipv4Addr>>,
    attachments: Mutex<HashMap<SandboxId, Attachment>>,
}

impl NetworkGateway {
    /// `cidr` is e.g. `10.200.0.0/16`, the default `NETWORK_CIDR`.
    /// The first address in the range is reserved as the bridge's own
    /// gateway IP; the rest populate the allocation pool.
    pub fn new(bridge_name: impl Into<String>, cidr_base: Ipv4Addr, prefix: u8, pool_size: u32) -> Self {
        let base = u32::from(cidr_base);
        let gateway = Ipv4Addr::from(base + 1);
        let mut pool = VecDeque::new();
        for offset in 2..(2 + pool_size) {
            pool.push_back(Ipv4Addr::from(base + offset));
        }

        Self {
            bridge_name: bridge_name.into(),
            gateway,
            subnet_prefix: prefix,
            pool: Mutex::new(pool),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotently ensure the process-wide bridge exists and is up.
    pub async fn ensure_bridge(&self) -> Result<(), NetworkError> {
        if self.bridge_exists().await? {
            return Ok(());
        }

        run("ip", &["link", "add", &self.bridge_name, "type", "bridge"]).await?;
        run(
            "ip",
            &[
                "addr",
                "add",
                &format!("{}/{}", self.gateway, self.subnet_prefix),
                "dev",
                &self.bridge_name,
            ],
        )
        .await?;
        run("ip", &["link", "set", &self.bridge_name, "up"]).await?;
        Ok(())
    }

    pub async fn destroy_bridge(&self) -> Result<(), NetworkError> {
        let _ = run("ip", &["link", "set", &self.bridge_name, "down"]).await;
        let _ = run("ip", &["link", "del", &self.bridge_name]).await;
        Ok(())
    }

    async fn bridge_exists(&self) -> Result<bool, NetworkError> {
        match Command::new("ip").args(["link", "show", &self.bridge_name]).output().await {
            Ok(output) => Ok(output.status.success()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NetworkError::ToolMissing("ip".into(), e.to_string()))
            }
            Err(e) => Err(NetworkError::CommandFailed("ip link show".into(), e.to_string())),
        }
    }

    /// Attach a TAP device for `sandbox_id`, add it to the bridge, and
    /// install the contract's egress rules. Fails with `PoolExhausted`
    /// if no IP remains.
    pub async fn attach(&self, sandbox_id: &SandboxId, contract: &NetworkContract) -> Result<Attachment, NetworkError> {
        let ip = self
            .pool
            .lock()
            .expect("ip pool poisoned")
            .pop_front()
            .ok_or(NetworkError::PoolExhausted)?;

        let tap_name = format!("tap-{}", &sandbox_id.as_str()[sandbox_id.as_str().len().saturating_sub(10)..]);

        if let Err(e) = self.create_tap(&tap_name).await {
            self.pool.lock().expect("ip pool poisoned").push_back(ip);
            return Err(e);
        }

        if let Err(e) = self.install_rules(&tap_name, &ip, contract).await {
            let _ = self.destroy_tap(&tap_name).await;
            self.pool.lock().expect("ip pool poisoned").push_back(ip);
            return Err(e);
        }

        let attachment = Attachment {
            tap_name,
            ip,
            gateway: self.gateway,
            subnet_prefix: self.subnet_prefix,
        };
        self.attachments.lock().expect("attachment map poisoned").insert(sandbox_id.clone(), attachment.clone());
        Ok(attachment)
    }

    /// Remove the TAP device, tear down its rules, and return the IP to
    /// the pool.
    pub async fn detach(&self, sandbox_id: &SandboxId) -> Result<(), NetworkError> {
        let attachment = self
            .attachments
            .lock()
            .expect("attachment map poisoned")
            .remove(sandbox_id)
            .ok_or_else(|| NetworkError::NotAttached(sandbox_id.clone()))?;

        let _ = run("iptables", &["-F", &chain_name(&attachment.tap_name)]).await;
        let _ = run("iptables", &["-X", &chain_name(&attachment.tap_name)]).await;
        self.destroy_tap(&attachment.tap_name).await?;

        self.pool.lock().expect("ip pool poisoned").push_back(attachment.ip);
        Ok(())
    }

    async fn create_tap(&self, tap_name: &str) -> Result<(), NetworkError> {
        run("ip", &["tuntap", "add", "dev", tap_name, "mode", "tap"]).await?;
        run("ip", &["link", "set", tap_name, "master", &self.bridge_name]).await?;
        run("ip", &["link", "set", tap_name, "up"]).await?;
        Ok(())
    }

    async fn destroy_tap(&self, tap_name: &str) -> Result<(), NetworkError> {
        match run("ip", &["link", "del", tap_name]).await {
            Ok(()) => Ok(()),
            Err(NetworkError::CommandFailed(_, _)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Install the contract's rules atomically into a per-sandbox
    /// iptables chain: default-deny RFC1918 ranges when
    /// `deny_private`, always deny the link-local metadata address when
    /// `deny_metadata`, then explicit allows for `allowed_cidrs`.
    async fn install_rules(&self, tap_name: &str, _ip: &Ipv4Addr, contract: &NetworkContract) -> Result<(), NetworkError> {
        let chain = chain_name(tap_name);
        run("iptables", &["-N", &chain]).await?;
        run("iptables", &["-I", "FORWARD", "-i", tap_name, "-j", &chain]).await?;

        if contract.deny_metadata {
            run("iptables", &["-A", &chain, "-d", "169.254.169.254/32", "-j", "DROP"]).await?;
        }

        for cidr in &contract.allowed_cidrs {
            run("iptables", &["-A", &chain, "-d", cidr, "-j", "ACCEPT"]).await?;
        }

        if contract.deny_private {
            for range in ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"] {
                run("iptables", &["-A", &chain, "-d", range, "-j", "DROP"]).await?;
            }
        }

        run("iptables", &["-A", &chain, "-j", "ACCEPT"]).await?;
        Ok(())
    }
}

fn chain_name(tap_name: &str) -> String {
    format!("sandkeep-{tap_name}")
}

async fn run(program: &str, args: &[&str]) -> Result<(), NetworkError> {
    debug!(program, ?args, "running network command");
    let output = Command::new(program).args(args).output().await;
    match output {
        Ok(o) if o.status.success() => Ok(()),
        Ok(o) => {
            let stderr = String::from_utf8_lossy(&o.stderr).into_owned();
            warn!(program, ?args, %stderr, "network command failed");
            Err(NetworkError::CommandFailed(program.to_string(), stderr))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(NetworkError::ToolMissing(program.to_string(), e.to_string()))
        }
        Err(e) => Err(NetworkError::CommandFailed(program.to_string(), e.to_string())),
    }
}
