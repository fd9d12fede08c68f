//! Runtime-crate configuration: unlike the control plane's
//! TOML file, these values are read directly from the environment,
//! covering the hypervisor and network settings a node's runtime
//! process needs at startup.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};

const DEFAULT_NETWORK_CIDR: &str = "10.200.0.0/16";
const DEFAULT_SNAPSHOT_PATH: &str = "/var/lib/sandkeep/snapshots";
const DEFAULT_SOCKET_DIR: &str = "/run/sandkeep";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub fc_kernel_image: PathBuf,
    pub fc_rootfs_base: PathBuf,
    pub fc_socket_dir: PathBuf,
    pub network_base: Ipv4Addr,
    pub network_prefix: u8,
    pub snapshot_staging_path: PathBuf,
}

impl RuntimeConfig {
    /// Load from the environment, applying documented defaults for
    /// anything unset. `FC_KERNEL_IMAGE` and
    /// `FC_ROOTFS_BASE` have no sensible default and must be set.
    pub fn from_env() -> Result<Self> {
        let fc_kernel_image = required_path("FC_KERNEL_IMAGE")?;
        let fc_rootfs_base = required_path("FC_ROOTFS_BASE")?;
        let fc_socket_dir = optional_path("FC_SOCKET_DIR", DEFAULT_SOCKET_DIR);
        let snapshot_staging_path = optional_path("SNAPSHOT_PATH", DEFAULT_SNAPSHOT_PATH);

        let cidr = std::env::var("NETWORK_CIDR").unwrap_or_else(|_| DEFAULT_NETWORK_CIDR.to_string());
        let (network_base, network_prefix) = parse_cidr(&cidr)
            .with_context(|| format!("NETWORK_CIDR is not a valid CIDR: {cidr}"))?;

        Ok(Self {
            fc_kernel_image,
            fc_rootfs_base,
            fc_socket_dir,
            network_base,
            network_prefix,
            snapshot_staging_path,
        })
    }
}

fn required_path(var: &str) -> Result<PathBuf> {
    std::env::var(var)
        .map(PathBuf::from)
        .with_context(|| format!("{var} must be set"))
}

fn optional_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/').context("expected <ip>/<prefix>")?;
    let addr: Ipv4Addr = addr.parse().context("invalid IPv4 address")?;
    let prefix: u8 = prefix.parse().context("invalid prefix length")?;
    if prefix > 32 {
        anyhow::bail!("prefix length must be <= 32");
    }
    Ok((addr, prefix))
}
