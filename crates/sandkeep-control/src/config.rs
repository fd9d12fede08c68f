use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Control-plane configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    pub control: ControlGlobal,
    #[serde(default)]
    pub etcd: Option<EtcdEntry>,
}

/// Global control-plane settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlGlobal {
    /// QUIC listen address for node-agent heartbeats.
    pub listen: SocketAddr,
    /// Expected node-agent heartbeat cadence, used to derive node
    /// freshness staleness for the Scheduler.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Visibility timeout granted to a dispatch lease before it is
    /// returned to the visible queue.
    #[serde(default = "default_lease_visibility")]
    pub lease_visibility_secs: u64,
    /// Scheduling attempts before giving up on a request.
    #[serde(default = "default_schedule_attempts")]
    pub max_schedule_attempts: u32,
}

/// Remote registry backend; absent means the in-memory registry.
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdEntry {
    pub endpoints: Vec<String>,
}

fn default_heartbeat_interval() -> u64 {
    5
}
fn default_lease_visibility() -> u64 {
    30
}
fn default_schedule_attempts() -> u32 {
    5
}

impl ControlConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read control config: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("failed to parse control config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.control.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than zero");
        }
        if let Some(etcd) = &self.etcd {
            if etcd.endpoints.is_empty() {
                anyhow::bail!("[etcd] section must list at least one endpoint");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let toml = r#"
[control]
listen = "0.0.0.0:4433"
"#;
        let config = ControlConfig::parse(toml).unwrap();
        assert_eq!(config.control.heartbeat_interval_secs, 5);
        assert_eq!(config.control.lease_visibility_secs, 30);
        assert_eq!(config.control.max_schedule_attempts, 5);
        assert!(config.etcd.is_none());
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
[control]
listen = "0.0.0.0:4433"
heartbeat_interval_secs = 10
lease_visibility_secs = 60
max_schedule_attempts = 3

[etcd]
endpoints = ["http://127.0.0.1:2379"]
"#;
        let config = ControlConfig::parse(toml).unwrap();
        assert_eq!(config.control.heartbeat_interval_secs, 10);
        assert_eq!(config.etcd.unwrap().endpoints, vec!["http://127.0.0.1:2379"]);
    }

    #[test]
    fn rejects_zero_heartbeat_interval() {
        let toml = r#"
[control]
listen = "0.0.0.0:4433"
heartbeat_interval_secs = 0
"#;
        assert!(ControlConfig::parse(toml).is_err());
    }

    #[test]
    fn rejects_empty_etcd_endpoints() {
        let toml = r#"
[control]
listen = "0.0.0.0:4433"

[etcd]
endpoints = []
"#;
        assert!(ControlConfig::parse(toml).is_err());
    }
}
