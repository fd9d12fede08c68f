use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use sandkeep_core::{NodeId, NodeInfo, SandboxId, SandboxRun};
use tokio::sync::RwLock;

/// The heartbeat map and run map: `update_heartbeat` is the
/// only write a node agent makes to its own entry, and `upsert_run` is
/// the only write either side makes to a sandbox's execution record —
/// the control plane itself only ever writes `Pending` or `Canceled`
/// runs, everything else is written by the owning node.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn update_heartbeat(&self, node: NodeInfo);

    /// Nodes whose last heartbeat is within `staleness` of now.
    async fn list_fresh_nodes(&self, now: chrono::DateTime<chrono::Utc>, staleness: Duration) -> Vec<NodeInfo>;

    async fn get_node(&self, id: &NodeId) -> Option<NodeInfo>;

    async fn get_run(&self, id: &SandboxId) -> Option<SandboxRun>;

    async fn upsert_run(&self, run: SandboxRun);
}

#[derive(Default)]
struct State {
    nodes: HashMap<NodeId, NodeInfo>,
    runs: HashMap<SandboxId, SandboxRun>,
}

/// A single-process registry. Sufficient for a development cluster or
/// tests; production deployments use [`EtcdRegistry`] so state survives
/// a control-plane restart.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: RwLock<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn update_heartbeat(&self, node: NodeInfo) {
        self.state.write().await.nodes.insert(node.id.clone(), node);
    }

    async fn list_fresh_nodes(&self, now: chrono::DateTime<chrono::Utc>, staleness: Duration) -> Vec<NodeInfo> {
        self.state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.is_fresh(now, staleness))
            .cloned()
            .collect()
    }

    async fn get_node(&self, id: &NodeId) -> Option<NodeInfo> {
        self.state.read().await.nodes.get(id).cloned()
    }

    async fn get_run(&self, id: &SandboxId) -> Option<SandboxRun> {
        self.state.read().await.runs.get(id).cloned()
    }

    async fn upsert_run(&self, run: SandboxRun) {
        self.state.write().await.runs.insert(run.id.clone(), run);
    }
}

/// `etcd`-backed registry: node entries live under `nodes/<node_id>`,
/// run entries under `runs/<sandbox_id>`, a flat namespacing scheme that
/// lets a remote KV store be shared across multiple control-plane
/// replicas.
pub struct EtcdRegistry {
    client: Arc<RwLock<etcd_client::Client>>,
}

impl EtcdRegistry {
    pub async fn connect(endpoints: &[String]) -> anyhow::Result<Self> {
        let client = etcd_client::Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }

    fn node_key(id: &NodeId) -> String {
        format!("nodes/{id}")
    }

    fn run_key(id: &SandboxId) -> String {
        format!("runs/{id}")
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn update_heartbeat(&self, node: NodeInfo) {
        let Ok(value) = serde_json::to_vec(&node) else {
            return;
        };
        let key = Self::node_key(&node.id);
        let _ = self.client.write().await.put(key, value, None).await;
    }

    async fn list_fresh_nodes(&self, now: chrono::DateTime<chrono::Utc>, staleness: Duration) -> Vec<NodeInfo> {
        let Ok(resp) = self
            .client
            .write()
            .await
            .get("nodes/", Some(etcd_client::GetOptions::new().with_prefix()))
            .await
        else {
            return Vec::new();
        };
        resp.kvs()
            .iter()
            .filter_map(|kv| serde_json::from_slice::<NodeInfo>(kv.value()).ok())
            .filter(|n| n.is_fresh(now, staleness))
            .collect()
    }

    async fn get_node(&self, id: &NodeId) -> Option<NodeInfo> {
        let resp = self.client.write().await.get(Self::node_key(id), None).await.ok()?;
        resp.kvs().first().and_then(|kv| serde_json::from_slice(kv.value()).ok())
    }

    async fn get_run(&self, id: &SandboxId) -> Option<SandboxRun> {
        let resp = self.client.write().await.get(Self::run_key(id), None).await.ok()?;
        resp.kvs().first().and_then(|kv| serde_json::from_slice(kv.value()).ok())
    }

    async fn upsert_run(&self, run: SandboxRun) {
        let Ok(value) = serde_json::to_vec(&run) else {
            return;
        };
        let key = Self::run_key(&run.id);
        let _ = self.client.write().await.put(key, value, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::{ResourceSpec, TemplateId};
    use std::collections::BTreeMap;

    fn node(id: &str) -> NodeInfo {
        NodeInfo {
            id: NodeId::from(id),
            address: "10.0.0.1:4433".into(),
            labels: BTreeMap::new(),
            capacity: ResourceSpec::ZERO,
            allocated: ResourceSpec::ZERO,
            last_heartbeat: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn heartbeat_and_lookup_roundtrip() {
        let registry = InMemoryRegistry::new();
        registry.update_heartbeat(node("node-1")).await;
        assert!(registry.get_node(&NodeId::from("node-1")).await.is_some());
    }

    #[tokio::test]
    async fn stale_nodes_are_excluded_from_fresh_list() {
        let registry = InMemoryRegistry::new();
        let mut stale = node("node-1");
        stale.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(100);
        registry.update_heartbeat(stale).await;
        registry.update_heartbeat(node("node-2")).await;

        let fresh = registry
            .list_fresh_nodes(chrono::Utc::now(), chrono::Duration::seconds(10))
            .await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id.as_str(), "node-2");
    }

    #[tokio::test]
    async fn run_upsert_and_get_roundtrip() {
        let registry = InMemoryRegistry::new();
        let run = SandboxRun::pending(SandboxId::new(), TemplateId::from("tpl"), chrono::Utc::now());
        let id = run.id.clone();
        registry.upsert_run(run).await;
        assert!(registry.get_run(&id).await.is_some());
    }
}
