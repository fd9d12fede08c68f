use std::sync::Arc;
use std::time::Duration;

use sandkeep_core::retry::{retry_async, scheduler_backoff};
use sandkeep_core::{NodeId, SandboxRequest};

use crate::queue::DispatchQueue;
use crate::registry::Registry;

/// Staleness multiplier applied to the heartbeat interval: a
/// node is only schedulable while its last heartbeat is within 3x the
/// expected interval.
pub const STALENESS_MULTIPLIER: i64 = 3;

/// Picks the least-loaded node for an admitted request and enqueues it
/// there, retrying with bounded exponential backoff while nothing fits.
pub struct Scheduler {
    registry: Arc<dyn Registry>,
    queue: Arc<dyn DispatchQueue>,
    heartbeat_interval: Duration,
}

impl Scheduler {
    pub fn new(registry: Arc<dyn Registry>, queue: Arc<dyn DispatchQueue>, heartbeat_interval: Duration) -> Self {
        Self {
            registry,
            queue,
            heartbeat_interval,
        }
    }

    fn staleness(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_interval.as_millis() as i64 * STALENESS_MULTIPLIER)
    }

    /// Among fresh nodes that can fit `request`, pick the one with the
    /// smallest CPU load ratio, breaking ties deterministically on node
    /// id so repeated calls against identical state are reproducible.
    async fn pick_node(&self, request: &SandboxRequest) -> Option<NodeId> {
        let now = chrono::Utc::now();
        let mut candidates: Vec<_> = self
            .registry
            .list_fresh_nodes(now, self.staleness())
            .await
            .into_iter()
            .filter(|n| n.can_fit(&request.resources))
            .collect();

        candidates.sort_by(|a, b| {
            a.cpu_load_ratio()
                .partial_cmp(&b.cpu_load_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates.into_iter().next().map(|n| n.id)
    }

    /// Schedule `request`, retrying on the bounded backoff schedule until
    /// a node fits or `max_attempts` is exhausted.
    pub async fn schedule(&self, request: SandboxRequest, max_attempts: u32) -> anyhow::Result<NodeId> {
        let request = Arc::new(request);
        let mut attempt = 0u32;

        retry_async(
            max_attempts,
            scheduler_backoff(0),
            Duration::from_secs(30),
            "schedule",
            || {
                let request = request.clone();
                attempt += 1;
                async move {
                    match self.pick_node(&request).await {
                        Some(node_id) => {
                            self.queue.enqueue(node_id.clone(), (*request).clone()).await;
                            Ok(node_id)
                        }
                        None => anyhow::bail!("no node fits request {}", request.id),
                    }
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::registry::InMemoryRegistry;
    use sandkeep_core::{HeatLevel, NodeInfo, ResourceSpec, SandboxId, TemplateId, TenantId};
    use std::collections::BTreeMap;

    fn node(id: &str, cpu_cap: u32, cpu_alloc: u32) -> NodeInfo {
        NodeInfo {
            id: NodeId::from(id),
            address: "10.0.0.1:4433".into(),
            labels: BTreeMap::new(),
            capacity: ResourceSpec {
                cpu_millicpu: cpu_cap,
                mem_mb: 8192,
                gpu: 0,
            },
            allocated: ResourceSpec {
                cpu_millicpu: cpu_alloc,
                mem_mb: 0,
                gpu: 0,
            },
            last_heartbeat: chrono::Utc::now(),
        }
    }

    fn request(cpu: u32) -> SandboxRequest {
        SandboxRequest {
            id: SandboxId::new(),
            template_id: TemplateId::from("tpl-demo"),
            tenant_id: TenantId::from("tnt-acme"),
            command: "true".into(),
            args: vec![],
            env: BTreeMap::new(),
            resources: ResourceSpec {
                cpu_millicpu: cpu,
                mem_mb: 256,
                gpu: 0,
            },
            network_ref: "no-net".into(),
            heat_level: HeatLevel::Warm,
            retention: Default::default(),
            metadata: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn picks_the_least_loaded_node_that_fits() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.update_heartbeat(node("node-a", 4000, 3000)).await;
        registry.update_heartbeat(node("node-b", 4000, 1000)).await;
        let queue = Arc::new(InMemoryQueue::new());

        let scheduler = Scheduler::new(registry, queue.clone(), Duration::from_secs(5));
        let chosen = scheduler.schedule(request(500), 1).await.unwrap();

        assert_eq!(chosen.as_str(), "node-b");
        assert!(queue
            .lease(&NodeId::from("node-b"), "c1", Duration::from_secs(30))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn ignores_stale_nodes() {
        let registry = Arc::new(InMemoryRegistry::new());
        let mut stale = node("node-a", 4000, 0);
        stale.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(60);
        registry.update_heartbeat(stale).await;
        let queue = Arc::new(InMemoryQueue::new());

        let scheduler = Scheduler::new(registry, queue, Duration::from_secs(5));
        assert!(scheduler.schedule(request(500), 1).await.is_err());
    }

    #[tokio::test]
    async fn retries_until_a_node_fits() {
        let registry = Arc::new(InMemoryRegistry::new());
        let queue = Arc::new(InMemoryQueue::new());
        let scheduler = Scheduler::new(registry.clone(), queue, Duration::from_millis(50));

        let registry_for_task = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry_for_task.update_heartbeat(node("node-a", 4000, 0)).await;
        });

        let chosen = scheduler.schedule(request(500), 5).await.unwrap();
        assert_eq!(chosen.as_str(), "node-a");
    }
}
