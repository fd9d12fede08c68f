use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandkeep_core::{NodeId, SandboxRequest};
use tokio::sync::Mutex;

/// A handle identifying one outstanding lease on a leased request, used
/// by the consumer to `ack`/`nack` it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseId(String);

impl LeaseId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

struct LeaseState {
    request: SandboxRequest,
    node_id: NodeId,
    consumer_id: String,
    expires_at: Instant,
}

/// Per-node FIFO dispatch with at-least-once delivery: a
/// leased request is invisible to other consumers until `ack`, `nack`,
/// or its visibility timeout elapses, at which point it is returned to
/// the visible queue. Consumers must be idempotent keyed on
/// `request.id` since a crash between `lease` and `ack` redelivers.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, node_id: NodeId, request: SandboxRequest);

    /// Lease the head of `node_id`'s visible queue for `visibility_timeout`,
    /// or `None` if nothing is visible.
    async fn lease(
        &self,
        node_id: &NodeId,
        consumer_id: &str,
        visibility_timeout: Duration,
    ) -> Option<(LeaseId, SandboxRequest)>;

    /// Acknowledge successful processing; the request is removed for good.
    async fn ack(&self, lease_id: &LeaseId);

    /// Return the request to the visible queue immediately, for a
    /// consumer that knows it failed rather than waiting out the lease.
    async fn nack(&self, lease_id: &LeaseId);
}

#[derive(Default)]
struct State {
    visible: HashMap<NodeId, VecDeque<SandboxRequest>>,
    leased: HashMap<LeaseId, LeaseState>,
}

impl State {
    /// Move any lease whose visibility timeout has elapsed back onto its
    /// node's visible queue. Called on every operation instead of a
    /// background sweep task, since the queue has no way to wake a sweep
    /// loop early when a fresh lease would make it redundant anyway.
    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                self.visible.entry(lease.node_id).or_default().push_back(lease.request);
            }
        }
    }
}

/// A single-process dispatch queue backed by an in-memory `VecDeque` per
/// node. Sufficient for a development cluster or tests; a multi-replica
/// control plane needs a shared backend, which the corpus has no
/// grounded precedent for (no example repo depends on a message-queue
/// crate), so only this implementation ships.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchQueue for InMemoryQueue {
    async fn enqueue(&self, node_id: NodeId, request: SandboxRequest) {
        self.state.lock().await.visible.entry(node_id).or_default().push_back(request);
    }

    async fn lease(
        &self,
        node_id: &NodeId,
        consumer_id: &str,
        visibility_timeout: Duration,
    ) -> Option<(LeaseId, SandboxRequest)> {
        let mut state = self.state.lock().await;
        state.reap_expired(Instant::now());

        let request = state.visible.get_mut(node_id)?.pop_front()?;
        let lease_id = LeaseId::new();
        state.leased.insert(
            lease_id.clone(),
            LeaseState {
                request: request.clone(),
                node_id: node_id.clone(),
                consumer_id: consumer_id.to_string(),
                expires_at: Instant::now() + visibility_timeout,
            },
        );
        Some((lease_id, request))
    }

    async fn ack(&self, lease_id: &LeaseId) {
        self.state.lock().await.leased.remove(lease_id);
    }

    async fn nack(&self, lease_id: &LeaseId) {
        let mut state = self.state.lock().await;
        if let Some(lease) = state.leased.remove(lease_id) {
            state.visible.entry(lease.node_id).or_default().push_back(lease.request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::{HeatLevel, ResourceSpec, SandboxId, TemplateId, TenantId};
    use std::collections::BTreeMap;

    fn sample_request() -> SandboxRequest {
        SandboxRequest {
            id: SandboxId::new(),
            template_id: TemplateId::from("tpl-demo"),
            tenant_id: TenantId::from("tnt-acme"),
            command: "true".into(),
            args: vec![],
            env: BTreeMap::new(),
            resources: ResourceSpec::ZERO,
            network_ref: "no-net".into(),
            heat_level: HeatLevel::Warm,
            retention: Default::default(),
            metadata: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn lease_then_ack_removes_the_request() {
        let queue = InMemoryQueue::new();
        let node = NodeId::from("node-1");
        queue.enqueue(node.clone(), sample_request()).await;

        let (lease_id, _) = queue.lease(&node, "consumer-1", Duration::from_secs(30)).await.unwrap();
        assert!(queue.lease(&node, "consumer-2", Duration::from_secs(30)).await.is_none());

        queue.ack(&lease_id).await;
        assert!(queue.lease(&node, "consumer-2", Duration::from_secs(30)).await.is_none());
    }

    #[tokio::test]
    async fn nack_makes_the_request_visible_again() {
        let queue = InMemoryQueue::new();
        let node = NodeId::from("node-1");
        queue.enqueue(node.clone(), sample_request()).await;

        let (lease_id, _) = queue.lease(&node, "consumer-1", Duration::from_secs(30)).await.unwrap();
        queue.nack(&lease_id).await;

        assert!(queue.lease(&node, "consumer-2", Duration::from_secs(30)).await.is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let queue = InMemoryQueue::new();
        let node = NodeId::from("node-1");
        queue.enqueue(node.clone(), sample_request()).await;

        queue.lease(&node, "consumer-1", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(queue.lease(&node, "consumer-2", Duration::from_secs(30)).await.is_some());
    }

    #[tokio::test]
    async fn queues_are_independent_per_node() {
        let queue = InMemoryQueue::new();
        queue.enqueue(NodeId::from("node-1"), sample_request()).await;

        assert!(queue
            .lease(&NodeId::from("node-2"), "consumer-1", Duration::from_secs(30))
            .await
            .is_none());
    }
}
