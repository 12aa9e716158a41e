// src/node/handlers.rs

//! Default in-process implementations of the injected boundaries, used when
//! the embedder supplies nothing richer: a router-backed failover action
//! handler, an immediately-acking replication transport, and a logging sync
//! handler.

use crate::core::coordinator::{CrossMasterSyncHandler, CrossMasterSyncRequest};
use crate::core::failover::{FailoverActionHandler, NodeHealth};
use crate::core::replication::{
    ReplicationBatch, ReplicationTarget, ReplicationTransport,
};
use crate::core::router::LoadBalancer;
use crate::core::topology::TopologyManager;
use crate::core::{NodeId, PeridotError, now_ms};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Acts on failovers by steering the router and topology: isolation drains
/// the node's backend, redirection moves its traffic, restoration re-enables
/// it. Leadership changes are recorded in the topology.
pub struct RouterActionHandler {
    router: Arc<LoadBalancer>,
    topology: Arc<TopologyManager>,
}

impl RouterActionHandler {
    pub fn new(router: Arc<LoadBalancer>, topology: Arc<TopologyManager>) -> Arc<Self> {
        Arc::new(Self { router, topology })
    }
}

#[async_trait]
impl FailoverActionHandler for RouterActionHandler {
    async fn promote_to_leader(&self, node: &NodeId) -> Result<(), PeridotError> {
        info!("Promoting {} to leader", node);
        self.topology.set_node_active(node, true);
        Ok(())
    }

    async fn demote_from_leader(&self, node: &NodeId) -> Result<(), PeridotError> {
        info!("Demoting {} from leader", node);
        Ok(())
    }

    async fn redirect_traffic(&self, from: &NodeId, to: &NodeId) -> Result<(), PeridotError> {
        info!("Redirecting traffic from {} to {}", from, to);
        self.router.deregister_backend(from);
        Ok(())
    }

    async fn isolate_failed_node(&self, node: &NodeId) -> Result<(), PeridotError> {
        info!("Isolating failed node {}", node);
        if self.router.get_backend(node).is_some() {
            self.router.drain_backend(node)?;
        }
        self.topology.set_node_active(node, false);
        Ok(())
    }

    async fn restore_node_to_cluster(&self, node: &NodeId) -> Result<(), PeridotError> {
        info!("Restoring {} to the cluster", node);
        self.topology.set_node_active(node, true);
        Ok(())
    }

    async fn get_node_health(&self, node: &NodeId) -> Result<NodeHealth, PeridotError> {
        let Some(topology_node) = self.topology.get_node(node) else {
            return Err(PeridotError::NodeNotFound(node.clone()));
        };
        let mut health = NodeHealth::unresponsive(node.clone());
        health.responsive = topology_node.active;
        health.available = topology_node.active;
        health.last_heartbeat_ms = topology_node.last_seen_ms;
        Ok(health)
    }
}

/// A replication transport that acknowledges in-process. Standalone nodes
/// with no replica fleet use it; tests use it to observe delivery.
#[derive(Debug, Default)]
pub struct LoopbackReplicationTransport {
    applied: DashMap<NodeId, u64>,
}

impl LoopbackReplicationTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied_index(&self, target: &NodeId) -> u64 {
        self.applied.get(target).map(|entry| *entry.value()).unwrap_or(0)
    }
}

#[async_trait]
impl ReplicationTransport for LoopbackReplicationTransport {
    async fn send_batch(
        &self,
        target: &ReplicationTarget,
        batch: &ReplicationBatch,
    ) -> Result<u64, PeridotError> {
        for entry in &batch.entries {
            if !entry.verify_checksum() {
                return Err(PeridotError::InvalidRequest(format!(
                    "checksum mismatch at index {}",
                    entry.index
                )));
            }
        }
        self.applied
            .insert(target.node_id.clone(), batch.end_index);
        Ok(batch.end_index)
    }

    async fn send_heartbeat(
        &self,
        target: &ReplicationTarget,
        _current_index: u64,
    ) -> Result<u64, PeridotError> {
        Ok(self.applied_index(&target.node_id))
    }

    async fn request_sync(
        &self,
        target: &ReplicationTarget,
        from_index: u64,
    ) -> Result<(), PeridotError> {
        info!(
            "Sync requested for {} from index {} ({})",
            target.node_id, from_index, now_ms()
        );
        Ok(())
    }
}

/// Logs cross-master sync work; real deployments install ledger- and
/// config-aware handlers.
#[derive(Debug, Default)]
pub struct LoggingSyncHandler;

impl LoggingSyncHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl CrossMasterSyncHandler for LoggingSyncHandler {
    async fn execute(&self, request: &CrossMasterSyncRequest) -> Result<(), PeridotError> {
        info!(
            "Executing {} sync {} toward {}",
            request.kind, request.id, request.target
        );
        Ok(())
    }
}
