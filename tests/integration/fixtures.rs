//! In-memory wiring used by the integration tests: a cluster transport that
//! dispatches consensus messages between engines, and a gossip sink that
//! routes datagrams between services, both with fault injection.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use peridot::config::{ConsensusConfig, GossipConfig};
use peridot::core::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ClusterTransport, ConsensusEngine, RequestVote,
    VoteResponse,
};
use peridot::core::gossip::{GossipService, GossipSink};
use peridot::core::{NodeId, PeridotError};
use std::sync::Arc;
use std::time::Duration;

/// Routes consensus messages directly between registered engines. Nodes in
/// the `down` set neither send nor receive.
#[derive(Default)]
pub struct InMemoryClusterNet {
    engines: DashMap<NodeId, Arc<ConsensusEngine>>,
    down: DashSet<NodeId>,
}

impl InMemoryClusterNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, engine: Arc<ConsensusEngine>) {
        self.engines.insert(engine.node_id().clone(), engine);
    }

    pub fn partition(&self, node: &NodeId) {
        self.down.insert(node.clone());
    }

    pub fn heal(&self, node: &NodeId) {
        self.down.remove(node);
    }

    fn deliverable(&self, from: &NodeId, to: &NodeId) -> Option<Arc<ConsensusEngine>> {
        if self.down.contains(from) || self.down.contains(to) {
            return None;
        }
        self.engines.get(to).map(|entry| entry.clone())
    }
}

#[async_trait]
impl ClusterTransport for InMemoryClusterNet {
    async fn send_request_vote(
        &self,
        to: &NodeId,
        request: RequestVote,
    ) -> Result<(), PeridotError> {
        if let Some(engine) = self.deliverable(&request.candidate_id, to) {
            tokio::spawn(async move { engine.handle_request_vote(request).await });
        }
        Ok(())
    }

    async fn send_vote_response(
        &self,
        to: &NodeId,
        response: VoteResponse,
    ) -> Result<(), PeridotError> {
        if let Some(engine) = self.deliverable(&response.voter_id, to) {
            tokio::spawn(async move { engine.handle_vote_response(response).await });
        }
        Ok(())
    }

    async fn send_append_entries(
        &self,
        to: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<(), PeridotError> {
        if let Some(engine) = self.deliverable(&request.leader_id, to) {
            tokio::spawn(async move { engine.handle_append_entries(request).await });
        }
        Ok(())
    }

    async fn send_append_entries_response(
        &self,
        to: &NodeId,
        response: AppendEntriesResponse,
    ) -> Result<(), PeridotError> {
        if let Some(engine) = self.deliverable(&response.peer_id, to) {
            tokio::spawn(async move { engine.handle_append_entries_response(response).await });
        }
        Ok(())
    }
}

/// Election and heartbeat timing tightened for tests.
pub fn fast_consensus_config() -> ConsensusConfig {
    ConsensusConfig {
        election_timeout_min: Duration::from_millis(50),
        election_timeout_max: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(20),
        proposal_timeout: Duration::from_millis(500),
        max_proposal_retries: 3,
    }
}

/// Routes gossip datagrams between services registered under their advertised
/// addresses.
#[derive(Default)]
pub struct InMemoryGossipNet {
    services: DashMap<String, Arc<GossipService>>,
}

impl InMemoryGossipNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: impl Into<String>, service: Arc<GossipService>) {
        self.services.insert(addr.into(), service);
    }
}

#[async_trait]
impl GossipSink for InMemoryGossipNet {
    async fn send_to(&self, addr: &str, frame: Vec<u8>) -> Result<(), PeridotError> {
        let Some(service) = self.services.get(addr).map(|entry| entry.clone()) else {
            return Err(PeridotError::TargetUnreachable(addr.to_string()));
        };
        tokio::spawn(async move { service.handle_frame(&frame).await });
        Ok(())
    }
}

/// Gossip timing tightened for tests.
pub fn fast_gossip_config(entrypoints: Vec<String>) -> GossipConfig {
    GossipConfig {
        push_interval: Duration::from_millis(20),
        pull_interval: Duration::from_millis(100),
        trim_interval: Duration::from_millis(500),
        ping_interval: Duration::from_millis(200),
        rotation_interval: Duration::from_millis(200),
        entrypoints,
        ..Default::default()
    }
}

/// Polls `probe` every 25 ms until it returns true or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
