// src/core/topology/mod.rs

//! Cluster topology: node registry indexed by region and capability, named
//! partitions with primary/backup masters, the cross-region link graph, and
//! the service registry.

use crate::core::events::{ClusterEvent, EventBus};
use crate::core::{NodeId, PeridotError, now_ms};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Links scoring below this are taken out of service.
const LINK_RELIABILITY_FLOOR: f64 = 0.8;

/// One node in the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNode {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub region: String,
    pub capabilities: HashSet<String>,
    pub active: bool,
    pub last_seen_ms: u64,
}

impl TopologyNode {
    pub fn new(node_id: NodeId, address: String, port: u16, region: String) -> Self {
        Self {
            node_id,
            address,
            port,
            region,
            capabilities: HashSet::new(),
            active: true,
            last_seen_ms: now_ms(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

/// A named partition of nodes with a primary and backup masters. Healthy
/// while a strict majority of its members are active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub members: HashSet<NodeId>,
    pub primary: Option<NodeId>,
    pub backups: Vec<NodeId>,
    pub healthy: bool,
}

/// A directed cross-region link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionLink {
    pub source: String,
    pub target: String,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    pub active: bool,
}

impl RegionLink {
    /// `(max(0, 1 − latency/1000) + min(1, bandwidth/1000)) / 2`.
    pub fn reliability_score(&self) -> f64 {
        let latency_term = (1.0 - self.latency_ms / 1000.0).max(0.0);
        let bandwidth_term = (self.bandwidth_mbps / 1000.0).min(1.0);
        (latency_term + bandwidth_term) / 2.0
    }
}

/// A registered service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub node_id: NodeId,
    pub port: u16,
}

/// Coarse load-balancing policies attached to services at the topology
/// level. Distinct from the router's per-rule strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingPolicy {
    RoundRobin,
    LeastLoaded,
    Random,
    RegionAffinity,
}

/// A non-blocking snapshot of the topology.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TopologyStats {
    pub nodes: usize,
    pub active_nodes: usize,
    pub regions: usize,
    pub partitions: usize,
    pub healthy_partitions: usize,
    pub links: usize,
    pub services: usize,
}

/// The topology manager.
pub struct TopologyManager {
    nodes: DashMap<NodeId, TopologyNode>,
    regions: DashMap<String, HashSet<NodeId>>,
    capabilities: DashMap<String, HashSet<NodeId>>,
    partitions: DashMap<String, Partition>,
    links: RwLock<HashMap<String, Vec<RegionLink>>>,
    services: DashMap<String, Vec<ServiceEndpoint>>,
    policies: DashMap<String, LoadBalancingPolicy>,
    events: Arc<EventBus>,
    check_interval: std::time::Duration,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl TopologyManager {
    pub fn new(check_interval: std::time::Duration, events: Arc<EventBus>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            nodes: DashMap::new(),
            regions: DashMap::new(),
            capabilities: DashMap::new(),
            partitions: DashMap::new(),
            links: RwLock::new(HashMap::new()),
            services: DashMap::new(),
            policies: DashMap::new(),
            events,
            check_interval,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    // --- Node registry ---

    pub fn register_node(&self, node: TopologyNode) {
        self.regions
            .entry(node.region.clone())
            .or_default()
            .insert(node.node_id.clone());
        for capability in &node.capabilities {
            self.capabilities
                .entry(capability.clone())
                .or_default()
                .insert(node.node_id.clone());
        }
        info!("Registered node {} in region {}", node.node_id, node.region);
        self.nodes.insert(node.node_id.clone(), node);
    }

    pub fn deregister_node(&self, node_id: &NodeId) -> Option<TopologyNode> {
        let (_, node) = self.nodes.remove(node_id)?;
        if let Some(mut region) = self.regions.get_mut(&node.region) {
            region.remove(node_id);
        }
        for capability in &node.capabilities {
            if let Some(mut holders) = self.capabilities.get_mut(capability) {
                holders.remove(node_id);
            }
        }
        for mut partition in self.partitions.iter_mut() {
            partition.members.remove(node_id);
        }
        Some(node)
    }

    pub fn get_node(&self, node_id: &NodeId) -> Option<TopologyNode> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn set_node_active(&self, node_id: &NodeId, active: bool) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.active = active;
            node.last_seen_ms = now_ms();
        }
    }

    pub fn nodes_in_region(&self, region: &str) -> Vec<TopologyNode> {
        self.regions
            .get(region)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|node_id| self.get_node(node_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn nodes_with_capability(&self, capability: &str) -> Vec<TopologyNode> {
        self.capabilities
            .get(capability)
            .map(|holders| {
                holders
                    .iter()
                    .filter_map(|node_id| self.get_node(node_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    // --- Partitions ---

    pub fn create_partition(
        &self,
        name: impl Into<String>,
        members: HashSet<NodeId>,
    ) -> Result<(), PeridotError> {
        let name = name.into();
        if members.is_empty() {
            return Err(PeridotError::InvalidRequest(format!(
                "partition '{name}' needs at least one member"
            )));
        }
        for member in &members {
            if !self.nodes.contains_key(member) {
                return Err(PeridotError::NodeNotFound(member.clone()));
            }
        }
        self.partitions.insert(
            name.clone(),
            Partition {
                name,
                members,
                primary: None,
                backups: Vec::new(),
                healthy: true,
            },
        );
        Ok(())
    }

    pub fn set_partition_masters(
        &self,
        name: &str,
        primary: NodeId,
        backups: Vec<NodeId>,
    ) -> Result<(), PeridotError> {
        let mut partition = self
            .partitions
            .get_mut(name)
            .ok_or_else(|| PeridotError::PartitionNotFound(name.to_string()))?;
        if !partition.members.contains(&primary) {
            return Err(PeridotError::InvalidRequest(format!(
                "primary {primary} is not a member of partition '{name}'"
            )));
        }
        partition.primary = Some(primary);
        partition.backups = backups;
        Ok(())
    }

    pub fn get_partition(&self, name: &str) -> Option<Partition> {
        self.partitions.get(name).map(|entry| entry.value().clone())
    }

    /// A partition is healthy iff a strict majority of its members are
    /// active. Fires an event on every transition.
    pub fn check_partition_health(&self) {
        for mut partition in self.partitions.iter_mut() {
            let active = partition
                .members
                .iter()
                .filter(|member| {
                    self.nodes
                        .get(*member)
                        .map(|node| node.active)
                        .unwrap_or(false)
                })
                .count();
            let healthy = active * 2 > partition.members.len();
            if healthy != partition.healthy {
                partition.healthy = healthy;
                if healthy {
                    info!("Partition '{}' is healthy again", partition.name);
                } else {
                    warn!(
                        "Partition '{}' lost its majority ({}/{} active)",
                        partition.name,
                        active,
                        partition.members.len()
                    );
                }
                self.events.publish(ClusterEvent::PartitionHealthChanged {
                    name: partition.name.clone(),
                    healthy,
                });
            }
        }
    }

    // --- Cross-region links ---

    pub fn add_link(&self, link: RegionLink) {
        let mut links = self.links.write();
        let entries = links.entry(link.source.clone()).or_default();
        entries.retain(|existing| existing.target != link.target);
        entries.push(link);
    }

    pub fn remove_link(&self, source: &str, target: &str) {
        if let Some(entries) = self.links.write().get_mut(source) {
            entries.retain(|link| link.target != target);
        }
    }

    pub fn links_from(&self, source: &str) -> Vec<RegionLink> {
        self.links.read().get(source).cloned().unwrap_or_default()
    }

    /// Marks links below the reliability floor inactive (and resurrects
    /// recovered ones).
    pub fn score_links(&self) {
        let mut links = self.links.write();
        for entries in links.values_mut() {
            for link in entries.iter_mut() {
                let score = link.reliability_score();
                let usable = score >= LINK_RELIABILITY_FLOOR;
                if link.active && !usable {
                    warn!(
                        "Link {} -> {} degraded (score {:.2}); taking it out of service",
                        link.source, link.target, score
                    );
                }
                link.active = usable;
            }
        }
    }

    /// Breadth-first search over active links. Returns the region sequence
    /// from `source` to `target` inclusive, or empty when unreachable.
    pub fn find_path_to_region(&self, source: &str, target: &str) -> Vec<String> {
        if source == target {
            return vec![source.to_string()];
        }
        let links = self.links.read();
        let mut visited: HashSet<&str> = HashSet::from([source]);
        let mut queue: VecDeque<Vec<String>> = VecDeque::from([vec![source.to_string()]]);

        while let Some(path) = queue.pop_front() {
            let tail = path.last().expect("paths are never empty");
            let Some(entries) = links.get(tail.as_str()) else {
                continue;
            };
            for link in entries.iter().filter(|link| link.active) {
                if link.target == target {
                    let mut found = path.clone();
                    found.push(link.target.clone());
                    return found;
                }
                if visited.insert(link.target.as_str()) {
                    let mut next = path.clone();
                    next.push(link.target.clone());
                    queue.push_back(next);
                }
            }
        }
        Vec::new()
    }

    // --- Service registry ---

    pub fn register_service(&self, service: impl Into<String>, endpoint: ServiceEndpoint) {
        let service = service.into();
        let mut endpoints = self.services.entry(service).or_default();
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }

    pub fn deregister_service(&self, service: &str, node_id: &NodeId) {
        if let Some(mut endpoints) = self.services.get_mut(service) {
            endpoints.retain(|endpoint| &endpoint.node_id != node_id);
        }
    }

    pub fn lookup_service(&self, service: &str) -> Vec<ServiceEndpoint> {
        self.services
            .get(service)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn set_policy(&self, service: impl Into<String>, policy: LoadBalancingPolicy) {
        self.policies.insert(service.into(), policy);
    }

    pub fn policy(&self, service: &str) -> Option<LoadBalancingPolicy> {
        self.policies.get(service).map(|entry| *entry.value())
    }

    // --- Lifecycle ---

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Topology manager starting");
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.handles.lock().push(tokio::spawn(async move {
            let mut tick = time::interval(manager.check_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tick.tick() => {
                        manager.check_partition_health();
                        manager.score_links();
                    }
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Topology manager stopped");
    }

    pub fn stats(&self) -> TopologyStats {
        TopologyStats {
            nodes: self.nodes.len(),
            active_nodes: self.nodes.iter().filter(|node| node.active).count(),
            regions: self.regions.len(),
            partitions: self.partitions.len(),
            healthy_partitions: self
                .partitions
                .iter()
                .filter(|partition| partition.healthy)
                .count(),
            links: self.links.read().values().map(Vec::len).sum(),
            services: self.services.len(),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Debug helper used by partition checks in tests.
    pub fn partition_is_healthy(&self, name: &str) -> Option<bool> {
        self.partitions.get(name).map(|partition| partition.healthy)
    }
}
