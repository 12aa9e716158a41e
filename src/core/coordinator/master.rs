// src/core/coordinator/master.rs

//! The master registry: which node holds which role, per region, and whether
//! it has the capacity to take another.

use crate::config::MultiMasterConfig;
use crate::core::failover::NodeHealth;
use crate::core::{NodeId, PeridotError, now_ms};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A role a master node can hold. A node may hold several.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum MasterRole {
    None,
    Rpc,
    Ledger,
    Gossip,
    Shard,
    Global,
}

/// One registered master node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterNode {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub roles: BTreeSet<MasterRole>,
    pub shard_id: Option<u32>,
    pub region: String,
    pub last_heartbeat_ms: u64,
    pub load_score: f64,
    pub healthy: bool,
}

impl MasterNode {
    pub fn new(node_id: NodeId, address: String, port: u16, region: String) -> Self {
        Self {
            node_id,
            address,
            port,
            roles: BTreeSet::new(),
            shard_id: None,
            region,
            last_heartbeat_ms: now_ms(),
            load_score: 0.0,
            healthy: true,
        }
    }

    pub fn has_role(&self, role: MasterRole) -> bool {
        self.roles.contains(&role)
    }
}

/// A non-blocking snapshot of the master registry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MultiMasterStats {
    pub total_masters: usize,
    pub active_masters: usize,
    pub covered_roles: Vec<String>,
    pub regions: Vec<String>,
}

/// Resolves a node id to its latest health reading, when one is known.
pub type HealthProvider = Arc<dyn Fn(&NodeId) -> Option<NodeHealth> + Send + Sync>;

/// The per-role, per-region master registry.
pub struct MultiMasterManager {
    config: MultiMasterConfig,
    masters: DashMap<NodeId, MasterNode>,
    health_provider: RwLock<Option<HealthProvider>>,
}

impl MultiMasterManager {
    pub fn new(config: MultiMasterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            masters: DashMap::new(),
            health_provider: RwLock::new(None),
        })
    }

    pub fn set_health_provider(&self, provider: HealthProvider) {
        *self.health_provider.write() = Some(provider);
    }

    pub fn config(&self) -> &MultiMasterConfig {
        &self.config
    }

    pub fn register_master(&self, master: MasterNode) {
        self.masters.insert(master.node_id.clone(), master);
    }

    pub fn remove_master(&self, node_id: &NodeId) -> Option<MasterNode> {
        self.masters.remove(node_id).map(|(_, master)| master)
    }

    pub fn get_master(&self, node_id: &NodeId) -> Option<MasterNode> {
        self.masters.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn record_heartbeat(&self, node_id: &NodeId, load_score: f64) {
        if let Some(mut master) = self.masters.get_mut(node_id) {
            master.last_heartbeat_ms = now_ms();
            master.load_score = load_score;
            master.healthy = true;
        }
    }

    pub fn mark_unhealthy(&self, node_id: &NodeId) {
        if let Some(mut master) = self.masters.get_mut(node_id) {
            master.healthy = false;
        }
    }

    pub fn active_masters(&self) -> Vec<MasterNode> {
        self.masters
            .iter()
            .filter(|master| master.healthy)
            .map(|master| master.value().clone())
            .collect()
    }

    pub fn masters_with_role(&self, role: MasterRole) -> Vec<MasterNode> {
        self.masters
            .iter()
            .filter(|master| master.healthy && master.has_role(role))
            .map(|master| master.value().clone())
            .collect()
    }

    /// A role is covered while at least one healthy master holds it.
    pub fn is_role_covered(&self, role: MasterRole) -> bool {
        self.masters
            .iter()
            .any(|master| master.healthy && master.has_role(role))
    }

    fn count_role_in_region(&self, role: MasterRole, region: &str) -> usize {
        self.masters
            .iter()
            .filter(|master| master.region == region && master.has_role(role))
            .count()
    }

    /// Validates capacity (CPU and memory both under 80%) and the per-region
    /// cap, then grants the role.
    pub fn promote(&self, node_id: &NodeId, role: MasterRole) -> Result<(), PeridotError> {
        let region = {
            let master = self
                .masters
                .get(node_id)
                .ok_or_else(|| PeridotError::NodeNotFound(node_id.clone()))?;
            if master.has_role(role) {
                return Ok(());
            }
            master.region.clone()
        };

        if let Some(provider) = self.health_provider.read().clone() {
            if let Some(health) = provider(node_id) {
                if health.cpu_usage >= 80.0 || health.memory_usage >= 80.0 {
                    return Err(PeridotError::InvalidState(format!(
                        "node {node_id} lacks capacity for role {role} (cpu {:.0}%, mem {:.0}%)",
                        health.cpu_usage, health.memory_usage
                    )));
                }
            }
        }

        if self.count_role_in_region(role, &region) >= self.config.max_masters_per_region {
            return Err(PeridotError::InvalidState(format!(
                "region {region} already has its cap of {} masters for role {role}",
                self.config.max_masters_per_region
            )));
        }

        if let Some(mut master) = self.masters.get_mut(node_id) {
            master.roles.insert(role);
        }
        Ok(())
    }

    pub fn demote(&self, node_id: &NodeId, role: MasterRole) -> Result<(), PeridotError> {
        let mut master = self
            .masters
            .get_mut(node_id)
            .ok_or_else(|| PeridotError::NodeNotFound(node_id.clone()))?;
        master.roles.remove(&role);
        Ok(())
    }

    /// All roles a master held, cleared in one step. Returns them for the
    /// caller to reassign.
    pub fn strip_roles(&self, node_id: &NodeId) -> BTreeSet<MasterRole> {
        self.masters
            .get_mut(node_id)
            .map(|mut master| std::mem::take(&mut master.roles))
            .unwrap_or_default()
    }

    /// The fittest healthy master other than `exclude`, by the replacement
    /// blend when health is known, by load score otherwise.
    pub fn fittest_master(&self, exclude: Option<&NodeId>) -> Option<MasterNode> {
        let provider = self.health_provider.read().clone();
        self.masters
            .iter()
            .filter(|master| master.healthy && Some(master.key()) != exclude)
            .map(|master| {
                let fitness = provider
                    .as_ref()
                    .and_then(|p| p(master.key()))
                    .map(|health| health.replacement_score())
                    .unwrap_or(100.0 - master.load_score);
                (master.clone(), fitness)
            })
            .max_by(|(a, fit_a), (b, fit_b)| {
                fit_a
                    .partial_cmp(fit_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.node_id.cmp(&a.node_id))
            })
            .map(|(master, _)| master)
    }

    pub fn stats(&self) -> MultiMasterStats {
        let mut covered: BTreeSet<String> = BTreeSet::new();
        let mut regions: BTreeSet<String> = BTreeSet::new();
        let mut active = 0usize;
        for master in self.masters.iter() {
            if master.healthy {
                active += 1;
                for role in &master.roles {
                    covered.insert(role.to_string());
                }
            }
            regions.insert(master.region.clone());
        }
        MultiMasterStats {
            total_masters: self.masters.len(),
            active_masters: active,
            covered_roles: covered.into_iter().collect(),
            regions: regions.into_iter().collect(),
        }
    }
}
