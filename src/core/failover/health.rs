// src/core/failover/health.rs

//! Per-node health records, the critical-node predicate, and replacement
//! scoring.

use crate::core::NodeId;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// One node's most recent health reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node_id: NodeId,
    pub responsive: bool,
    pub last_heartbeat_ms: u64,
    /// CPU utilization in percent, 0..100.
    pub cpu_usage: f64,
    /// Memory utilization in percent, 0..100.
    pub memory_usage: f64,
    /// Disk utilization in percent, 0..100.
    pub disk_usage: f64,
    pub network_latency_ms: f64,
    pub error_count: u64,
    pub is_leader: bool,
    pub available: bool,
}

impl NodeHealth {
    pub fn unresponsive(node_id: NodeId) -> Self {
        Self {
            node_id,
            responsive: false,
            last_heartbeat_ms: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_usage: 0.0,
            network_latency_ms: 0.0,
            error_count: 0,
            is_leader: false,
            available: false,
        }
    }

    /// A node is critical when it is unresponsive, unavailable, or any
    /// resource reading crosses its threshold.
    pub fn is_critical(&self, thresholds: &HealthThresholds) -> bool {
        !self.responsive
            || !self.available
            || self.cpu_usage > thresholds.cpu_pct
            || self.memory_usage > thresholds.memory_pct
            || self.network_latency_ms > thresholds.latency_ms
    }

    /// The weighted replacement-fitness blend. Higher is fitter.
    pub fn replacement_score(&self) -> f64 {
        0.3 * (100.0 - self.cpu_usage)
            + 0.3 * (100.0 - self.memory_usage)
            + 0.2 * (100.0 - self.disk_usage)
            + 0.1 * (100.0 - self.network_latency_ms / 10.0)
            + 0.1 * (100.0 - (self.error_count as f64).min(100.0))
    }
}

/// Resource limits above which a node is considered critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub latency_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_pct: 90.0,
            memory_pct: 90.0,
            latency_ms: 1000.0,
        }
    }
}

/// Samples this host's resource usage for its own health record.
pub struct LocalHealthSampler {
    system: System,
}

impl Default for LocalHealthSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHealthSampler {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    pub fn sample(&mut self, node_id: NodeId, now_ms: u64) -> NodeHealth {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let memory_pct = if self.system.total_memory() == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / self.system.total_memory() as f64 * 100.0
        };
        NodeHealth {
            node_id,
            responsive: true,
            last_heartbeat_ms: now_ms,
            cpu_usage: self.system.global_cpu_usage() as f64,
            memory_usage: memory_pct,
            disk_usage: 0.0,
            network_latency_ms: 0.0,
            error_count: 0,
            is_leader: false,
            available: true,
        }
    }
}
