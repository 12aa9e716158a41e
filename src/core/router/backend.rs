// src/core/router/backend.rs

//! Backend server records and the eligibility rule.

use crate::core::NodeId;
use serde::{Deserialize, Serialize};

/// One routable backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServer {
    pub server_id: NodeId,
    pub address: String,
    pub port: u16,
    pub region: String,
    pub weight: u32,
    pub current_connections: u32,
    pub max_connections: u32,
    pub avg_response_ms: f64,
    /// 0.0 (dead) to 1.0 (perfect).
    pub health_score: f64,
    pub active: bool,
    /// Draining servers finish in-flight requests but take no new ones.
    pub draining: bool,
    pub last_health_check_ms: u64,
}

impl BackendServer {
    pub fn new(server_id: NodeId, address: String, port: u16, region: String) -> Self {
        Self {
            server_id,
            address,
            port,
            region,
            weight: 1,
            current_connections: 0,
            max_connections: u32::MAX,
            avg_response_ms: 0.0,
            health_score: 1.0,
            active: true,
            draining: false,
            last_health_check_ms: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Eligible iff active, not draining, health above 0.5, and (checked by
    /// the balancer) its circuit breaker is closed.
    pub fn is_eligible(&self) -> bool {
        self.active && !self.draining && self.health_score > 0.5
    }

    /// Fraction of the connection budget in use, 0.0..1.0.
    pub fn load_factor(&self) -> f64 {
        if self.max_connections == 0 {
            return 1.0;
        }
        (self.current_connections as f64 / self.max_connections as f64).min(1.0)
    }
}
