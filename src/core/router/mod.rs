// src/core/router/mod.rs

//! The distributed request router.

pub mod affinity;
pub mod backend;
pub mod balancer;
pub mod breaker;
pub mod queue;
pub mod strategy;

pub use backend::BackendServer;
pub use balancer::{
    ConnectionRequest, ConnectionResponse, HealthProber, LoadBalancer, LoadBalancerStats,
    RoutingRule,
};
pub use queue::{BackpressurePolicy, QueueMetrics, RequestQueue};
pub use strategy::RoutingStrategy;
