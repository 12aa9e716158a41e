// src/core/failover/mod.rs

//! Failure detection and automated failover.

pub mod controller;
pub mod health;

pub use controller::{
    FailoverActionHandler, FailoverController, FailoverEvent, FailoverState, FailoverStats,
    FailoverTrigger,
};
pub use health::{HealthThresholds, LocalHealthSampler, NodeHealth};
