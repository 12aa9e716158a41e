// src/core/mod.rs

//! The central module containing the coordination subsystems of Peridot.

pub mod consensus;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod failover;
pub mod gossip;
pub mod metrics;
pub mod replication;
pub mod router;
pub mod topology;

pub use errors::PeridotError;

/// The cluster-wide identity of a node: a hex-encoded origin key.
pub type NodeId = String;

/// Current system time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generates a fresh random node id in the wire format used across the
/// cluster.
pub fn generate_node_id() -> NodeId {
    hex::encode(rand::random::<[u8; 20]>())
}
