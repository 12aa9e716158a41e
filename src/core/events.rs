// src/core/events.rs

//! Defines the event bus for cross-subsystem cluster notifications.
//!
//! The failover controller, coordinator, topology manager, and gossip service
//! publish here; interested subsystems subscribe. The bus is a broadcast
//! channel, so a slow subscriber can lag but never blocks a publisher.

use crate::core::failover::FailoverTrigger;
use crate::core::gossip::NodeId;
use tokio::sync::broadcast::{self, Sender as BroadcastSender};
use tracing::debug;

/// The capacity of the broadcast channel for cluster events. Large enough to
/// absorb bursts during a failover storm without lagging subscribers.
const EVENT_BUS_CAPACITY: usize = 4096;

/// A cluster-level notification published by one subsystem for the others.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A failover procedure started for `failed_node`.
    FailoverStarted {
        failed_node: NodeId,
        trigger: FailoverTrigger,
    },
    /// A failover procedure completed; `replacement` took over.
    FailoverCompleted {
        failed_node: NodeId,
        replacement: NodeId,
    },
    /// A failover procedure could not find a replacement or failed mid-way.
    FailoverFailed { failed_node: NodeId },
    /// A node was promoted to a master role by the coordinator.
    MasterPromoted { node: NodeId, role: String },
    /// A node was demoted from a master role.
    MasterDemoted { node: NodeId, role: String },
    /// A topology partition changed health.
    PartitionHealthChanged { name: String, healthy: bool },
    /// Two different shred payloads were observed for the same (slot, index).
    DuplicateShred {
        origin: NodeId,
        slot: u64,
        index: u32,
    },
    /// A replication target was deactivated after repeated failures.
    ReplicationTargetFailed { target: NodeId },
}

/// The central distribution hub for cluster events.
#[derive(Debug)]
pub struct EventBus {
    sender: BroadcastSender<ClusterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event to all current subscribers. It is fine for no
    /// subscriber to be listening.
    pub fn publish(&self, event: ClusterEvent) {
        if self.sender.send(event).is_err() {
            debug!("Published a cluster event with no active subscribers.");
        }
    }

    /// Provides a new receiver for a subsystem to subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }
}
