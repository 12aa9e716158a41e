// src/core/metrics.rs

//! Defines and registers Prometheus metrics for node monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire process lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gossip ---
    /// Packets sent on the gossip plane, labeled by protocol message kind.
    pub static ref GOSSIP_PACKETS_SENT_TOTAL: CounterVec =
        register_counter_vec!("peridot_gossip_packets_sent_total", "Gossip packets sent, labeled by kind.", &["kind"]).unwrap();
    /// Packets received on the gossip plane, labeled by protocol message kind.
    pub static ref GOSSIP_PACKETS_RECEIVED_TOTAL: CounterVec =
        register_counter_vec!("peridot_gossip_packets_received_total", "Gossip packets received, labeled by kind.", &["kind"]).unwrap();
    /// Values rejected because their content-hash was already processed.
    pub static ref GOSSIP_DEDUP_HITS_TOTAL: Counter =
        register_counter!("peridot_gossip_dedup_hits_total", "Values rejected by the received-message cache.").unwrap();
    /// CRDS inserts that did not override the stored value.
    pub static ref CRDS_INSERT_FAILS_TOTAL: Counter =
        register_counter!("peridot_crds_insert_fails_total", "CRDS inserts dropped as stale or unsigned.").unwrap();
    /// Number of entries currently held in the CRDS table.
    pub static ref CRDS_TABLE_SIZE: Gauge =
        register_gauge!("peridot_crds_table_size", "Entries currently held in the CRDS table.").unwrap();
    /// Values dropped because their envelope signature did not verify.
    pub static ref GOSSIP_BAD_SIGNATURES_TOTAL: Counter =
        register_counter!("peridot_gossip_bad_signatures_total", "Gossip values dropped on signature failure.").unwrap();

    // --- Consensus ---
    /// The current Raft term observed by this node.
    pub static ref CONSENSUS_TERM: Gauge =
        register_gauge!("peridot_consensus_term", "Current Raft term.").unwrap();
    /// Log entries committed by this node since startup.
    pub static ref CONSENSUS_COMMITTED_TOTAL: Counter =
        register_counter!("peridot_consensus_committed_total", "Log entries committed since startup.").unwrap();
    /// Leader elections started by this node.
    pub static ref CONSENSUS_ELECTIONS_TOTAL: Counter =
        register_counter!("peridot_consensus_elections_total", "Leader elections started by this node.").unwrap();
    /// Proposals dropped after exhausting their retry budget.
    pub static ref CONSENSUS_DROPPED_PROPOSALS_TOTAL: Counter =
        register_counter!("peridot_consensus_dropped_proposals_total", "Proposals dropped after max retries.").unwrap();

    // --- Replication ---
    /// Replication batches sent, labeled by outcome.
    pub static ref REPLICATION_BATCHES_TOTAL: CounterVec =
        register_counter_vec!("peridot_replication_batches_total", "Replication batches sent, labeled by outcome.", &["outcome"]).unwrap();
    /// Bytes shipped to replication targets.
    pub static ref REPLICATION_BYTES_TOTAL: Counter =
        register_counter!("peridot_replication_bytes_total", "Bytes shipped to replication targets.").unwrap();

    // --- Failover ---
    /// Failover procedures run, labeled by outcome.
    pub static ref FAILOVERS_TOTAL: CounterVec =
        register_counter_vec!("peridot_failovers_total", "Failover procedures run, labeled by outcome.", &["outcome"]).unwrap();
    /// Node recoveries completed by the recovery loop.
    pub static ref NODE_RECOVERIES_TOTAL: Counter =
        register_counter!("peridot_node_recoveries_total", "Failed nodes restored to the cluster.").unwrap();

    // --- Router ---
    /// Requests routed, labeled by outcome.
    pub static ref ROUTED_REQUESTS_TOTAL: CounterVec =
        register_counter_vec!("peridot_routed_requests_total", "Requests routed, labeled by outcome.", &["outcome"]).unwrap();
    /// Requests rejected because the bounded queue was full.
    pub static ref QUEUE_PUSH_FAILURES_TOTAL: Counter =
        register_counter!("peridot_queue_push_failures_total", "Enqueue attempts rejected by the bounded request queue.").unwrap();
    /// A histogram of routing decision latencies.
    pub static ref ROUTING_LATENCY_SECONDS: Histogram =
        register_histogram!("peridot_routing_latency_seconds", "Latency of routing decisions in seconds.").unwrap();

    // --- Coordinator ---
    /// Global consensus state rebuilds performed by the coordinator.
    pub static ref GLOBAL_STATE_REBUILDS_TOTAL: Counter =
        register_counter!("peridot_global_state_rebuilds_total", "Global consensus state rebuilds.").unwrap();
    /// The current global consensus state version.
    pub static ref GLOBAL_STATE_VERSION: Gauge =
        register_gauge!("peridot_global_state_version", "Current global consensus state version.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
