// src/config.rs

//! Manages node configuration: loading, defaults, and validation.

use crate::core::PeridotError;
use crate::core::replication::ReplicationStrategy;
use crate::core::router::{BackpressurePolicy, RoutingStrategy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// The top-level validator configuration, loaded from a TOML file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ValidatorConfig {
    /// Path to the identity keypair. `None` generates an ephemeral identity.
    #[serde(default)]
    pub identity_keypair_path: Option<String>,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,
    #[serde(default = "default_rpc_bind_address")]
    pub rpc_bind_address: String,
    #[serde(default = "default_gossip_bind_address")]
    pub gossip_bind_address: String,
    #[serde(default = "default_true")]
    pub enable_rpc: bool,
    #[serde(default = "default_true")]
    pub enable_gossip: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_node_address")]
    pub node_address: String,
    #[serde(default = "default_node_port")]
    pub node_port: u16,
    /// Shared secret authenticating gossip and CRDS records. `None` disables
    /// signing (single-tenant deployments only).
    #[serde(default)]
    pub cluster_secret: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Static consensus peers (id + cluster-bus address).
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub multi_master: MultiMasterConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            identity_keypair_path: None,
            ledger_path: default_ledger_path(),
            rpc_bind_address: default_rpc_bind_address(),
            gossip_bind_address: default_gossip_bind_address(),
            enable_rpc: true,
            enable_gossip: true,
            max_connections: default_max_connections(),
            region: default_region(),
            node_address: default_node_address(),
            node_port: default_node_port(),
            cluster_secret: None,
            log_level: default_log_level(),
            peers: Vec::new(),
            metrics: MetricsConfig::default(),
            gossip: GossipConfig::default(),
            consensus: ConsensusConfig::default(),
            replication: ReplicationSettings::default(),
            failover: FailoverConfig::default(),
            multi_master: MultiMasterConfig::default(),
            topology: TopologyConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl ValidatorConfig {
    pub fn from_file(path: &str) -> Result<Self, PeridotError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            PeridotError::InvalidConfig(format!("failed to read config file at '{path}': {e}"))
        })?;
        let config: ValidatorConfig = toml::from_str(&contents).map_err(|e| {
            PeridotError::InvalidConfig(format!("failed to parse TOML from '{path}': {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects out-of-range or inconsistent settings before anything starts.
    pub fn validate(&self) -> Result<(), PeridotError> {
        if self.node_port == 0 {
            return Err(PeridotError::InvalidConfig("node_port must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(PeridotError::InvalidConfig(
                "max_connections must be non-zero".into(),
            ));
        }
        if self.gossip.fanout == 0 {
            return Err(PeridotError::InvalidConfig(
                "gossip.fanout must be non-zero".into(),
            ));
        }
        if !self.gossip.num_shards.is_power_of_two() {
            return Err(PeridotError::InvalidConfig(
                "gossip.num_shards must be a power of two".into(),
            ));
        }
        if self.consensus.election_timeout_min > self.consensus.election_timeout_max {
            return Err(PeridotError::InvalidConfig(
                "consensus.election_timeout_min exceeds election_timeout_max".into(),
            ));
        }
        if self.replication.batch_size == 0 {
            return Err(PeridotError::InvalidConfig(
                "replication.batch_size must be non-zero".into(),
            ));
        }
        if self.replication.quorum_size == 0 {
            return Err(PeridotError::InvalidConfig(
                "replication.quorum_size must be non-zero".into(),
            ));
        }
        if self.router.queue_capacity == 0 {
            return Err(PeridotError::InvalidConfig(
                "router.queue_capacity must be non-zero".into(),
            ));
        }
        if self.multi_master.min_masters_for_consensus == 0 {
            return Err(PeridotError::InvalidConfig(
                "multi_master.min_masters_for_consensus must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// One static consensus peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerConfig {
    pub node_id: String,
    pub address: String,
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server exposes Prometheus metrics and stats snapshots.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Gossip-plane tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GossipConfig {
    #[serde(with = "humantime_serde", default = "default_push_interval")]
    pub push_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_pull_interval")]
    pub pull_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_trim_interval")]
    pub trim_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_ping_interval")]
    pub ping_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_rotation_interval")]
    pub rotation_interval: Duration,
    /// Non-self entries older than this are trimmed.
    #[serde(with = "humantime_serde", default = "default_entry_timeout")]
    pub entry_timeout: Duration,
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// Peers asked per pull round.
    #[serde(default = "default_pull_peers")]
    pub pull_peers: usize,
    /// Peers pinged per ping round.
    #[serde(default = "default_ping_peers")]
    pub ping_peers: usize,
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,
    #[serde(default = "default_received_cache_capacity")]
    pub received_cache_capacity: usize,
    /// Redundant deliveries from one relayer before we prune it.
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: usize,
    /// Gossip addresses contacted at startup to join the cluster.
    #[serde(default)]
    pub entrypoints: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            push_interval: default_push_interval(),
            pull_interval: default_pull_interval(),
            trim_interval: default_trim_interval(),
            ping_interval: default_ping_interval(),
            rotation_interval: default_rotation_interval(),
            entry_timeout: default_entry_timeout(),
            fanout: default_fanout(),
            pull_peers: default_pull_peers(),
            ping_peers: default_ping_peers(),
            num_shards: default_num_shards(),
            received_cache_capacity: default_received_cache_capacity(),
            prune_threshold: default_prune_threshold(),
            entrypoints: Vec::new(),
        }
    }
}

/// Raft engine tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConsensusConfig {
    #[serde(with = "humantime_serde", default = "default_election_timeout_min")]
    pub election_timeout_min: Duration,
    #[serde(with = "humantime_serde", default = "default_election_timeout_max")]
    pub election_timeout_max: Duration,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_proposal_timeout")]
    pub proposal_timeout: Duration,
    #[serde(default = "default_max_proposal_retries")]
    pub max_proposal_retries: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: default_election_timeout_min(),
            election_timeout_max: default_election_timeout_max(),
            heartbeat_interval: default_heartbeat_interval(),
            proposal_timeout: default_proposal_timeout(),
            max_proposal_retries: default_max_proposal_retries(),
        }
    }
}

/// Replication manager tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicationSettings {
    #[serde(default = "default_replication_strategy")]
    pub strategy: ReplicationStrategy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(with = "humantime_serde", default = "default_replication_interval")]
    pub replication_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_repl_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// Heartbeat lag beyond this triggers a resync request.
    #[serde(with = "humantime_serde", default = "default_sync_check_interval")]
    pub sync_check_interval: Duration,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_quorum_size")]
    pub quorum_size: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            strategy: default_replication_strategy(),
            batch_size: default_batch_size(),
            replication_interval: default_replication_interval(),
            heartbeat_interval: default_repl_heartbeat_interval(),
            sync_check_interval: default_sync_check_interval(),
            max_retry_count: default_max_retry_count(),
            quorum_size: default_quorum_size(),
        }
    }
}

/// Failover controller tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FailoverConfig {
    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_recovery_interval")]
    pub recovery_interval: Duration,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Automatic failovers are suppressed for this long after a success.
    #[serde(with = "humantime_serde", default = "default_failover_cooldown")]
    pub failover_cooldown: Duration,
    /// Pause in FailedOver before settling back to Normal.
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,
    #[serde(default)]
    pub thresholds: crate::core::failover::HealthThresholds,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            recovery_interval: default_recovery_interval(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failover_cooldown: default_failover_cooldown(),
            settle_delay: default_settle_delay(),
            thresholds: Default::default(),
        }
    }
}

/// Multi-master coordinator tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MultiMasterConfig {
    #[serde(default = "default_min_masters")]
    pub min_masters_for_consensus: usize,
    #[serde(default = "default_max_masters_per_region")]
    pub max_masters_per_region: usize,
    #[serde(with = "humantime_serde", default = "default_consensus_interval")]
    pub consensus_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_sync_timeout")]
    pub sync_timeout: Duration,
}

impl Default for MultiMasterConfig {
    fn default() -> Self {
        Self {
            min_masters_for_consensus: default_min_masters(),
            max_masters_per_region: default_max_masters_per_region(),
            consensus_interval: default_consensus_interval(),
            sync_timeout: default_sync_timeout(),
        }
    }
}

/// Topology manager tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TopologyConfig {
    #[serde(with = "humantime_serde", default = "default_topology_check_interval")]
    pub check_interval: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            check_interval: default_topology_check_interval(),
        }
    }
}

/// Request router tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RouterConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_backpressure")]
    pub backpressure: BackpressurePolicy,
    #[serde(default = "default_default_strategy")]
    pub default_strategy: RoutingStrategy,
    #[serde(with = "humantime_serde", default = "default_breaker_probe_interval")]
    pub breaker_probe_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_router_health_interval")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_affinity_gc_interval")]
    pub affinity_gc_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            backpressure: default_backpressure(),
            default_strategy: default_default_strategy(),
            breaker_probe_interval: default_breaker_probe_interval(),
            health_check_interval: default_router_health_interval(),
            affinity_gc_interval: default_affinity_gc_interval(),
        }
    }
}

// --- Field defaults ---

fn default_true() -> bool {
    true
}
fn default_ledger_path() -> String {
    "ledger".into()
}
fn default_rpc_bind_address() -> String {
    "0.0.0.0:8899".into()
}
fn default_gossip_bind_address() -> String {
    "0.0.0.0:8001".into()
}
fn default_max_connections() -> u32 {
    4096
}
fn default_region() -> String {
    "default".into()
}
fn default_node_address() -> String {
    "127.0.0.1".into()
}
fn default_node_port() -> u16 {
    8000
}
fn default_log_level() -> String {
    "info".into()
}
fn default_metrics_port() -> u16 {
    8878
}
fn default_push_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_pull_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_trim_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_rotation_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_entry_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_fanout() -> usize {
    6
}
fn default_pull_peers() -> usize {
    3
}
fn default_ping_peers() -> usize {
    8
}
fn default_num_shards() -> usize {
    256
}
fn default_received_cache_capacity() -> usize {
    10_000
}
fn default_prune_threshold() -> usize {
    20
}
fn default_election_timeout_min() -> Duration {
    Duration::from_millis(150)
}
fn default_election_timeout_max() -> Duration {
    Duration::from_millis(300)
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_millis(50)
}
fn default_proposal_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_max_proposal_retries() -> u32 {
    5
}
fn default_replication_strategy() -> ReplicationStrategy {
    ReplicationStrategy::QuorumBased
}
fn default_batch_size() -> usize {
    64
}
fn default_replication_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_repl_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_sync_check_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_max_retry_count() -> u32 {
    3
}
fn default_quorum_size() -> usize {
    2
}
fn default_health_check_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_recovery_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_failover_cooldown() -> Duration {
    Duration::from_secs(30)
}
fn default_settle_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_min_masters() -> usize {
    1
}
fn default_max_masters_per_region() -> usize {
    3
}
fn default_consensus_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_sync_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_topology_check_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_backpressure() -> BackpressurePolicy {
    BackpressurePolicy::Reject
}
fn default_default_strategy() -> RoutingStrategy {
    RoutingStrategy::RoundRobin
}
fn default_breaker_probe_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_router_health_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_affinity_gc_interval() -> Duration {
    Duration::from_secs(60)
}
