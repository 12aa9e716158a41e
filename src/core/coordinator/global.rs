// src/core/coordinator/global.rs

//! The global consensus state and the coordinator that reconciles it: role
//! assignments, regional leaders, shard masters, and cross-master sync.
//!
//! The coordinator holds only weak handles to the managers it drives; it
//! never outlives them and never forms an ownership cycle.

use crate::config::MultiMasterConfig;
use crate::core::coordinator::master::{MasterNode, MasterRole, MultiMasterManager};
use crate::core::events::{ClusterEvent, EventBus};
use crate::core::metrics;
use crate::core::router::{BackendServer, LoadBalancer};
use crate::core::topology::TopologyManager;
use crate::core::{NodeId, PeridotError, now_ms};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Retention window for coordination events.
const EVENT_RETENTION: Duration = Duration::from_secs(3600);

/// The reconciled, cluster-wide view of who does what. Every accepted update
/// strictly increases `state_version`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalConsensusState {
    pub global_leader: Option<NodeId>,
    pub role_assignments: HashMap<NodeId, MasterRole>,
    pub region_leaders: HashMap<String, NodeId>,
    pub shard_masters: HashMap<u32, NodeId>,
    pub consensus_term: u64,
    pub state_version: u64,
    pub last_update_ms: u64,
}

/// What a coordination event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum CoordinationEventKind {
    MasterPromoted,
    MasterDemoted,
    MasterFailed,
    StateSync,
}

/// One cross-master coordination event, retained for an hour for idempotent
/// replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub id: Uuid,
    pub kind: CoordinationEventKind,
    pub node: NodeId,
    pub role: Option<MasterRole>,
    pub timestamp_ms: u64,
}

/// The flavors of cross-master synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    Ledger,
    State,
    Config,
    Full,
}

/// A pending synchronization request between masters.
#[derive(Debug, Clone)]
pub struct CrossMasterSyncRequest {
    pub id: Uuid,
    pub kind: SyncKind,
    pub target: NodeId,
    pub created: Instant,
    pub timeout: Duration,
}

/// The collaborator that performs the type-specific sync work.
#[async_trait]
pub trait CrossMasterSyncHandler: Send + Sync {
    async fn execute(&self, request: &CrossMasterSyncRequest) -> Result<(), PeridotError>;
}

/// A non-blocking snapshot of coordinator counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CoordinatorStats {
    pub state_version: u64,
    pub consensus_term: u64,
    pub global_leader: Option<NodeId>,
    pub assignments: usize,
    pub region_leaders: usize,
    pub shard_masters: usize,
    pub pending_syncs: usize,
    pub completed_syncs: u64,
    pub failed_syncs: u64,
}

/// The multi-master coordinator.
pub struct MultiMasterCoordinator {
    local_id: NodeId,
    config: MultiMasterConfig,
    state: Mutex<GlobalConsensusState>,
    manager: Weak<MultiMasterManager>,
    topology: Weak<TopologyManager>,
    router: Weak<LoadBalancer>,
    sync_handler: Mutex<Option<Arc<dyn CrossMasterSyncHandler>>>,
    pending_syncs: Mutex<VecDeque<CrossMasterSyncRequest>>,
    events_log: Mutex<Vec<CoordinationEvent>>,
    processed_events: Mutex<HashSet<Uuid>>,
    bus: Arc<EventBus>,
    completed_syncs: AtomicU64,
    failed_syncs: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MultiMasterCoordinator {
    pub fn new(
        local_id: NodeId,
        config: MultiMasterConfig,
        manager: &Arc<MultiMasterManager>,
        topology: &Arc<TopologyManager>,
        router: &Arc<LoadBalancer>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            local_id,
            config,
            state: Mutex::new(GlobalConsensusState::default()),
            manager: Arc::downgrade(manager),
            topology: Arc::downgrade(topology),
            router: Arc::downgrade(router),
            sync_handler: Mutex::new(None),
            pending_syncs: Mutex::new(VecDeque::new()),
            events_log: Mutex::new(Vec::new()),
            processed_events: Mutex::new(HashSet::new()),
            bus,
            completed_syncs: AtomicU64::new(0),
            failed_syncs: AtomicU64::new(0),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn set_sync_handler(&self, handler: Arc<dyn CrossMasterSyncHandler>) {
        *self.sync_handler.lock() = Some(handler);
    }

    pub fn global_state(&self) -> GlobalConsensusState {
        self.state.lock().clone()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.state.lock();
        CoordinatorStats {
            state_version: state.state_version,
            consensus_term: state.consensus_term,
            global_leader: state.global_leader.clone(),
            assignments: state.role_assignments.len(),
            region_leaders: state.region_leaders.len(),
            shard_masters: state.shard_masters.len(),
            pending_syncs: self.pending_syncs.lock().len(),
            completed_syncs: self.completed_syncs.load(Ordering::Relaxed),
            failed_syncs: self.failed_syncs.load(Ordering::Relaxed),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Multi-master coordinator starting on {}", self.local_id);
        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(self.clone().run_consensus_loop()));
        handles.push(tokio::spawn(self.clone().run_sync_loop()));
        handles.push(tokio::spawn(self.clone().run_event_gc_loop()));
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
        info!("Multi-master coordinator stopped");
    }

    async fn run_consensus_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.consensus_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    if !self.validate_global_state() {
                        self.rebuild_global_state();
                    }
                }
            }
        }
    }

    async fn run_sync_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.process_pending_syncs().await;
                }
            }
        }
    }

    async fn run_event_gc_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.collect_stale_events();
                }
            }
        }
    }

    /// A valid global state has a leader who is an active master, enough role
    /// assignments to form a consensus, and a non-empty assignment map.
    pub fn validate_global_state(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return true;
        };
        let state = self.state.lock();
        let Some(leader) = &state.global_leader else {
            return false;
        };
        let leader_active = manager
            .get_master(leader)
            .map(|master| master.healthy)
            .unwrap_or(false);
        leader_active
            && !state.role_assignments.is_empty()
            && state.role_assignments.len() >= self.config.min_masters_for_consensus
    }

    /// Rebuilds the global state from the registry: bumps term and version,
    /// elects the fittest global leader, refreshes role assignments, records
    /// a regional leader for every populated region, and recomputes the
    /// shard map.
    pub fn rebuild_global_state(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let active = manager.active_masters();
        if active.is_empty() {
            debug!("Global state invalid but no active masters to rebuild from");
            return;
        }

        let leader = manager.fittest_master(None);
        let mut state = self.state.lock();
        state.consensus_term += 1;
        state.state_version += 1;
        state.global_leader = leader.map(|master| master.node_id);

        state.role_assignments = active
            .iter()
            .flat_map(|master| {
                master
                    .roles
                    .iter()
                    .map(|role| (master.node_id.clone(), *role))
            })
            .collect();
        // A node with no explicit role still participates in consensus.
        for master in &active {
            state
                .role_assignments
                .entry(master.node_id.clone())
                .or_insert(MasterRole::None);
        }

        for master in &active {
            state
                .region_leaders
                .entry(master.region.clone())
                .or_insert_with(|| master.node_id.clone());
        }
        state.region_leaders.retain(|region, leader| {
            manager
                .get_master(leader)
                .map(|master| master.healthy && &master.region == region)
                .unwrap_or(false)
        });
        for master in &active {
            state
                .region_leaders
                .entry(master.region.clone())
                .or_insert_with(|| master.node_id.clone());
        }

        state.shard_masters = active
            .iter()
            .filter(|master| master.has_role(MasterRole::Shard))
            .filter_map(|master| master.shard_id.map(|shard| (shard, master.node_id.clone())))
            .collect();

        state.last_update_ms = now_ms();
        metrics::GLOBAL_STATE_REBUILDS_TOTAL.inc();
        metrics::GLOBAL_STATE_VERSION.set(state.state_version as f64);
        info!(
            "Rebuilt global consensus state v{} (term {}, leader {:?})",
            state.state_version, state.consensus_term, state.global_leader
        );
    }

    /// Accepts a peer's state only when its version is strictly newer.
    pub fn update_global_state(&self, received: GlobalConsensusState) -> Result<(), PeridotError> {
        let mut state = self.state.lock();
        if received.state_version <= state.state_version {
            return Err(PeridotError::StaleState {
                local: state.state_version,
                received: received.state_version,
            });
        }
        metrics::GLOBAL_STATE_VERSION.set(received.state_version as f64);
        *state = received;
        Ok(())
    }

    /// Promotes a node into a role, registers RPC masters with the router,
    /// and broadcasts the coordination event.
    pub fn promote_master(&self, node_id: &NodeId, role: MasterRole) -> Result<(), PeridotError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| PeridotError::Internal("multi-master manager dropped".into()))?;
        manager.promote(node_id, role)?;

        {
            let mut state = self.state.lock();
            state.role_assignments.insert(node_id.clone(), role);
            state.state_version += 1;
            state.last_update_ms = now_ms();
            metrics::GLOBAL_STATE_VERSION.set(state.state_version as f64);
        }

        if role == MasterRole::Rpc {
            if let (Some(router), Some(master)) =
                (self.router.upgrade(), manager.get_master(node_id))
            {
                router.register_backend(backend_for(&master));
            }
        }

        self.record_event(CoordinationEvent {
            id: Uuid::new_v4(),
            kind: CoordinationEventKind::MasterPromoted,
            node: node_id.clone(),
            role: Some(role),
            timestamp_ms: now_ms(),
        });
        self.bus.publish(ClusterEvent::MasterPromoted {
            node: node_id.clone(),
            role: role.to_string(),
        });
        info!("Promoted {} to {} master", node_id, role);
        Ok(())
    }

    /// Demotes a node from a role, dropping any regional leadership it held
    /// and its router registration.
    pub fn demote_master(&self, node_id: &NodeId, role: MasterRole) -> Result<(), PeridotError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| PeridotError::Internal("multi-master manager dropped".into()))?;
        manager.demote(node_id, role)?;

        {
            let mut state = self.state.lock();
            state.role_assignments.remove(node_id);
            state
                .region_leaders
                .retain(|_, leader| leader != node_id);
            if state.global_leader.as_ref() == Some(node_id) {
                state.global_leader = None;
            }
            state.state_version += 1;
            state.last_update_ms = now_ms();
            metrics::GLOBAL_STATE_VERSION.set(state.state_version as f64);
        }

        if let Some(router) = self.router.upgrade() {
            router.deregister_backend(node_id);
        }

        self.record_event(CoordinationEvent {
            id: Uuid::new_v4(),
            kind: CoordinationEventKind::MasterDemoted,
            node: node_id.clone(),
            role: Some(role),
            timestamp_ms: now_ms(),
        });
        self.bus.publish(ClusterEvent::MasterDemoted {
            node: node_id.clone(),
            role: role.to_string(),
        });
        info!("Demoted {} from {} master", node_id, role);
        Ok(())
    }

    /// Reassigns a failed master's roles to the fittest capable replacement.
    pub fn handle_master_failure(&self, failed: &NodeId) -> Result<(), PeridotError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| PeridotError::Internal("multi-master manager dropped".into()))?;
        manager.mark_unhealthy(failed);
        let roles = manager.strip_roles(failed);
        if let Some(router) = self.router.upgrade() {
            router.deregister_backend(failed);
        }

        let replacement = manager
            .fittest_master(Some(failed))
            .ok_or(PeridotError::NoCandidate)?;

        for role in &roles {
            if *role == MasterRole::None {
                continue;
            }
            if let Err(e) = self.promote_master(&replacement.node_id, *role) {
                warn!(
                    "Could not hand role {} from {} to {}: {}",
                    role, failed, replacement.node_id, e
                );
            }
        }

        {
            let mut state = self.state.lock();
            state.role_assignments.remove(failed);
            state.region_leaders.retain(|_, leader| leader != failed);
            state.shard_masters.retain(|_, master| master != failed);
            if state.global_leader.as_ref() == Some(failed) {
                state.global_leader = Some(replacement.node_id.clone());
            }
            state.state_version += 1;
            state.last_update_ms = now_ms();
            metrics::GLOBAL_STATE_VERSION.set(state.state_version as f64);
        }

        self.record_event(CoordinationEvent {
            id: Uuid::new_v4(),
            kind: CoordinationEventKind::MasterFailed,
            node: failed.clone(),
            role: None,
            timestamp_ms: now_ms(),
        });
        info!(
            "Master {} failed; roles handed to {}",
            failed, replacement.node_id
        );
        Ok(())
    }

    /// Queues a cross-master sync request with the standard 30 s timeout.
    pub fn request_sync(&self, kind: SyncKind, target: NodeId) -> Uuid {
        let request = CrossMasterSyncRequest {
            id: Uuid::new_v4(),
            kind,
            target,
            created: Instant::now(),
            timeout: self.config.sync_timeout,
        };
        let id = request.id;
        self.pending_syncs.lock().push_back(request);
        id
    }

    async fn process_pending_syncs(&self) {
        let handler = self.sync_handler.lock().clone();
        loop {
            let Some(request) = self.pending_syncs.lock().pop_front() else {
                return;
            };
            if request.created.elapsed() > request.timeout {
                warn!(
                    "Cross-master sync {} ({}) to {} timed out",
                    request.id, request.kind, request.target
                );
                self.failed_syncs.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let Some(handler) = handler.as_ref() else {
                debug!("No sync handler registered; dropping {}", request.id);
                self.failed_syncs.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match handler.execute(&request).await {
                Ok(()) => {
                    self.completed_syncs.fetch_add(1, Ordering::Relaxed);
                    self.record_event(CoordinationEvent {
                        id: request.id,
                        kind: CoordinationEventKind::StateSync,
                        node: request.target.clone(),
                        role: None,
                        timestamp_ms: now_ms(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Cross-master sync {} ({}) to {} failed: {}",
                        request.id, request.kind, request.target, e
                    );
                    self.failed_syncs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Applies a coordination event received from a peer, at most once.
    pub fn apply_event(&self, event: CoordinationEvent) {
        {
            let mut processed = self.processed_events.lock();
            if !processed.insert(event.id) {
                debug!("Skipping already-processed coordination event {}", event.id);
                return;
            }
        }
        match (event.kind, event.role) {
            (CoordinationEventKind::MasterPromoted, Some(role)) => {
                if let Err(e) = self.promote_master(&event.node.clone(), role) {
                    debug!("Replayed promotion of {} failed: {}", event.node, e);
                }
            }
            (CoordinationEventKind::MasterDemoted, Some(role)) => {
                if let Err(e) = self.demote_master(&event.node.clone(), role) {
                    debug!("Replayed demotion of {} failed: {}", event.node, e);
                }
            }
            (CoordinationEventKind::MasterFailed, _) => {
                if let Err(e) = self.handle_master_failure(&event.node.clone()) {
                    debug!("Replayed failure of {} failed: {}", event.node, e);
                }
            }
            _ => {}
        }
        self.events_log.lock().push(event);
    }

    fn record_event(&self, event: CoordinationEvent) {
        self.processed_events.lock().insert(event.id);
        self.events_log.lock().push(event);
    }

    /// Drops events older than the retention window.
    fn collect_stale_events(&self) {
        let cutoff = now_ms().saturating_sub(EVENT_RETENTION.as_millis() as u64);
        let mut log = self.events_log.lock();
        let before = log.len();
        let mut processed = self.processed_events.lock();
        log.retain(|event| {
            let keep = event.timestamp_ms >= cutoff;
            if !keep {
                processed.remove(&event.id);
            }
            keep
        });
        if log.len() < before {
            debug!("Collected {} stale coordination events", before - log.len());
        }
    }

    pub fn events(&self) -> Vec<CoordinationEvent> {
        self.events_log.lock().clone()
    }

    /// Regional path lookup delegated to the topology manager; used by sync
    /// planning when the target sits in another region.
    pub fn path_to_region(&self, source: &str, target: &str) -> Vec<String> {
        self.topology
            .upgrade()
            .map(|topology| topology.find_path_to_region(source, target))
            .unwrap_or_default()
    }
}

fn backend_for(master: &MasterNode) -> BackendServer {
    BackendServer::new(
        master.node_id.clone(),
        master.address.clone(),
        master.port,
        master.region.clone(),
    )
}
