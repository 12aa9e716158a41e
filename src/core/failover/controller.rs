// src/core/failover/controller.rs

//! The failover state machine: health aggregation, failure detection,
//! replacement selection, traffic switching, and node recovery.
//!
//! At most one failover procedure runs at a time; a trigger that arrives
//! while a procedure is active is ignored until the state returns to Normal.
//! The injected action handler is treated as blocking and is never invoked
//! while the state mutex is held.

use crate::config::FailoverConfig;
use crate::core::events::{ClusterEvent, EventBus};
use crate::core::failover::health::NodeHealth;
use crate::core::metrics;
use crate::core::{NodeId, PeridotError, now_ms};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on the retained failover event history.
const EVENT_HISTORY_CAP: usize = 100;
/// Minimum spacing between recovery attempts for one node.
const RECOVERY_THROTTLE: Duration = Duration::from_secs(300);

/// The failover controller's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, serde::Serialize)]
pub enum FailoverState {
    Normal,
    DetectingFailure,
    ElectingReplacement,
    SwitchingTraffic,
    RecoveryInProgress,
    FailedOver,
    Emergency,
}

/// What set a failover procedure in motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, serde::Serialize)]
pub enum FailoverTrigger {
    NodeUnresponsive,
    NetworkPartition,
    HealthCheckFailed,
    ManualFailover,
    LoadThresholdExceeded,
}

/// The injected boundary through which the controller acts on the cluster.
/// Calls are synchronous from the controller's point of view.
#[async_trait]
pub trait FailoverActionHandler: Send + Sync {
    async fn promote_to_leader(&self, node: &NodeId) -> Result<(), PeridotError>;
    async fn demote_from_leader(&self, node: &NodeId) -> Result<(), PeridotError>;
    async fn redirect_traffic(&self, from: &NodeId, to: &NodeId) -> Result<(), PeridotError>;
    async fn isolate_failed_node(&self, node: &NodeId) -> Result<(), PeridotError>;
    async fn restore_node_to_cluster(&self, node: &NodeId) -> Result<(), PeridotError>;
    async fn get_node_health(&self, node: &NodeId) -> Result<NodeHealth, PeridotError>;
}

/// One completed (or failed) failover procedure.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub trigger: FailoverTrigger,
    pub failed_node: NodeId,
    pub replacement: Option<NodeId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
}

/// A non-blocking snapshot of failover counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailoverStats {
    pub current_state: FailoverState,
    pub current_leader: Option<NodeId>,
    pub monitored_nodes: usize,
    pub failed_nodes: usize,
    pub successful_failovers: u64,
    pub failed_failovers: u64,
    pub recoveries: u64,
}

#[derive(Debug, Clone)]
struct FailedNodeRecord {
    failed_at: Instant,
    last_recovery_attempt: Option<Instant>,
}

/// The failover controller.
pub struct FailoverController {
    config: FailoverConfig,
    handler: Arc<dyn FailoverActionHandler>,
    events: Arc<EventBus>,
    state: Mutex<FailoverState>,
    /// Serializes failover procedures; `try_lock` failure means one is active.
    procedure_lock: tokio::sync::Mutex<()>,
    health: DashMap<NodeId, NodeHealth>,
    failure_counts: DashMap<NodeId, u32>,
    failed_nodes: DashMap<NodeId, FailedNodeRecord>,
    current_leader: Mutex<Option<NodeId>>,
    last_failover: Mutex<Option<Instant>>,
    history: Mutex<VecDeque<FailoverEvent>>,
    successful_failovers: AtomicU64,
    failed_failovers: AtomicU64,
    recoveries: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl FailoverController {
    pub fn new(
        config: FailoverConfig,
        handler: Arc<dyn FailoverActionHandler>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            handler,
            events,
            state: Mutex::new(FailoverState::Normal),
            procedure_lock: tokio::sync::Mutex::new(()),
            health: DashMap::new(),
            failure_counts: DashMap::new(),
            failed_nodes: DashMap::new(),
            current_leader: Mutex::new(None),
            last_failover: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY_CAP)),
            successful_failovers: AtomicU64::new(0),
            failed_failovers: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn register_node(&self, node_id: NodeId) {
        self.health
            .entry(node_id.clone())
            .or_insert_with(|| NodeHealth::unresponsive(node_id));
    }

    pub fn deregister_node(&self, node_id: &NodeId) {
        self.health.remove(node_id);
        self.failure_counts.remove(node_id);
        self.failed_nodes.remove(node_id);
    }

    pub fn set_current_leader(&self, leader: Option<NodeId>) {
        *self.current_leader.lock() = leader;
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.current_leader.lock().clone()
    }

    pub fn current_state(&self) -> FailoverState {
        *self.state.lock()
    }

    pub fn node_health(&self, node_id: &NodeId) -> Option<NodeHealth> {
        self.health.get(node_id).map(|entry| entry.value().clone())
    }

    /// Installs a health reading directly, bypassing the action handler.
    /// Used by embedders that aggregate health elsewhere.
    pub fn report_health(&self, health: NodeHealth) {
        self.health.insert(health.node_id.clone(), health);
    }

    pub fn history(&self) -> Vec<FailoverEvent> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> FailoverStats {
        FailoverStats {
            current_state: self.current_state(),
            current_leader: self.current_leader(),
            monitored_nodes: self.health.len(),
            failed_nodes: self.failed_nodes.len(),
            successful_failovers: self.successful_failovers.load(Ordering::Relaxed),
            failed_failovers: self.failed_failovers.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Failover controller starting");
        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(self.clone().run_health_loop()));
        handles.push(tokio::spawn(self.clone().run_recovery_loop()));
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
        info!("Failover controller stopped");
    }

    async fn run_health_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.refresh_health().await;
                }
            }
        }
    }

    async fn run_recovery_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.recovery_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.attempt_recoveries().await;
                }
            }
        }
    }

    /// Refreshes every registered node's health via the action handler and
    /// fires an automatic failover when one crosses the failure threshold.
    async fn refresh_health(&self) {
        let nodes: Vec<NodeId> = self.health.iter().map(|e| e.key().clone()).collect();
        let mut to_fail: Vec<(NodeId, FailoverTrigger)> = Vec::new();

        for node_id in nodes {
            if self.failed_nodes.contains_key(&node_id) {
                continue;
            }
            let reading = self.handler.get_node_health(&node_id).await;
            match reading {
                Ok(health) => {
                    let critical = health.is_critical(&self.config.thresholds);
                    let responsive = health.responsive;
                    self.health.insert(node_id.clone(), health);
                    if critical {
                        let count = {
                            let mut entry = self.failure_counts.entry(node_id.clone()).or_insert(0);
                            *entry += 1;
                            *entry
                        };
                        if count >= self.config.max_consecutive_failures {
                            let trigger = if responsive {
                                FailoverTrigger::HealthCheckFailed
                            } else {
                                FailoverTrigger::NodeUnresponsive
                            };
                            to_fail.push((node_id, trigger));
                        }
                    } else {
                        self.failure_counts.insert(node_id, 0);
                    }
                }
                Err(e) => {
                    debug!("Health check for {} failed: {}", node_id, e);
                    let count = {
                        let mut entry = self.failure_counts.entry(node_id.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    if count >= self.config.max_consecutive_failures {
                        to_fail.push((node_id, FailoverTrigger::NodeUnresponsive));
                    }
                }
            }
        }

        for (node_id, trigger) in to_fail {
            let _ = self.trigger_failover(&node_id, trigger).await;
        }
    }

    /// Periodically retries restoring known-failed nodes, throttled to one
    /// attempt per node per five minutes.
    async fn attempt_recoveries(&self) {
        let candidates: Vec<NodeId> = self
            .failed_nodes
            .iter()
            .filter(|entry| {
                entry
                    .last_recovery_attempt
                    .is_none_or(|at| at.elapsed() >= RECOVERY_THROTTLE)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for node_id in candidates {
            if let Some(mut record) = self.failed_nodes.get_mut(&node_id) {
                record.last_recovery_attempt = Some(Instant::now());
            }
            {
                let mut state = self.state.lock();
                if *state == FailoverState::Normal {
                    *state = FailoverState::RecoveryInProgress;
                }
            }
            let result = self.handler.restore_node_to_cluster(&node_id).await;
            {
                let mut state = self.state.lock();
                if *state == FailoverState::RecoveryInProgress {
                    *state = FailoverState::Normal;
                }
            }
            match result {
                Ok(()) => {
                    info!("Node {} restored to the cluster", node_id);
                    self.failed_nodes.remove(&node_id);
                    self.failure_counts.insert(node_id.clone(), 0);
                    if let Some(mut health) = self.health.get_mut(&node_id) {
                        health.responsive = true;
                        health.available = true;
                    }
                    self.recoveries.fetch_add(1, Ordering::Relaxed);
                    metrics::NODE_RECOVERIES_TOTAL.inc();
                }
                Err(e) => {
                    debug!("Recovery attempt for {} failed: {}", node_id, e);
                }
            }
        }
    }

    /// Scores every live candidate and picks the fittest; ties break on the
    /// lexicographically smaller node id.
    fn select_replacement(&self, failed_node: &NodeId) -> Option<NodeId> {
        self.health
            .iter()
            .filter(|entry| {
                entry.key() != failed_node
                    && entry.responsive
                    && entry.available
                    && !self.failed_nodes.contains_key(entry.key())
            })
            .map(|entry| (entry.key().clone(), entry.replacement_score()))
            .max_by(|(id_a, score_a), (id_b, score_b)| {
                score_a
                    .partial_cmp(score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| id_b.cmp(id_a))
            })
            .map(|(id, _)| id)
    }

    /// Runs the failover procedure for `failed_node`. A second trigger while
    /// a procedure is active is ignored, as is any trigger inside the
    /// cooldown window.
    pub async fn trigger_failover(
        &self,
        failed_node: &NodeId,
        trigger: FailoverTrigger,
    ) -> Result<NodeId, PeridotError> {
        let Ok(_guard) = self.procedure_lock.try_lock() else {
            debug!(
                "Ignoring {} trigger for {}: a failover procedure is already active",
                trigger, failed_node
            );
            return Err(PeridotError::InvalidState(
                "failover already in progress".into(),
            ));
        };

        if let Some(last) = *self.last_failover.lock() {
            if last.elapsed() < self.config.failover_cooldown {
                debug!(
                    "Ignoring {} trigger for {}: inside the failover cooldown",
                    trigger, failed_node
                );
                return Err(PeridotError::InvalidState("failover cooldown".into()));
            }
        }

        info!("Failover procedure starting for {} ({})", failed_node, trigger);
        self.events.publish(ClusterEvent::FailoverStarted {
            failed_node: failed_node.clone(),
            trigger,
        });

        let event_id = Uuid::new_v4();
        let started_at = Utc::now();

        // Step 1: record the failure.
        *self.state.lock() = FailoverState::DetectingFailure;
        self.failed_nodes.insert(
            failed_node.clone(),
            FailedNodeRecord {
                failed_at: Instant::now(),
                last_recovery_attempt: None,
            },
        );
        if let Some(mut health) = self.health.get_mut(failed_node) {
            health.responsive = false;
            health.available = false;
        }

        // Step 2: isolate the failed node.
        if let Err(e) = self.handler.isolate_failed_node(failed_node).await {
            warn!("Failed to isolate {}: {}", failed_node, e);
        }

        // Step 3: elect a replacement.
        *self.state.lock() = FailoverState::ElectingReplacement;
        let Some(replacement) = self.select_replacement(failed_node) else {
            warn!("No replacement candidate available for {}", failed_node);
            *self.state.lock() = FailoverState::Emergency;
            self.record_event(FailoverEvent {
                id: event_id,
                trigger,
                failed_node: failed_node.clone(),
                replacement: None,
                started_at,
                completed_at: Some(Utc::now()),
                success: false,
            });
            self.failed_failovers.fetch_add(1, Ordering::Relaxed);
            metrics::FAILOVERS_TOTAL.with_label_values(&["failed"]).inc();
            self.events.publish(ClusterEvent::FailoverFailed {
                failed_node: failed_node.clone(),
            });
            return Err(PeridotError::NoCandidate);
        };

        // Step 4: switch traffic, swapping leadership if needed.
        *self.state.lock() = FailoverState::SwitchingTraffic;
        let was_leader = self.current_leader() == Some(failed_node.clone());
        let mut switch_ok = true;
        if was_leader {
            if let Err(e) = self.handler.demote_from_leader(failed_node).await {
                warn!("Failed to demote {}: {}", failed_node, e);
            }
            if let Err(e) = self.handler.promote_to_leader(&replacement).await {
                warn!("Failed to promote {}: {}", replacement, e);
                switch_ok = false;
            } else {
                self.set_current_leader(Some(replacement.clone()));
            }
        }
        if switch_ok {
            if let Err(e) = self.handler.redirect_traffic(failed_node, &replacement).await {
                warn!(
                    "Failed to redirect traffic from {} to {}: {}",
                    failed_node, replacement, e
                );
                switch_ok = false;
            }
        }

        if !switch_ok {
            *self.state.lock() = FailoverState::Normal;
            self.record_event(FailoverEvent {
                id: event_id,
                trigger,
                failed_node: failed_node.clone(),
                replacement: Some(replacement.clone()),
                started_at,
                completed_at: Some(Utc::now()),
                success: false,
            });
            self.failed_failovers.fetch_add(1, Ordering::Relaxed);
            metrics::FAILOVERS_TOTAL.with_label_values(&["failed"]).inc();
            self.events.publish(ClusterEvent::FailoverFailed {
                failed_node: failed_node.clone(),
            });
            return Err(PeridotError::Transport("traffic switch failed".into()));
        }

        // Step 5: done.
        *self.state.lock() = FailoverState::FailedOver;
        *self.last_failover.lock() = Some(Instant::now());
        self.record_event(FailoverEvent {
            id: event_id,
            trigger,
            failed_node: failed_node.clone(),
            replacement: Some(replacement.clone()),
            started_at,
            completed_at: Some(Utc::now()),
            success: true,
        });
        self.successful_failovers.fetch_add(1, Ordering::Relaxed);
        metrics::FAILOVERS_TOTAL.with_label_values(&["ok"]).inc();
        self.events.publish(ClusterEvent::FailoverCompleted {
            failed_node: failed_node.clone(),
            replacement: replacement.clone(),
        });
        info!(
            "Failover completed: {} replaced by {}",
            failed_node, replacement
        );

        // Step 6: settle back to Normal.
        time::sleep(self.config.settle_delay).await;
        *self.state.lock() = FailoverState::Normal;
        Ok(replacement)
    }

    fn record_event(&self, event: FailoverEvent) {
        let mut history = self.history.lock();
        if history.len() >= EVENT_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Time since a node entered the failed set, if it is in it.
    pub fn failed_since(&self, node_id: &NodeId) -> Option<Duration> {
        self.failed_nodes
            .get(node_id)
            .map(|record| record.failed_at.elapsed())
    }
}
