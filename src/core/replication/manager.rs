// src/core/replication/manager.rs

//! The replication manager: drains pending entries into batches, ships them
//! to every active target, and keeps targets honest with heartbeats and
//! resync requests.

use crate::config::ReplicationSettings;
use crate::core::events::{ClusterEvent, EventBus};
use crate::core::metrics;
use crate::core::replication::{
    ReplicationBatch, ReplicationDataProvider, ReplicationEntry, ReplicationStrategy,
    ReplicationTarget, ReplicationTransport,
};
use crate::core::{NodeId, PeridotError, now_ms};
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Smoothing factor for the batch-latency moving average, in percent.
const LATENCY_SMOOTHING_PCT: u64 = 20;

/// A non-blocking snapshot of replication counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplicationStats {
    pub strategy: ReplicationStrategy,
    pub active_targets: usize,
    pub total_targets: usize,
    pub pending_entries: usize,
    pub next_index: u64,
    pub batches_sent: u64,
    pub failed_batches: u64,
    pub bytes_replicated: u64,
    pub avg_batch_latency_ms: u64,
}

/// The replication manager.
pub struct ReplicationManager {
    config: ReplicationSettings,
    strategy: RwLock<ReplicationStrategy>,
    pending: Mutex<VecDeque<ReplicationEntry>>,
    next_index: AtomicU64,
    targets: DashMap<NodeId, ReplicationTarget>,
    transport: Arc<dyn ReplicationTransport>,
    provider: RwLock<Option<Arc<dyn ReplicationDataProvider>>>,
    events: Arc<EventBus>,
    batches_sent: AtomicU64,
    failed_batches: AtomicU64,
    bytes_replicated: AtomicU64,
    avg_batch_latency_ms: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ReplicationManager {
    pub fn new(
        config: ReplicationSettings,
        transport: Arc<dyn ReplicationTransport>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            strategy: RwLock::new(config.strategy),
            config,
            pending: Mutex::new(VecDeque::new()),
            next_index: AtomicU64::new(1),
            targets: DashMap::new(),
            transport,
            provider: RwLock::new(None),
            events,
            batches_sent: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            bytes_replicated: AtomicU64::new(0),
            avg_batch_latency_ms: AtomicU64::new(0),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Registers the provider that resyncing targets pull from.
    pub fn set_data_provider(&self, provider: Arc<dyn ReplicationDataProvider>) {
        *self.provider.write() = Some(provider);
    }

    pub fn data_provider(&self) -> Option<Arc<dyn ReplicationDataProvider>> {
        self.provider.read().clone()
    }

    /// Switches the success rule at runtime.
    pub fn set_strategy(&self, strategy: ReplicationStrategy) {
        info!("Replication strategy switched to {}", strategy);
        *self.strategy.write() = strategy;
    }

    pub fn strategy(&self) -> ReplicationStrategy {
        *self.strategy.read()
    }

    pub fn add_target(&self, node_id: NodeId, address: String) {
        info!("Registered replication target {} at {}", node_id, address);
        self.targets
            .insert(node_id.clone(), ReplicationTarget::new(node_id, address));
    }

    pub fn remove_target(&self, node_id: &NodeId) -> bool {
        self.targets.remove(node_id).is_some()
    }

    /// Reactivates a deactivated target and asks it to resync from where it
    /// left off.
    pub async fn recover_target(&self, node_id: &NodeId) -> Result<(), PeridotError> {
        let target = {
            let mut entry = self
                .targets
                .get_mut(node_id)
                .ok_or_else(|| PeridotError::NodeNotFound(node_id.clone()))?;
            entry.active = true;
            entry.retry_count = 0;
            entry.clone()
        };
        self.transport
            .request_sync(&target, target.last_applied_index + 1)
            .await
    }

    /// Queues a payload for the next replication tick and returns its index.
    pub fn submit(&self, payload: Bytes) -> u64 {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let entry = ReplicationEntry::new(index, payload, now_ms());
        self.pending.lock().push_back(entry);
        index
    }

    pub fn target(&self, node_id: &NodeId) -> Option<ReplicationTarget> {
        self.targets.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            strategy: self.strategy(),
            active_targets: self.targets.iter().filter(|t| t.active).count(),
            total_targets: self.targets.len(),
            pending_entries: self.pending.lock().len(),
            next_index: self.next_index.load(Ordering::SeqCst),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            bytes_replicated: self.bytes_replicated.load(Ordering::Relaxed),
            avg_batch_latency_ms: self.avg_batch_latency_ms.load(Ordering::Relaxed),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Replication manager starting");
        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(self.clone().run_replication_loop()));
        handles.push(tokio::spawn(self.clone().run_heartbeat_loop()));
        handles.push(tokio::spawn(self.clone().run_lag_check_loop()));
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
        info!("Replication manager stopped");
    }

    async fn run_replication_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.replication_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.replicate_pending().await;
                }
            }
        }
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.heartbeat_targets().await;
                }
            }
        }
    }

    async fn run_lag_check_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.sync_check_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.resync_lagging_targets().await;
                }
            }
        }
    }

    /// Drains one batch of pending entries and ships it to every active
    /// target. The composite success rule depends on the strategy.
    pub async fn replicate_pending(&self) -> bool {
        let entries: Vec<ReplicationEntry> = {
            let mut pending = self.pending.lock();
            let count = pending.len().min(self.config.batch_size);
            pending.drain(..count).collect()
        };
        if entries.is_empty() {
            return true;
        }

        let batch = ReplicationBatch {
            batch_id: Uuid::new_v4(),
            start_index: entries.first().map(|e| e.index).unwrap_or(0),
            end_index: entries.last().map(|e| e.index).unwrap_or(0),
            entries,
        };
        let targets: Vec<ReplicationTarget> = self
            .targets
            .iter()
            .filter(|t| t.active)
            .map(|t| t.value().clone())
            .collect();
        if targets.is_empty() {
            debug!("No active replication targets; batch {} kept local", batch.batch_id);
            return true;
        }

        let started = Instant::now();
        let sends = targets.iter().map(|target| {
            let batch = &batch;
            async move { (target.node_id.clone(), self.transport.send_batch(target, batch).await) }
        });
        let results = join_all(sends).await;

        let mut acks = 0usize;
        for (node_id, result) in results {
            match result {
                Ok(acked_index) => {
                    acks += 1;
                    if let Some(mut target) = self.targets.get_mut(&node_id) {
                        target.last_applied_index = target.last_applied_index.max(acked_index);
                        target.last_heartbeat_ms = now_ms();
                        target.retry_count = 0;
                    }
                }
                Err(e) => {
                    debug!("Batch {} failed for target {}: {}", batch.batch_id, node_id, e);
                    self.record_target_failure(&node_id);
                }
            }
        }

        let latency = started.elapsed().as_millis() as u64;
        self.fold_latency(latency);
        self.bytes_replicated
            .fetch_add(batch.byte_size() as u64, Ordering::Relaxed);
        metrics::REPLICATION_BYTES_TOTAL.inc_by(batch.byte_size() as f64);

        let success = match self.strategy() {
            ReplicationStrategy::Synchronous => acks == targets.len(),
            // Asynchronous is always success once at least one send was attempted.
            ReplicationStrategy::Asynchronous => true,
            ReplicationStrategy::QuorumBased => acks >= self.config.quorum_size,
        };

        if success {
            self.batches_sent.fetch_add(1, Ordering::Relaxed);
            metrics::REPLICATION_BATCHES_TOTAL
                .with_label_values(&["ok"])
                .inc();
        } else {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
            metrics::REPLICATION_BATCHES_TOTAL
                .with_label_values(&["failed"])
                .inc();
            warn!(
                "Replication batch {} missed its success rule ({} acks / {} targets, {})",
                batch.batch_id,
                acks,
                targets.len(),
                self.strategy()
            );
        }
        success
    }

    async fn heartbeat_targets(&self) {
        let current_index = self.next_index.load(Ordering::SeqCst).saturating_sub(1);
        let targets: Vec<ReplicationTarget> = self
            .targets
            .iter()
            .filter(|t| t.active)
            .map(|t| t.value().clone())
            .collect();

        for target in targets {
            match self.transport.send_heartbeat(&target, current_index).await {
                Ok(applied) => {
                    if let Some(mut entry) = self.targets.get_mut(&target.node_id) {
                        entry.last_heartbeat_ms = now_ms();
                        entry.last_applied_index = entry.last_applied_index.max(applied);
                        entry.retry_count = 0;
                    }
                }
                Err(e) => {
                    debug!("Heartbeat to {} failed: {}", target.node_id, e);
                    self.record_target_failure(&target.node_id);
                }
            }
        }
    }

    /// Asks targets whose heartbeat lag exceeds the sync-check interval to
    /// resync from their last applied index.
    async fn resync_lagging_targets(&self) {
        let lag_threshold_ms = self.config.sync_check_interval.as_millis() as u64;
        let now = now_ms();
        let lagging: Vec<ReplicationTarget> = self
            .targets
            .iter()
            .filter(|t| {
                t.active
                    && t.last_heartbeat_ms > 0
                    && now.saturating_sub(t.last_heartbeat_ms) > lag_threshold_ms
            })
            .map(|t| t.value().clone())
            .collect();

        for target in lagging {
            info!(
                "Target {} lagging by {}ms; requesting resync from index {}",
                target.node_id,
                now.saturating_sub(target.last_heartbeat_ms),
                target.last_applied_index + 1
            );
            if let Err(e) = self
                .transport
                .request_sync(&target, target.last_applied_index + 1)
                .await
            {
                debug!("Resync request to {} failed: {}", target.node_id, e);
                self.record_target_failure(&target.node_id);
            }
        }
    }

    fn record_target_failure(&self, node_id: &NodeId) {
        let deactivated = {
            let Some(mut target) = self.targets.get_mut(node_id) else {
                return;
            };
            target.retry_count += 1;
            if target.retry_count > self.config.max_retry_count && target.active {
                target.active = false;
                true
            } else {
                false
            }
        };
        if deactivated {
            warn!(
                "Replication target {} deactivated after {} consecutive failures",
                node_id, self.config.max_retry_count
            );
            self.events.publish(ClusterEvent::ReplicationTargetFailed {
                target: node_id.clone(),
            });
        }
    }

    fn fold_latency(&self, sample_ms: u64) {
        let previous = self.avg_batch_latency_ms.load(Ordering::Relaxed);
        let folded = if previous == 0 {
            sample_ms
        } else {
            (previous * (100 - LATENCY_SMOOTHING_PCT) + sample_ms * LATENCY_SMOOTHING_PCT) / 100
        };
        self.avg_batch_latency_ms.store(folded, Ordering::Relaxed);
    }
}
