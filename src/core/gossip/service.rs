// src/core/gossip/service.rs

//! The gossip background service: periodic push, pull, trim, and ping tasks
//! over a shared CRDS table, plus the receive-side protocol handlers.

use crate::config::GossipConfig;
use crate::core::events::{ClusterEvent, EventBus};
use crate::core::gossip::active_set::PushActiveSet;
use crate::core::gossip::contact_info::{ContactInfo, SocketTag};
use crate::core::gossip::crds::{Crds, CrdsRoute};
use crate::core::gossip::crds_value::{CrdsData, CrdsValue};
use crate::core::gossip::dup_shred::DuplicateShredDetector;
use crate::core::gossip::filter::CrdsFilter;
use crate::core::gossip::protocol::{
    MAX_GOSSIP_PAYLOAD, Protocol, SignedGossipMessage, split_values_by_budget,
};
use crate::core::gossip::received_cache::ReceivedCache;
use crate::core::gossip::weighted_shuffle::weighted_shuffle;
use crate::core::metrics;
use crate::core::{NodeId, PeridotError, now_ms};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Maximum values drained per push tick.
const PUSH_BATCH_LIMIT: usize = 4096;
/// Maximum values returned for one pull request across all chunks.
const PULL_RESPONSE_LIMIT: usize = 1024;
/// Size of the receive buffer for gossip datagrams.
const UDP_BUFFER_SIZE: usize = 65535;

/// Where outgoing gossip frames go. The production implementation writes to a
/// UDP socket; tests swap in an in-memory sink.
#[async_trait]
pub trait GossipSink: Send + Sync {
    async fn send_to(&self, addr: &str, frame: Vec<u8>) -> Result<(), PeridotError>;
}

/// The UDP-backed sink used by a running node.
pub struct UdpGossipSink {
    socket: Arc<UdpSocket>,
}

impl UdpGossipSink {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl GossipSink for UdpGossipSink {
    async fn send_to(&self, addr: &str, frame: Vec<u8>) -> Result<(), PeridotError> {
        self.socket
            .send_to(&frame, addr)
            .await
            .map_err(|e| PeridotError::Transport(format!("send to {addr}: {e}")))?;
        Ok(())
    }
}

/// Notifications surfaced to the embedder as values land in the table.
#[derive(Debug, Clone)]
pub enum GossipNotification {
    ContactInfo(ContactInfo),
    Vote { origin: NodeId, slot: u64 },
}

/// A non-blocking snapshot of gossip counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GossipMetrics {
    pub num_nodes: usize,
    pub table_size: usize,
    pub active_set_size: usize,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub dedup_hits: u64,
    pub insert_fails: u64,
    pub bad_signatures: u64,
    pub prunes_sent: u64,
}

#[derive(Debug, Default)]
struct GossipServiceStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    prunes_sent: AtomicU64,
}

/// The gossip plane of one node.
pub struct GossipService {
    node_id: NodeId,
    secret: Option<String>,
    config: GossipConfig,
    crds: Arc<Crds>,
    active_set: Arc<PushActiveSet>,
    received: ReceivedCache,
    dup_shreds: DuplicateShredDetector,
    sink: Arc<dyn GossipSink>,
    events: Arc<EventBus>,
    stakes: RwLock<HashMap<NodeId, u64>>,
    /// Our own signed contact-info record, refreshed on every trim tick.
    self_contact: RwLock<CrdsValue>,
    last_pushed_ordinal: AtomicU64,
    pending_pings: Mutex<HashMap<u64, (NodeId, Instant)>>,
    peer_rtt_ms: DashMap<NodeId, u64>,
    /// relayer -> origins whose values that relayer delivered redundantly.
    duplicate_pushes: DashMap<NodeId, HashSet<NodeId>>,
    notifications: broadcast::Sender<GossipNotification>,
    stats: GossipServiceStats,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl GossipService {
    pub fn new(
        node_id: NodeId,
        gossip_addr: String,
        secret: Option<String>,
        config: GossipConfig,
        sink: Arc<dyn GossipSink>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let crds = Arc::new(Crds::new(
            node_id.clone(),
            secret.clone(),
            config.num_shards,
        ));
        let contact = ContactInfo::new(node_id.clone(), now_ms(), now_ms())
            .with_socket(SocketTag::Gossip, gossip_addr);
        let self_contact = CrdsValue::new_signed(CrdsData::ContactInfo(contact), &secret);
        let _ = crds.insert(self_contact.clone(), now_ms(), CrdsRoute::LocalMessage);

        let (notifications, _) = broadcast::channel(4096);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            active_set: Arc::new(PushActiveSet::new(config.fanout)),
            received: ReceivedCache::new(config.received_cache_capacity),
            dup_shreds: DuplicateShredDetector::new(),
            crds,
            node_id,
            secret,
            config,
            sink,
            events,
            stakes: RwLock::new(HashMap::new()),
            self_contact: RwLock::new(self_contact),
            last_pushed_ordinal: AtomicU64::new(0),
            pending_pings: Mutex::new(HashMap::new()),
            peer_rtt_ms: DashMap::new(),
            duplicate_pushes: DashMap::new(),
            notifications,
            stats: GossipServiceStats::default(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn crds(&self) -> &Arc<Crds> {
        &self.crds
    }

    pub fn active_set(&self) -> &Arc<PushActiveSet> {
        &self.active_set
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GossipNotification> {
        self.notifications.subscribe()
    }

    /// Installs stake weights used for push/pull peer selection.
    pub fn set_stakes(&self, stakes: HashMap<NodeId, u64>) {
        *self.stakes.write() = stakes;
    }

    /// Records a shred sighting from the embedder's shred-ingest path and
    /// publishes evidence when two payloads conflict.
    pub fn report_shred(&self, origin: &NodeId, slot: u64, index: u32, payload: &[u8]) {
        if let Some(evidence) = self.dup_shreds.observe(origin, slot, index, payload) {
            warn!(
                "Duplicate shred detected at slot {} index {} from {}",
                slot, index, evidence.origin
            );
            self.events.publish(ClusterEvent::DuplicateShred {
                origin: evidence.origin,
                slot,
                index,
            });
        }
    }

    /// Inserts a locally-originated value and lets the push loop pick it up.
    pub fn push_local(&self, data: CrdsData) -> Result<(), PeridotError> {
        let value = CrdsValue::new_signed(data, &self.secret);
        self.received.record(value.hash());
        self.crds
            .insert(value, now_ms(), CrdsRoute::LocalMessage)
            .map(|_| ())
    }

    pub fn gossip_metrics(&self) -> GossipMetrics {
        GossipMetrics {
            num_nodes: self.crds.num_nodes(),
            table_size: self.crds.len(),
            active_set_size: self.active_set.len(),
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            dedup_hits: self.received.hits(),
            insert_fails: self.crds.stats.fails.load(Ordering::Relaxed),
            bad_signatures: self.crds.stats.bad_signatures.load(Ordering::Relaxed),
            prunes_sent: self.stats.prunes_sent.load(Ordering::Relaxed),
        }
    }

    pub fn peer_rtt_ms(&self, peer: &NodeId) -> Option<u64> {
        self.peer_rtt_ms.get(peer).map(|entry| *entry.value())
    }

    /// Spawns the periodic gossip tasks. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Gossip service starting for node {}", self.node_id);

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(self.clone().run_push_loop()));
        handles.push(tokio::spawn(self.clone().run_pull_loop()));
        handles.push(tokio::spawn(self.clone().run_trim_loop()));
        handles.push(tokio::spawn(self.clone().run_ping_loop()));

        // Bootstrap: ask each configured entrypoint for its view of the cluster.
        let service = self.clone();
        handles.push(tokio::spawn(async move {
            for entrypoint in service.config.entrypoints.clone() {
                service.send_pull_request_to_addr(&entrypoint).await;
            }
        }));
    }

    /// Spawns the UDP receive loop feeding `handle_frame`.
    pub fn spawn_udp_receiver(self: &Arc<Self>, socket: Arc<UdpSocket>) {
        let service = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.handles.lock().push(tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Gossip receiver shutting down.");
                        return;
                    }
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src)) => {
                                service.handle_frame(&buf[..len]).await;
                                debug!("Processed gossip datagram from {}", src);
                            }
                            Err(e) => {
                                service.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                                warn!("Error receiving from gossip socket: {}", e);
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Signals the loops to stop and waits for them.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Gossip service stopped for node {}", self.node_id);
    }

    async fn run_push_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.push_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    if self.active_set.needs_rotation(self.config.rotation_interval) {
                        self.rotate_active_set();
                    }
                    self.push_new_values().await;
                }
            }
        }
    }

    async fn run_pull_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.pull_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => self.send_pull_requests().await,
            }
        }
    }

    async fn run_trim_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.trim_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    let removed = self
                        .crds
                        .trim(now_ms(), self.config.entry_timeout.as_millis() as u64);
                    if removed > 0 {
                        debug!("Trimmed {} stale CRDS entries", removed);
                    }
                    self.refresh_self_contact();
                    self.dup_shreds.purge_stale();
                }
            }
        }
    }

    async fn run_ping_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.ping_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => self.send_pings().await,
            }
        }
    }

    /// Re-signs our contact info with a fresh wallclock so it survives trims
    /// on every peer.
    fn refresh_self_contact(&self) {
        let refreshed = {
            let current = self.self_contact.read();
            let CrdsData::ContactInfo(info) = &current.data else {
                return;
            };
            let mut info = info.clone();
            info.wallclock_ms = now_ms();
            CrdsValue::new_signed(CrdsData::ContactInfo(info), &self.secret)
        };
        let _ = self
            .crds
            .insert(refreshed.clone(), now_ms(), CrdsRoute::LocalMessage);
        *self.self_contact.write() = refreshed;
    }

    fn rotate_active_set(&self) {
        let stakes = self.stakes.read();
        let pool: Vec<(NodeId, u64)> = self
            .crds
            .get_contact_infos()
            .into_iter()
            .filter(|info| info.origin != self.node_id)
            .map(|info| {
                let stake = stakes.get(&info.origin).copied().unwrap_or(1);
                (info.origin, stake)
            })
            .collect();
        drop(stakes);
        if pool.is_empty() {
            return;
        }
        self.active_set.rotate(&pool, rand::random());
        debug!(
            "Rotated push active set to {} peers",
            self.active_set.len()
        );
    }

    async fn push_new_values(&self) {
        let after = self.last_pushed_ordinal.load(Ordering::Relaxed);
        let entries = self.crds.get_entries_after(after, PUSH_BATCH_LIMIT);
        if entries.is_empty() {
            return;
        }
        let max_ordinal = entries.iter().map(|e| e.ordinal).max().unwrap_or(after);
        let values: Vec<CrdsValue> = entries.into_iter().map(|e| e.value).collect();
        let peers = self.active_set.push_peers();
        if peers.is_empty() {
            // Nothing to send to; leave the ordinal so a later rotation
            // still pushes these entries.
            return;
        }

        for chunk in split_values_by_budget(values, MAX_GOSSIP_PAYLOAD) {
            let message = Protocol::PushMessage {
                from: self.node_id.clone(),
                values: chunk,
            };
            for peer in &peers {
                self.send_to_peer(peer, message.clone()).await;
            }
        }
        self.last_pushed_ordinal
            .fetch_max(max_ordinal, Ordering::Relaxed);
    }

    async fn send_pull_requests(&self) {
        let infos: Vec<ContactInfo> = self
            .crds
            .get_contact_infos()
            .into_iter()
            .filter(|info| info.origin != self.node_id)
            .collect();
        if infos.is_empty() {
            return;
        }
        let weights: Vec<u64> = {
            let stakes = self.stakes.read();
            infos
                .iter()
                .map(|info| stakes.get(&info.origin).copied().unwrap_or(1))
                .collect()
        };

        let order = weighted_shuffle(&weights, rand::random());
        let filter = CrdsFilter::from_hashes(&self.crds.hashes());
        let caller = self.self_contact.read().clone();

        for idx in order.into_iter().take(self.config.pull_peers) {
            let info = &infos[idx];
            let Some(addr) = info.gossip_addr() else {
                continue;
            };
            let message = Protocol::PullRequest {
                from: self.node_id.clone(),
                filter: filter.clone(),
                caller: caller.clone(),
            };
            self.send_to_addr(addr, message).await;
        }
    }

    async fn send_pull_request_to_addr(&self, addr: &str) {
        let filter = CrdsFilter::from_hashes(&self.crds.hashes());
        let caller = self.self_contact.read().clone();
        let message = Protocol::PullRequest {
            from: self.node_id.clone(),
            filter,
            caller,
        };
        self.send_to_addr(addr, message).await;
    }

    async fn send_pings(&self) {
        let mut peers: Vec<ContactInfo> = self
            .crds
            .get_contact_infos()
            .into_iter()
            .filter(|info| info.origin != self.node_id)
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.config.ping_peers);

        for info in peers {
            let token: u64 = rand::random();
            self.pending_pings
                .lock()
                .insert(token, (info.origin.clone(), Instant::now()));
            self.send_to_peer(
                &info.origin,
                Protocol::Ping {
                    from: self.node_id.clone(),
                    token,
                },
            )
            .await;
        }
    }

    async fn send_to_peer(&self, peer: &NodeId, message: Protocol) {
        let Some(addr) = self
            .crds
            .get_contact_info(peer)
            .and_then(|info| info.gossip_addr().map(str::to_string))
        else {
            debug!("No gossip address known for peer {}", peer);
            return;
        };
        self.send_to_addr(&addr, message).await;
    }

    async fn send_to_addr(&self, addr: &str, message: Protocol) {
        let kind = message.kind();
        let Ok(signed) = SignedGossipMessage::new(message, &self.secret) else {
            warn!("Failed to sign outgoing gossip message");
            return;
        };
        let Ok(frame) = bincode::encode_to_vec(&signed, bincode::config::standard()) else {
            warn!("Failed to encode outgoing gossip message");
            return;
        };
        match self.sink.send_to(addr, frame).await {
            Ok(()) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                metrics::GOSSIP_PACKETS_SENT_TOTAL
                    .with_label_values(&[kind])
                    .inc();
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Gossip send to {} failed: {}", addr, e);
            }
        }
    }

    /// Decodes, verifies, and dispatches one received datagram.
    pub async fn handle_frame(&self, frame: &[u8]) {
        let decoded = bincode::decode_from_slice::<SignedGossipMessage, _>(
            frame,
            bincode::config::standard(),
        );
        let (signed, _) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Failed to deserialize gossip datagram: {}", e);
                return;
            }
        };
        match signed.verify(&self.secret) {
            Ok(true) => {}
            Ok(false) => {
                metrics::GOSSIP_BAD_SIGNATURES_TOTAL.inc();
                warn!("Dropping gossip message with invalid signature");
                return;
            }
            Err(e) => {
                warn!("Error verifying gossip message signature: {}", e);
                return;
            }
        }
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        metrics::GOSSIP_PACKETS_RECEIVED_TOTAL
            .with_label_values(&[signed.message.kind()])
            .inc();
        self.handle_message(signed.message).await;
    }

    pub async fn handle_message(&self, message: Protocol) {
        match message {
            Protocol::PushMessage { from, values } => {
                self.handle_push(from, values).await;
            }
            Protocol::PullRequest {
                from,
                filter,
                caller,
            } => {
                self.handle_pull_request(from, filter, caller).await;
            }
            Protocol::PullResponse { values, .. } => {
                for value in values {
                    self.received.record(value.hash());
                    self.insert_received(value, CrdsRoute::PullResponse);
                }
            }
            Protocol::PruneMessage {
                from,
                prunes,
                destination,
                ..
            } => {
                if destination != self.node_id {
                    debug!("Ignoring prune message destined for {}", destination);
                    return;
                }
                for pruned in &prunes {
                    self.active_set.prune(pruned);
                }
                debug!("Applied prune of {} peers from {}", prunes.len(), from);
            }
            Protocol::Ping { from, token } => {
                self.send_to_peer(
                    &from,
                    Protocol::Pong {
                        from: self.node_id.clone(),
                        token,
                    },
                )
                .await;
            }
            Protocol::Pong { from, token } => {
                let pending = self.pending_pings.lock().remove(&token);
                match pending {
                    Some((peer, sent_at)) if peer == from => {
                        let rtt = sent_at.elapsed().as_millis() as u64;
                        self.peer_rtt_ms.insert(from, rtt);
                    }
                    _ => debug!("Pong with unknown or mismatched token from {}", from),
                }
            }
        }
    }

    async fn handle_push(&self, relayer: NodeId, values: Vec<CrdsValue>) {
        let mut duplicate_origins: Vec<NodeId> = Vec::new();
        for value in values {
            let origin = value.origin().clone();
            if !self.received.record(value.hash()) {
                duplicate_origins.push(origin);
                continue;
            }
            if self.insert_received(value, CrdsRoute::PushMessage).is_err() {
                duplicate_origins.push(origin);
            }
        }

        if duplicate_origins.is_empty() {
            return;
        }
        let should_prune = {
            let mut entry = self
                .duplicate_pushes
                .entry(relayer.clone())
                .or_default();
            entry.extend(duplicate_origins);
            entry.len() >= self.config.prune_threshold
        };
        if should_prune {
            let origins: Vec<NodeId> = self
                .duplicate_pushes
                .remove(&relayer)
                .map(|(_, set)| set.into_iter().collect())
                .unwrap_or_default();
            self.stats.prunes_sent.fetch_add(1, Ordering::Relaxed);
            let message = Protocol::PruneMessage {
                from: self.node_id.clone(),
                prunes: origins,
                destination: relayer.clone(),
                wallclock_ms: now_ms(),
            };
            self.send_to_peer(&relayer, message).await;
        }
    }

    async fn handle_pull_request(&self, from: NodeId, filter: CrdsFilter, caller: CrdsValue) {
        // Learn the caller's contact info so we can answer and gossip to it.
        let respond_addr = match &caller.data {
            CrdsData::ContactInfo(info) => info.gossip_addr().map(str::to_string),
            _ => None,
        };
        self.insert_received(caller, CrdsRoute::PullRequest).ok();

        let Some(addr) = respond_addr.or_else(|| {
            self.crds
                .get_contact_info(&from)
                .and_then(|info| info.gossip_addr().map(str::to_string))
        }) else {
            debug!("Cannot answer pull request from {}: no address", from);
            return;
        };

        let missing = self.crds.filter_missing(&filter, PULL_RESPONSE_LIMIT);
        if missing.is_empty() {
            return;
        }
        for chunk in split_values_by_budget(missing, MAX_GOSSIP_PAYLOAD) {
            let message = Protocol::PullResponse {
                from: self.node_id.clone(),
                values: chunk,
            };
            self.send_to_addr(&addr, message).await;
        }
    }

    fn insert_received(&self, value: CrdsValue, route: CrdsRoute) -> Result<(), PeridotError> {
        let data = value.data.clone();
        self.crds.insert(value, now_ms(), route)?;
        match data {
            CrdsData::ContactInfo(info) => {
                let _ = self
                    .notifications
                    .send(GossipNotification::ContactInfo(info));
            }
            CrdsData::Vote { origin, slot, .. } => {
                let _ = self
                    .notifications
                    .send(GossipNotification::Vote { origin, slot });
            }
            _ => {}
        }
        Ok(())
    }
}
