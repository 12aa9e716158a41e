// src/core/consensus/engine.rs

//! The Raft consensus engine: leader election, log replication, commit
//! advancement, and in-order apply.
//!
//! All Raft state lives behind a single mutex, so vote handling and
//! append-entries handling never interleave observably. The transport is
//! never invoked while that mutex is held.

use crate::config::ConsensusConfig;
use crate::core::consensus::log::{LogEntry, RaftLog};
use crate::core::metrics;
use crate::core::{NodeId, PeridotError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Maximum entries shipped in one append-entries request.
const MAX_APPEND_ENTRIES: usize = 256;
/// How often the election loop checks its deadline.
const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(15);
/// How often pending proposals are checked for timeout.
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct VoteResponse {
    pub term: u64,
    pub voter_id: NodeId,
    pub granted: bool,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub peer_id: NodeId,
    pub success: bool,
    pub match_index: u64,
}

/// The injected cluster communication boundary. Sends are at-most-once and
/// may be lost; payloads are never corrupted.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn send_request_vote(&self, to: &NodeId, request: RequestVote)
    -> Result<(), PeridotError>;
    async fn send_vote_response(
        &self,
        to: &NodeId,
        response: VoteResponse,
    ) -> Result<(), PeridotError>;
    async fn send_append_entries(
        &self,
        to: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<(), PeridotError>;
    async fn send_append_entries_response(
        &self,
        to: &NodeId,
        response: AppendEntriesResponse,
    ) -> Result<(), PeridotError>;
}

/// Invoked with each committed entry's index and payload, in index order,
/// exactly once per commit.
pub type StateMachineCallback = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;

#[derive(Debug)]
struct PeerReplicationState {
    next_index: u64,
    match_index: u64,
    active: bool,
}

#[derive(Debug)]
struct PendingProposal {
    payload: Vec<u8>,
    submitted: Instant,
    deadline: Instant,
    retries: u32,
    confirmations: HashSet<NodeId>,
}

struct RaftState {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<NodeId>,
    votes: HashSet<NodeId>,
    peers: HashMap<NodeId, PeerReplicationState>,
    election_deadline: Instant,
}

impl RaftState {
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Reverts to follower. The vote is only released when the term actually
    /// advances; re-voting within one term would break election safety.
    fn step_down(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.votes.clear();
    }
}

/// A non-blocking snapshot of consensus state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsensusStats {
    pub node_id: NodeId,
    pub role: String,
    pub current_term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_size: u64,
    pub leader_id: Option<NodeId>,
    pub cluster_size: usize,
    pub pending_proposals: usize,
    pub elections_started: u64,
}

/// One node's Raft engine.
pub struct ConsensusEngine {
    id: NodeId,
    config: ConsensusConfig,
    state: Mutex<RaftState>,
    transport: Arc<dyn ClusterTransport>,
    callback: RwLock<Option<StateMachineCallback>>,
    pending: Mutex<HashMap<u64, PendingProposal>>,
    apply_notify: Notify,
    elections_started: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ConsensusEngine {
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: ConsensusConfig,
        transport: Arc<dyn ClusterTransport>,
    ) -> Arc<Self> {
        let peer_map = peers
            .into_iter()
            .filter(|peer| peer != &id)
            .map(|peer| {
                (
                    peer,
                    PeerReplicationState {
                        next_index: 1,
                        match_index: 0,
                        active: true,
                    },
                )
            })
            .collect();
        let election_deadline = Instant::now() + config.random_election_timeout();
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            id,
            config,
            state: Mutex::new(RaftState {
                role: RaftRole::Follower,
                current_term: 0,
                voted_for: None,
                log: RaftLog::new(),
                commit_index: 0,
                last_applied: 0,
                leader_id: None,
                votes: HashSet::new(),
                peers: peer_map,
                election_deadline,
            }),
            transport,
            callback: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            apply_notify: Notify::new(),
            elections_started: AtomicU64::new(0),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.id
    }

    /// Registers the embedder's state-machine callback.
    pub fn set_state_machine_callback(&self, callback: StateMachineCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    pub fn get_leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader_id.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    pub fn stats(&self) -> ConsensusStats {
        let state = self.state.lock();
        ConsensusStats {
            node_id: self.id.clone(),
            role: state.role.to_string(),
            current_term: state.current_term,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_size: state.log.len(),
            leader_id: state.leader_id.clone(),
            cluster_size: state.cluster_size(),
            pending_proposals: self.pending.lock().len(),
            elections_started: self.elections_started.load(Ordering::Relaxed),
        }
    }

    /// Proposes a payload for replication. Succeeds only on the leader;
    /// returns the log index the entry was appended at.
    pub async fn propose(&self, payload: Vec<u8>) -> Result<u64, PeridotError> {
        let (index, single_node) = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader {
                return Err(PeridotError::NotLeader(state.leader_id.clone()));
            }
            let current_term = state.current_term;
            let index = state.log.append(current_term, payload.clone());
            let single_node = state.peers.is_empty();
            if single_node {
                // A cluster of one commits on append.
                state.commit_index = index;
                state.log.mark_committed(index);
            }
            (index, single_node)
        };

        self.pending.lock().insert(
            index,
            PendingProposal {
                payload,
                submitted: Instant::now(),
                deadline: Instant::now() + self.config.proposal_timeout,
                retries: 0,
                confirmations: HashSet::new(),
            },
        );

        if single_node {
            self.apply_notify.notify_one();
        } else {
            self.broadcast_append_entries().await;
        }
        Ok(index)
    }

    /// Spawns the election, heartbeat, apply, and proposal-retry loops.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Consensus engine starting for node {}", self.id);
        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(self.clone().run_election_loop()));
        handles.push(tokio::spawn(self.clone().run_heartbeat_loop()));
        handles.push(tokio::spawn(self.clone().run_apply_loop()));
        handles.push(tokio::spawn(self.clone().run_pending_loop()));
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
        info!("Consensus engine stopped for node {}", self.id);
    }

    async fn run_election_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(ELECTION_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    let expired = {
                        let state = self.state.lock();
                        state.role != RaftRole::Leader && Instant::now() >= state.election_deadline
                    };
                    if expired {
                        self.start_election().await;
                    }
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
                    if self.is_leader() {
                        self.broadcast_append_entries().await;
                    }
                }
            }
        }
    }

    async fn run_apply_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = self.apply_notify.notified() => {}
                _ = time::sleep(Duration::from_millis(20)) => {}
            }
            self.apply_committed();
        }
    }

    async fn run_pending_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(PENDING_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    if self.retry_pending_proposals() {
                        self.broadcast_append_entries().await;
                    }
                }
            }
        }
    }

    /// Applies entries in `(last_applied, commit_index]` in index order.
    fn apply_committed(&self) {
        let to_apply: Vec<LogEntry> = {
            let mut state = self.state.lock();
            let from = state.last_applied + 1;
            let to = state.commit_index;
            if from > to {
                return;
            }
            let entries: Vec<LogEntry> = (from..=to)
                .filter_map(|index| state.log.get(index).cloned())
                .collect();
            state.last_applied = to;
            entries
        };

        let callback = self.callback.read().clone();
        let mut confirmed = Vec::new();
        for entry in &to_apply {
            metrics::CONSENSUS_COMMITTED_TOTAL.inc();
            if let Some(callback) = &callback {
                callback(entry.index, &entry.payload);
            }
            confirmed.push(entry.index);
        }

        let mut pending = self.pending.lock();
        for index in confirmed {
            pending.remove(&index);
        }
    }

    /// Retries or drops timed-out proposals. Returns true when a retry wants
    /// an immediate replication round.
    fn retry_pending_proposals(&self) -> bool {
        let commit_index = self.state.lock().commit_index;
        let mut wants_broadcast = false;
        let mut pending = self.pending.lock();
        pending.retain(|index, proposal| {
            if *index <= commit_index {
                return false;
            }
            if Instant::now() < proposal.deadline {
                return true;
            }
            proposal.retries += 1;
            if proposal.retries > self.config.max_proposal_retries {
                warn!(
                    "Dropping proposal at index {} after {} retries ({} bytes, submitted {:?} ago)",
                    index,
                    proposal.retries - 1,
                    proposal.payload.len(),
                    proposal.submitted.elapsed(),
                );
                metrics::CONSENSUS_DROPPED_PROPOSALS_TOTAL.inc();
                return false;
            }
            let backoff = self.config.proposal_timeout * 2u32.pow(proposal.retries.min(8));
            proposal.deadline = Instant::now() + backoff;
            wants_broadcast = true;
            true
        });
        wants_broadcast
    }

    async fn start_election(&self) {
        let (request, peers) = {
            let mut state = self.state.lock();
            state.current_term += 1;
            state.role = RaftRole::Candidate;
            state.voted_for = Some(self.id.clone());
            state.leader_id = None;
            state.votes.clear();
            state.votes.insert(self.id.clone());
            state.election_deadline = Instant::now() + self.config.random_election_timeout();
            metrics::CONSENSUS_TERM.set(state.current_term as f64);

            if state.votes.len() >= state.majority() {
                // A cluster of one elects itself.
                self.become_leader(&mut state);
                return;
            }

            let request = RequestVote {
                term: state.current_term,
                candidate_id: self.id.clone(),
                last_log_index: state.log.last_index(),
                last_log_term: state.log.last_term(),
            };
            let peers: Vec<NodeId> = state.peers.keys().cloned().collect();
            (request, peers)
        };
        self.elections_started.fetch_add(1, Ordering::Relaxed);
        metrics::CONSENSUS_ELECTIONS_TOTAL.inc();
        debug!(
            "Node {} starting election for term {}",
            self.id, request.term
        );

        for peer in peers {
            if let Err(e) = self
                .transport
                .send_request_vote(&peer, request.clone())
                .await
            {
                debug!("Failed to send vote request to {}: {}", peer, e);
            }
        }
    }

    fn become_leader(&self, state: &mut RaftState) {
        state.role = RaftRole::Leader;
        state.leader_id = Some(self.id.clone());
        let next = state.log.last_index() + 1;
        for peer in state.peers.values_mut() {
            peer.next_index = next;
            peer.match_index = 0;
            peer.active = true;
        }
        info!(
            "Node {} became leader for term {}",
            self.id, state.current_term
        );
    }

    /// Handles a RequestVote from a candidate and answers it.
    pub async fn handle_request_vote(&self, request: RequestVote) {
        let response = {
            let mut state = self.state.lock();
            if request.term > state.current_term {
                state.step_down(request.term);
                metrics::CONSENSUS_TERM.set(state.current_term as f64);
            }

            let up_to_date = request.last_log_term > state.log.last_term()
                || (request.last_log_term == state.log.last_term()
                    && request.last_log_index >= state.log.last_index());
            let granted = request.term >= state.current_term
                && state
                    .voted_for
                    .as_ref()
                    .is_none_or(|voted| voted == &request.candidate_id)
                && up_to_date;

            if granted {
                state.voted_for = Some(request.candidate_id.clone());
                state.election_deadline = Instant::now() + self.config.random_election_timeout();
            }
            VoteResponse {
                term: state.current_term,
                voter_id: self.id.clone(),
                granted,
            }
        };

        if let Err(e) = self
            .transport
            .send_vote_response(&request.candidate_id, response)
            .await
        {
            debug!(
                "Failed to send vote response to {}: {}",
                request.candidate_id, e
            );
        }
    }

    /// Handles a vote response; may win the election and send the first
    /// heartbeat round.
    pub async fn handle_vote_response(&self, response: VoteResponse) {
        let won = {
            let mut state = self.state.lock();
            if response.term > state.current_term {
                state.step_down(response.term);
                return;
            }
            if state.role != RaftRole::Candidate
                || response.term < state.current_term
                || !response.granted
            {
                return;
            }
            state.votes.insert(response.voter_id.clone());
            if state.votes.len() >= state.majority() {
                self.become_leader(&mut state);
                true
            } else {
                false
            }
        };
        if won {
            self.broadcast_append_entries().await;
        }
    }

    /// Handles replicated entries (or a heartbeat) from the leader.
    pub async fn handle_append_entries(&self, request: AppendEntriesRequest) {
        let (response, leader) = {
            let mut state = self.state.lock();
            if request.term < state.current_term {
                let response = AppendEntriesResponse {
                    term: state.current_term,
                    peer_id: self.id.clone(),
                    success: false,
                    match_index: 0,
                };
                (response, request.leader_id.clone())
            } else {
                if request.term > state.current_term || state.role != RaftRole::Follower {
                    state.step_down(request.term);
                    metrics::CONSENSUS_TERM.set(state.current_term as f64);
                }
                state.leader_id = Some(request.leader_id.clone());
                state.election_deadline = Instant::now() + self.config.random_election_timeout();

                if state.log.matches(request.prev_log_index, request.prev_log_term) {
                    let new_match = request.prev_log_index + request.entries.len() as u64;
                    state.log.splice(request.prev_log_index, request.entries);
                    if request.leader_commit > state.commit_index {
                        let commit = request.leader_commit.min(state.log.last_index());
                        state.commit_index = commit;
                        state.log.mark_committed(commit);
                        self.apply_notify.notify_one();
                    }
                    let response = AppendEntriesResponse {
                        term: state.current_term,
                        peer_id: self.id.clone(),
                        success: true,
                        match_index: new_match,
                    };
                    (response, request.leader_id.clone())
                } else {
                    let response = AppendEntriesResponse {
                        term: state.current_term,
                        peer_id: self.id.clone(),
                        success: false,
                        match_index: 0,
                    };
                    (response, request.leader_id.clone())
                }
            }
        };

        if let Err(e) = self
            .transport
            .send_append_entries_response(&leader, response)
            .await
        {
            debug!("Failed to send append response to {}: {}", leader, e);
        }
    }

    /// Handles a follower's append-entries acknowledgement.
    pub async fn handle_append_entries_response(&self, response: AppendEntriesResponse) {
        let mut state = self.state.lock();
        if response.term > state.current_term {
            state.step_down(response.term);
            metrics::CONSENSUS_TERM.set(state.current_term as f64);
            return;
        }
        if state.role != RaftRole::Leader || response.term < state.current_term {
            return;
        }

        let Some(peer) = state.peers.get_mut(&response.peer_id) else {
            return;
        };
        if response.success {
            peer.match_index = peer.match_index.max(response.match_index);
            peer.next_index = peer.match_index + 1;
            if self.advance_commit_index(&mut state) {
                self.apply_notify.notify_one();
            }
        } else {
            // Log mismatch: back up and retry on the next heartbeat.
            peer.next_index = peer.next_index.saturating_sub(1).max(1);
        }

        if response.success {
            let mut pending = self.pending.lock();
            if let Some(proposal) = pending.get_mut(&response.match_index) {
                proposal.confirmations.insert(response.peer_id.clone());
            }
        }
    }

    /// Advances the commit index to the highest current-term entry replicated
    /// on a majority. Returns true when it moved.
    fn advance_commit_index(&self, state: &mut RaftState) -> bool {
        let majority = state.majority();
        let mut advanced = false;
        for candidate in ((state.commit_index + 1)..=state.log.last_index()).rev() {
            if state.log.term_at(candidate) != Some(state.current_term) {
                // Entries from earlier terms commit only via a current-term entry.
                continue;
            }
            let replicas = 1 + state
                .peers
                .values()
                .filter(|peer| peer.match_index >= candidate)
                .count();
            if replicas >= majority {
                state.commit_index = candidate;
                state.log.mark_committed(candidate);
                advanced = true;
                break;
            }
        }
        advanced
    }

    /// Ships entries (or an empty heartbeat) to every peer from its
    /// `next_index`.
    pub async fn broadcast_append_entries(&self) {
        let requests: Vec<(NodeId, AppendEntriesRequest)> = {
            let state = self.state.lock();
            if state.role != RaftRole::Leader {
                return;
            }
            state
                .peers
                .iter()
                .filter(|(_, peer)| peer.active)
                .map(|(peer_id, peer)| {
                    let prev_log_index = peer.next_index.saturating_sub(1);
                    let prev_log_term = state.log.term_at(prev_log_index).unwrap_or(0);
                    let entries = state.log.entries_from(peer.next_index, MAX_APPEND_ENTRIES);
                    (
                        peer_id.clone(),
                        AppendEntriesRequest {
                            term: state.current_term,
                            leader_id: self.id.clone(),
                            prev_log_index,
                            prev_log_term,
                            entries,
                            leader_commit: state.commit_index,
                        },
                    )
                })
                .collect()
        };

        for (peer, request) in requests {
            if let Err(e) = self.transport.send_append_entries(&peer, request).await {
                debug!("Failed to send append entries to {}: {}", peer, e);
            }
        }
    }
}

impl ConsensusConfig {
    /// A fresh randomized election timeout in the configured window.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
    }
}
