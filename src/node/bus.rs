// src/node/bus.rs

//! A UDP cluster bus carrying consensus traffic between peers. Sends are
//! fire-and-forget datagrams, matching the at-most-once, lossy transport
//! contract the engine is built against.

use crate::core::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ClusterTransport, ConsensusEngine, RequestVote,
    VoteResponse,
};
use crate::core::{NodeId, PeridotError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const UDP_BUFFER_SIZE: usize = 65535;

/// The frames exchanged on the consensus bus.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
enum BusFrame {
    RequestVote(RequestVote),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

/// The UDP-backed consensus transport.
pub struct UdpClusterBus {
    socket: Arc<UdpSocket>,
    peers: DashMap<NodeId, String>,
    engine: RwLock<Option<Arc<ConsensusEngine>>>,
}

impl UdpClusterBus {
    pub async fn bind(bind_addr: &str) -> Result<Arc<Self>, PeridotError> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            PeridotError::Internal(format!("failed to bind cluster bus on {bind_addr}: {e}"))
        })?;
        info!("Cluster bus listening on {}", bind_addr);
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            peers: DashMap::new(),
            engine: RwLock::new(None),
        }))
    }

    /// Installs the engine that received frames dispatch into.
    pub fn attach_engine(&self, engine: Arc<ConsensusEngine>) {
        *self.engine.write() = Some(engine);
    }

    pub fn add_peer(&self, node_id: NodeId, address: String) {
        self.peers.insert(node_id, address);
    }

    pub fn remove_peer(&self, node_id: &NodeId) {
        self.peers.remove(node_id);
    }

    /// Spawns the receive loop. Frames for an unattached engine are dropped.
    pub fn spawn_receiver(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Cluster bus receiver shutting down.");
                        return;
                    }
                    result = bus.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src)) => bus.dispatch(&buf[..len], src).await,
                            Err(e) => warn!("Error receiving from cluster bus: {}", e),
                        }
                    }
                }
            }
        })
    }

    async fn dispatch(&self, frame: &[u8], src: std::net::SocketAddr) {
        let decoded =
            bincode::decode_from_slice::<BusFrame, _>(frame, bincode::config::standard());
        let (frame, _) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Failed to deserialize bus frame from {}: {}", src, e);
                return;
            }
        };
        let Some(engine) = self.engine.read().clone() else {
            debug!("Dropping bus frame from {}: no engine attached", src);
            return;
        };
        match frame {
            BusFrame::RequestVote(request) => engine.handle_request_vote(request).await,
            BusFrame::VoteResponse(response) => engine.handle_vote_response(response).await,
            BusFrame::AppendEntries(request) => engine.handle_append_entries(request).await,
            BusFrame::AppendEntriesResponse(response) => {
                engine.handle_append_entries_response(response).await
            }
        }
    }

    async fn send_frame(&self, to: &NodeId, frame: BusFrame) -> Result<(), PeridotError> {
        let addr = self
            .peers
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PeridotError::NodeNotFound(to.clone()))?;
        let encoded = bincode::encode_to_vec(&frame, bincode::config::standard())?;
        self.socket
            .send_to(&encoded, &addr)
            .await
            .map_err(|e| PeridotError::Transport(format!("send to {addr}: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ClusterTransport for UdpClusterBus {
    async fn send_request_vote(
        &self,
        to: &NodeId,
        request: RequestVote,
    ) -> Result<(), PeridotError> {
        self.send_frame(to, BusFrame::RequestVote(request)).await
    }

    async fn send_vote_response(
        &self,
        to: &NodeId,
        response: VoteResponse,
    ) -> Result<(), PeridotError> {
        self.send_frame(to, BusFrame::VoteResponse(response)).await
    }

    async fn send_append_entries(
        &self,
        to: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<(), PeridotError> {
        self.send_frame(to, BusFrame::AppendEntries(request)).await
    }

    async fn send_append_entries_response(
        &self,
        to: &NodeId,
        response: AppendEntriesResponse,
    ) -> Result<(), PeridotError> {
        self.send_frame(to, BusFrame::AppendEntriesResponse(response))
            .await
    }
}
