// src/core/gossip/active_set.rs

//! The rotating set of peers that push messages are sent to.
//!
//! Up to `fanout * 2` candidates are sampled (stake-weighted when stake is
//! known) from the broader peer pool every rotation period. Peers named in a
//! prune message destined for this node are dropped immediately and stay
//! filtered through the rotation tick in which the prune arrived.

use crate::core::NodeId;
use crate::core::gossip::weighted_shuffle::weighted_shuffle;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug)]
struct ActiveSetInner {
    peers: Vec<NodeId>,
    pruned: HashSet<NodeId>,
    last_rotation: Option<Instant>,
}

/// The push active set.
#[derive(Debug)]
pub struct PushActiveSet {
    fanout: usize,
    inner: Mutex<ActiveSetInner>,
}

impl PushActiveSet {
    pub fn new(fanout: usize) -> Self {
        Self {
            fanout,
            inner: Mutex::new(ActiveSetInner {
                peers: Vec::new(),
                pruned: HashSet::new(),
                last_rotation: None,
            }),
        }
    }

    /// True when the rotation period has elapsed (or no rotation happened yet).
    pub fn needs_rotation(&self, period: std::time::Duration) -> bool {
        self.inner
            .lock()
            .last_rotation
            .is_none_or(|last| last.elapsed() >= period)
    }

    /// Re-samples the active set from `pool`, a slice of (peer, stake) pairs.
    /// Peers pruned during the previous rotation are filtered out of this
    /// sample, then the prune list is cleared.
    pub fn rotate(&self, pool: &[(NodeId, u64)], seed: [u8; 32]) {
        let mut inner = self.inner.lock();
        let candidates: Vec<&(NodeId, u64)> = pool
            .iter()
            .filter(|(peer, _)| !inner.pruned.contains(peer))
            .collect();
        let weights: Vec<u64> = candidates.iter().map(|(_, stake)| *stake).collect();
        let order = weighted_shuffle(&weights, seed);
        inner.peers = order
            .into_iter()
            .take(self.fanout * 2)
            .map(|idx| candidates[idx].0.clone())
            .collect();
        inner.pruned.clear();
        inner.last_rotation = Some(Instant::now());
    }

    /// The top-`fanout` peers push messages go to.
    pub fn push_peers(&self) -> Vec<NodeId> {
        let inner = self.inner.lock();
        inner.peers.iter().take(self.fanout).cloned().collect()
    }

    /// Drops a peer from the active set and remembers it for the current
    /// rotation tick.
    pub fn prune(&self, peer: &NodeId) {
        let mut inner = self.inner.lock();
        inner.peers.retain(|p| p != peer);
        inner.pruned.insert(peer.clone());
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        self.inner.lock().peers.iter().any(|p| p == peer)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().peers.is_empty()
    }
}
