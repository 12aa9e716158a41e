// src/core/gossip/received_cache.rs

//! The received-message dedup cache: an LRU over content-hashes that rejects
//! values already processed, regardless of which peer relayed them.

use crate::core::gossip::crds_value::CrdsHash;
use crate::core::metrics;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_RECEIVED_CACHE_CAPACITY: usize = 10_000;

pub struct ReceivedCache {
    cache: Mutex<LruCache<CrdsHash, ()>>,
    hits: AtomicU64,
}

impl ReceivedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
            )),
            hits: AtomicU64::new(0),
        }
    }

    /// Records a hash. Returns `true` if the hash is new; `false` if it was
    /// already processed (a dedup hit).
    pub fn record(&self, hash: &CrdsHash) -> bool {
        let mut cache = self.cache.lock();
        if cache.put(*hash, ()).is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::GOSSIP_DEDUP_HITS_TOTAL.inc();
            false
        } else {
            true
        }
    }

    pub fn contains(&self, hash: &CrdsHash) -> bool {
        self.cache.lock().contains(hash)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}
