// src/core/gossip/dup_shred.rs

//! Detects duplicate shreds: two different payloads observed at the same
//! `(slot, index)` position. A confirmed duplicate is evidence of leader
//! misbehavior and is surfaced on the event bus.

use crate::core::NodeId;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long an observed (slot, index) fingerprint is retained.
const OBSERVATION_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct ShredObservation {
    payload_digest: [u8; 32],
    origin: NodeId,
    seen_at: Instant,
}

/// Evidence that conflicting payloads exist for one shred position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateShredEvidence {
    pub origin: NodeId,
    pub slot: u64,
    pub index: u32,
}

#[derive(Debug, Default)]
pub struct DuplicateShredDetector {
    seen: Mutex<HashMap<(u64, u32), ShredObservation>>,
}

impl DuplicateShredDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a shred sighting. Returns evidence when a different payload
    /// was already recorded for the same (slot, index).
    pub fn observe(
        &self,
        origin: &NodeId,
        slot: u64,
        index: u32,
        payload: &[u8],
    ) -> Option<DuplicateShredEvidence> {
        let digest: [u8; 32] = Sha256::digest(payload).into();
        let mut seen = self.seen.lock();
        match seen.get(&(slot, index)) {
            Some(observation) if observation.payload_digest != digest => {
                Some(DuplicateShredEvidence {
                    origin: observation.origin.clone(),
                    slot,
                    index,
                })
            }
            Some(_) => None,
            None => {
                seen.insert(
                    (slot, index),
                    ShredObservation {
                        payload_digest: digest,
                        origin: origin.clone(),
                        seen_at: Instant::now(),
                    },
                );
                None
            }
        }
    }

    /// Drops observations older than the retention window.
    pub fn purge_stale(&self) {
        self.seen
            .lock()
            .retain(|_, observation| observation.seen_at.elapsed() < OBSERVATION_WINDOW);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}
