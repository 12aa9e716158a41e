// src/core/gossip/filter.rs

//! The bloom filter carried by pull requests for anti-entropy.
//!
//! Three independent bit positions are derived directly from the content-hash
//! bytes, so both sides compute identical positions without agreeing on hash
//! keys. The responder returns values whose hash is *not* in the filter.

use crate::core::gossip::crds_value::CrdsHash;
use serde::{Deserialize, Serialize};

/// Bits consumed from the content-hash per probe position.
const NUM_PROBES: usize = 3;

/// A fixed-size bloom filter over CRDS content-hashes.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct CrdsFilter {
    bits: Vec<u64>,
    num_bits: u64,
}

impl CrdsFilter {
    /// Builds an empty filter sized proportionally to the expected number of
    /// entries (about eight bits per entry, rounded up to a power of two).
    pub fn with_capacity(num_items: usize) -> Self {
        let num_bits = (num_items.max(8) * 8).next_power_of_two() as u64;
        Self {
            bits: vec![0u64; (num_bits as usize).div_ceil(64)],
            num_bits,
        }
    }

    /// Builds a filter pre-populated with every known hash.
    pub fn from_hashes(hashes: &[CrdsHash]) -> Self {
        let mut filter = Self::with_capacity(hashes.len());
        for hash in hashes {
            filter.add(hash);
        }
        filter
    }

    fn positions(&self, hash: &CrdsHash) -> [u64; NUM_PROBES] {
        let mut positions = [0u64; NUM_PROBES];
        for (k, position) in positions.iter_mut().enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(&hash[k * 8..k * 8 + 8]);
            *position = u64::from_le_bytes(word) % self.num_bits;
        }
        positions
    }

    pub fn add(&mut self, hash: &CrdsHash) {
        for position in self.positions(hash) {
            self.bits[(position / 64) as usize] |= 1u64 << (position % 64);
        }
    }

    pub fn contains(&self, hash: &CrdsHash) -> bool {
        self.positions(hash)
            .iter()
            .all(|position| self.bits[(position / 64) as usize] & (1u64 << (position % 64)) != 0)
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }
}
