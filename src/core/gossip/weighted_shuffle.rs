// src/core/gossip/weighted_shuffle.rs

//! Stake-weighted peer shuffling.
//!
//! At each step the next index is drawn with probability proportional to its
//! remaining weight. The draw is deterministic for a fixed seed, so peers
//! that share a seed converge on similar selections without coordination.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Returns the indices of `weights` in stake-weighted shuffle order.
/// Zero-weight entries are given a weight of one so they still appear.
pub fn weighted_shuffle(weights: &[u64], seed: [u8; 32]) -> Vec<usize> {
    let mut rng = SmallRng::from_seed(seed);
    let mut remaining: Vec<(usize, u64)> = weights
        .iter()
        .map(|weight| weight.max(&1))
        .copied()
        .enumerate()
        .collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let total: u64 = remaining.iter().map(|(_, weight)| *weight).sum();
        let mut pick = rng.gen_range(0..total);
        let mut chosen = remaining.len() - 1;
        for (slot, (_, weight)) in remaining.iter().enumerate() {
            if pick < *weight {
                chosen = slot;
                break;
            }
            pick -= *weight;
        }
        let (index, _) = remaining.swap_remove(chosen);
        order.push(index);
    }
    order
}
