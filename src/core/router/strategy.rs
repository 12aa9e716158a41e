// src/core/router/strategy.rs

//! The pluggable backend-selection strategies.

use crate::core::router::backend::BackendServer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    RoundRobin,
    LeastConnections,
    LeastResponseTime,
    WeightedRoundRobin,
    IpHash,
    Geographic,
    ResourceBased,
    Adaptive,
}

/// Inputs a strategy may consult beyond the candidate list.
pub struct SelectionContext<'a> {
    /// The per-service round-robin counter.
    pub counter: &'a AtomicUsize,
    pub client_ip: &'a str,
    pub target_region: Option<&'a str>,
    /// Per-server weights supplied by the matched rule; falls back to the
    /// server's own weight.
    pub rule_weights: &'a HashMap<String, u32>,
}

/// Applies `strategy` over non-empty `candidates`. Returns the index of the
/// chosen server.
pub fn select(
    strategy: RoutingStrategy,
    candidates: &[BackendServer],
    ctx: &SelectionContext<'_>,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let chosen = match strategy {
        RoutingStrategy::RoundRobin => {
            ctx.counter.fetch_add(1, Ordering::Relaxed) % candidates.len()
        }
        RoutingStrategy::LeastConnections => least_connections(candidates),
        RoutingStrategy::LeastResponseTime => candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.avg_response_ms
                    .partial_cmp(&b.avg_response_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx)?,
        RoutingStrategy::WeightedRoundRobin => weighted_draw(candidates, ctx),
        RoutingStrategy::IpHash => {
            let mut hasher = DefaultHasher::new();
            ctx.client_ip.hash(&mut hasher);
            (hasher.finish() as usize) % candidates.len()
        }
        RoutingStrategy::Geographic => {
            let regional: Vec<usize> = match ctx.target_region {
                Some(region) => candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, server)| server.region == region)
                    .map(|(idx, _)| idx)
                    .collect(),
                None => Vec::new(),
            };
            if regional.is_empty() {
                least_connections(candidates)
            } else {
                let local: Vec<BackendServer> = regional
                    .iter()
                    .map(|&idx| candidates[idx].clone())
                    .collect();
                regional[least_connections(&local)]
            }
        }
        RoutingStrategy::ResourceBased => candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.health_score
                    .partial_cmp(&b.health_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx)?,
        RoutingStrategy::Adaptive => candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                adaptive_score(a, ctx)
                    .partial_cmp(&adaptive_score(b, ctx))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx)?,
    };
    Some(chosen)
}

fn least_connections(candidates: &[BackendServer]) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, server)| server.current_connections)
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn weighted_draw(candidates: &[BackendServer], ctx: &SelectionContext<'_>) -> usize {
    let weights: Vec<u64> = candidates
        .iter()
        .map(|server| {
            ctx.rule_weights
                .get(&server.server_id)
                .copied()
                .unwrap_or(server.weight)
                .max(1) as u64
        })
        .collect();
    let total: u64 = weights.iter().sum();
    let mut pick = rand::random::<u64>() % total;
    for (idx, weight) in weights.iter().enumerate() {
        if pick < *weight {
            return idx;
        }
        pick -= weight;
    }
    candidates.len() - 1
}

/// `0.3·health + 0.3·(1 − load) + 0.2·response_factor + 0.2·region_match`.
fn adaptive_score(server: &BackendServer, ctx: &SelectionContext<'_>) -> f64 {
    let response_factor = 1.0 / (1.0 + server.avg_response_ms / 100.0);
    let region_match = match ctx.target_region {
        Some(region) if server.region == region => 1.0,
        _ => 0.0,
    };
    0.3 * server.health_score
        + 0.3 * (1.0 - server.load_factor())
        + 0.2 * response_factor
        + 0.2 * region_match
}
