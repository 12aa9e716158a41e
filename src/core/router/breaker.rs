// src/core/router/breaker.rs

//! Per-backend circuit breakers with exponential cool-off on repeated
//! failures. Open breakers make a backend ineligible until a probe succeeds.

use crate::core::NodeId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug)]
struct BreakerState {
    open: bool,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_probe: Option<Instant>,
}

/// The breaker registry.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    states: DashMap<NodeId, Mutex<BreakerState>>,
    /// Base spacing between probes of one open breaker.
    probe_interval: Duration,
}

impl CircuitBreakers {
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            states: DashMap::new(),
            probe_interval,
        }
    }

    pub fn register(&self, server_id: NodeId) {
        self.states.entry(server_id).or_insert_with(|| {
            Mutex::new(BreakerState {
                open: false,
                failure_count: 0,
                opened_at: None,
                last_probe: None,
            })
        });
    }

    pub fn deregister(&self, server_id: &NodeId) {
        self.states.remove(server_id);
    }

    pub fn is_closed(&self, server_id: &NodeId) -> bool {
        self.states
            .get(server_id)
            .map(|entry| !entry.lock().open)
            .unwrap_or(true)
    }

    /// Opens the breaker on a health-check failure.
    pub fn record_failure(&self, server_id: &NodeId) {
        if let Some(entry) = self.states.get(server_id) {
            let mut state = entry.lock();
            state.failure_count += 1;
            if !state.open {
                info!("Circuit breaker opened for backend {}", server_id);
                state.open = true;
                state.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn record_success(&self, server_id: &NodeId) {
        if let Some(entry) = self.states.get(server_id) {
            let mut state = entry.lock();
            if state.open {
                info!("Circuit breaker closed for backend {}", server_id);
            }
            state.open = false;
            state.failure_count = 0;
            state.opened_at = None;
        }
    }

    /// Open breakers whose exponential cool-off has elapsed and are due a
    /// re-probe. Marks them probed so the caller can run the probe without
    /// re-listing them next tick.
    pub fn due_for_probe(&self) -> Vec<NodeId> {
        let mut due = Vec::new();
        for entry in self.states.iter() {
            let mut state = entry.value().lock();
            if !state.open {
                continue;
            }
            // Repeated failures stretch the probe spacing: base * 2^min(n, 6).
            let cooloff = self.probe_interval * 2u32.pow(state.failure_count.min(6));
            let ready = state
                .last_probe
                .or(state.opened_at)
                .is_none_or(|at| at.elapsed() >= cooloff);
            if ready {
                state.last_probe = Some(Instant::now());
                due.push(entry.key().clone());
            } else {
                debug!(
                    "Breaker for {} still cooling off ({:?})",
                    entry.key(),
                    cooloff
                );
            }
        }
        due
    }

    pub fn open_count(&self) -> usize {
        self.states
            .iter()
            .filter(|entry| entry.value().lock().open)
            .count()
    }
}
