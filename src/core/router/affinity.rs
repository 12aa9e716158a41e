// src/core/router/affinity.rs

//! Session affinity: sticky bindings from a session id to a backend, expiring
//! one hour after their last refresh.

use crate::core::NodeId;
use dashmap::DashMap;
use std::time::{Duration, Instant};

pub const SESSION_BINDING_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct Binding {
    server_id: NodeId,
    refreshed_at: Instant,
}

#[derive(Debug, Default)]
pub struct SessionAffinity {
    bindings: DashMap<String, Binding>,
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bound backend for a session, if the binding is still live.
    pub fn lookup(&self, session_id: &str) -> Option<NodeId> {
        let binding = self.bindings.get(session_id)?;
        if binding.refreshed_at.elapsed() >= SESSION_BINDING_TTL {
            return None;
        }
        Some(binding.server_id.clone())
    }

    /// Binds (or re-binds) a session and refreshes its expiry.
    pub fn bind(&self, session_id: impl Into<String>, server_id: NodeId) {
        self.bindings.insert(
            session_id.into(),
            Binding {
                server_id,
                refreshed_at: Instant::now(),
            },
        );
    }

    pub fn unbind(&self, session_id: &str) {
        self.bindings.remove(session_id);
    }

    /// Drops every binding pointing at a backend (used when it is
    /// deregistered or fails).
    pub fn unbind_server(&self, server_id: &NodeId) {
        self.bindings
            .retain(|_, binding| &binding.server_id != server_id);
    }

    /// Sweeps expired bindings. Returns how many were removed.
    pub fn collect_expired(&self) -> usize {
        let before = self.bindings.len();
        self.bindings
            .retain(|_, binding| binding.refreshed_at.elapsed() < SESSION_BINDING_TTL);
        before - self.bindings.len()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
