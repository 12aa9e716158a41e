// src/core/gossip/protocol.rs

//! The gossip wire protocol: message kinds, the signed envelope that carries
//! them, and payload-budget chunking.

use crate::core::NodeId;
use crate::core::gossip::crds_value::CrdsValue;
use crate::core::gossip::filter::CrdsFilter;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The maximum encoded payload of one gossip datagram. Oversized logical
/// messages are split into independent chunks below this budget.
pub const MAX_GOSSIP_PAYLOAD: usize = 1232;

/// The gossip message kinds.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum Protocol {
    PullRequest {
        from: NodeId,
        filter: CrdsFilter,
        caller: CrdsValue,
    },
    PullResponse {
        from: NodeId,
        values: Vec<CrdsValue>,
    },
    PushMessage {
        from: NodeId,
        values: Vec<CrdsValue>,
    },
    PruneMessage {
        from: NodeId,
        prunes: Vec<NodeId>,
        destination: NodeId,
        wallclock_ms: u64,
    },
    Ping {
        from: NodeId,
        token: u64,
    },
    Pong {
        from: NodeId,
        token: u64,
    },
}

impl Protocol {
    pub fn from(&self) -> &NodeId {
        match self {
            Protocol::PullRequest { from, .. }
            | Protocol::PullResponse { from, .. }
            | Protocol::PushMessage { from, .. }
            | Protocol::PruneMessage { from, .. }
            | Protocol::Ping { from, .. }
            | Protocol::Pong { from, .. } => from,
        }
    }

    /// Short name for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Protocol::PullRequest { .. } => "pull_request",
            Protocol::PullResponse { .. } => "pull_response",
            Protocol::PushMessage { .. } => "push",
            Protocol::PruneMessage { .. } => "prune",
            Protocol::Ping { .. } => "ping",
            Protocol::Pong { .. } => "pong",
        }
    }
}

/// The envelope actually sent on the wire: message plus HMAC-SHA256 signature
/// keyed by the cluster secret. Without a secret the signature is zero.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct SignedGossipMessage {
    pub message: Protocol,
    pub signature: [u8; 32],
}

impl SignedGossipMessage {
    pub fn new(message: Protocol, secret: &Option<String>) -> Result<Self, &'static str> {
        let Some(secret) = secret else {
            return Ok(Self {
                message,
                signature: [0u8; 32],
            });
        };

        let encoded = bincode::encode_to_vec(&message, bincode::config::standard())
            .map_err(|_| "Failed to encode gossip message for signing")?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| "Failed to create HMAC instance")?;
        mac.update(&encoded);
        let signature: [u8; 32] = mac
            .finalize()
            .into_bytes()
            .as_slice()
            .try_into()
            .map_err(|_| "Invalid signature length")?;

        Ok(Self { message, signature })
    }

    pub fn verify(&self, secret: &Option<String>) -> Result<bool, &'static str> {
        let Some(secret) = secret else {
            return Ok(self.signature == [0u8; 32]);
        };

        if self.signature == [0u8; 32] {
            return Ok(false);
        }

        let encoded = bincode::encode_to_vec(&self.message, bincode::config::standard())
            .map_err(|_| "Failed to encode received gossip message for verification")?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| "Failed to create HMAC instance for verification")?;
        mac.update(&encoded);
        Ok(mac.verify_slice(&self.signature).is_ok())
    }
}

fn encoded_len(value: &CrdsValue) -> usize {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map(|bytes| bytes.len())
        .unwrap_or(MAX_GOSSIP_PAYLOAD)
}

/// Splits `values` into chunks whose combined encoded size stays under the
/// payload budget, leaving headroom for the envelope itself. A single value
/// larger than the budget is sent alone and left to the receiver to reject.
pub fn split_values_by_budget(values: Vec<CrdsValue>, budget: usize) -> Vec<Vec<CrdsValue>> {
    // Envelope overhead: signature, discriminant, sender id.
    let body_budget = budget.saturating_sub(96).max(128);
    let mut chunks: Vec<Vec<CrdsValue>> = Vec::new();
    let mut current: Vec<CrdsValue> = Vec::new();
    let mut current_size = 0usize;

    for value in values {
        let size = encoded_len(&value);
        if !current.is_empty() && current_size + size > body_budget {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(value);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
