// src/core/gossip/contact_info.rs

//! The gossiped identity record of a node: which sockets it exposes, which
//! instance epoch it belongs to, and when it last refreshed itself.
//!
//! The internal representation keeps a vector of tagged socket entries. The
//! wire-compatibility shape with one field per address lives in
//! [`LegacyContactInfo`], with a bidirectional adapter.

use crate::core::NodeId;
use serde::{Deserialize, Serialize};

/// Identifies the service behind a socket entry.
#[derive(
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
)]
pub enum SocketTag {
    Gossip,
    Rpc,
    Tvu,
    Tpu,
    Repair,
    ServeRepair,
}

/// One advertised socket of a node.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub tag: SocketTag,
    pub addr: String,
}

/// The full identity record gossiped by every node.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    pub origin: NodeId,
    pub wallclock_ms: u64,
    /// Node instance epoch. A restarted node advertises a strictly greater
    /// outset, which overrides any record from the previous instance.
    pub outset: u64,
    pub shred_version: u16,
    pub sockets: Vec<SocketEntry>,
}

impl ContactInfo {
    pub fn new(origin: NodeId, wallclock_ms: u64, outset: u64) -> Self {
        Self {
            origin,
            wallclock_ms,
            outset,
            shred_version: 0,
            sockets: Vec::new(),
        }
    }

    pub fn with_socket(mut self, tag: SocketTag, addr: impl Into<String>) -> Self {
        self.set_socket(tag, addr);
        self
    }

    /// Sets or replaces the socket entry for a tag.
    pub fn set_socket(&mut self, tag: SocketTag, addr: impl Into<String>) {
        let addr = addr.into();
        if let Some(entry) = self.sockets.iter_mut().find(|s| s.tag == tag) {
            entry.addr = addr;
        } else {
            self.sockets.push(SocketEntry { tag, addr });
        }
    }

    pub fn socket(&self, tag: SocketTag) -> Option<&str> {
        self.sockets
            .iter()
            .find(|s| s.tag == tag)
            .map(|s| s.addr.as_str())
    }

    pub fn gossip_addr(&self) -> Option<&str> {
        self.socket(SocketTag::Gossip)
    }
}

/// Wire-compatibility shape with one field per address, as older peers
/// serialize it. Empty strings stand for absent sockets.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, Default)]
pub struct LegacyContactInfo {
    pub origin: NodeId,
    pub wallclock_ms: u64,
    pub outset: u64,
    pub shred_version: u16,
    pub gossip: String,
    pub rpc: String,
    pub tvu: String,
    pub tpu: String,
    pub repair: String,
}

impl From<&ContactInfo> for LegacyContactInfo {
    fn from(info: &ContactInfo) -> Self {
        let field = |tag| info.socket(tag).unwrap_or_default().to_string();
        Self {
            origin: info.origin.clone(),
            wallclock_ms: info.wallclock_ms,
            outset: info.outset,
            shred_version: info.shred_version,
            gossip: field(SocketTag::Gossip),
            rpc: field(SocketTag::Rpc),
            tvu: field(SocketTag::Tvu),
            tpu: field(SocketTag::Tpu),
            repair: field(SocketTag::Repair),
        }
    }
}

impl From<&LegacyContactInfo> for ContactInfo {
    fn from(legacy: &LegacyContactInfo) -> Self {
        let mut info = ContactInfo::new(legacy.origin.clone(), legacy.wallclock_ms, legacy.outset);
        info.shred_version = legacy.shred_version;
        for (tag, addr) in [
            (SocketTag::Gossip, &legacy.gossip),
            (SocketTag::Rpc, &legacy.rpc),
            (SocketTag::Tvu, &legacy.tvu),
            (SocketTag::Tpu, &legacy.tpu),
            (SocketTag::Repair, &legacy.repair),
        ] {
            if !addr.is_empty() {
                info.set_socket(tag, addr.clone());
            }
        }
        info
    }
}
