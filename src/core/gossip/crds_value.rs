// src/core/gossip/crds_value.rs

//! Signed, versioned records disseminated through the gossip plane.
//!
//! Every record is a [`CrdsValue`]: a typed payload plus an HMAC-SHA256
//! signature and a SHA-256 content-hash. The content-hash is the record's
//! stable identity in bloom filters and dedup caches. Records with the same
//! [`CrdsValueLabel`] conflict; [`CrdsValue::overrides`] decides which one
//! survives.

use crate::core::NodeId;
use crate::core::gossip::contact_info::ContactInfo;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// A 32-byte HMAC-SHA256 signature over the serialized payload.
pub type Signature = [u8; 32];

/// The SHA-256 content-hash identifying a record in filters and caches.
pub type CrdsHash = [u8; 32];

/// The typed payload of a gossiped record. A closed sum type; every variant
/// carries its origin and wallclock.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq)]
pub enum CrdsData {
    ContactInfo(ContactInfo),
    Vote {
        tower_index: u8,
        origin: NodeId,
        slot: u64,
        wallclock_ms: u64,
    },
    LowestSlot {
        origin: NodeId,
        lowest: u64,
        wallclock_ms: u64,
    },
    EpochSlots {
        index: u8,
        origin: NodeId,
        slots: Vec<u64>,
        wallclock_ms: u64,
    },
    NodeInstance {
        origin: NodeId,
        token: u64,
        wallclock_ms: u64,
    },
    SnapshotHashes {
        origin: NodeId,
        full: (u64, String),
        incremental: Vec<(u64, String)>,
        wallclock_ms: u64,
    },
    RestartLastVotedForkSlots {
        origin: NodeId,
        slots: Vec<u64>,
        last_voted_slot: u64,
        last_voted_hash: String,
        wallclock_ms: u64,
    },
    RestartHeaviestFork {
        origin: NodeId,
        last_slot: u64,
        last_slot_hash: String,
        observed_stake: u64,
        wallclock_ms: u64,
    },
}

impl CrdsData {
    pub fn origin(&self) -> &NodeId {
        match self {
            CrdsData::ContactInfo(info) => &info.origin,
            CrdsData::Vote { origin, .. }
            | CrdsData::LowestSlot { origin, .. }
            | CrdsData::EpochSlots { origin, .. }
            | CrdsData::NodeInstance { origin, .. }
            | CrdsData::SnapshotHashes { origin, .. }
            | CrdsData::RestartLastVotedForkSlots { origin, .. }
            | CrdsData::RestartHeaviestFork { origin, .. } => origin,
        }
    }

    pub fn wallclock_ms(&self) -> u64 {
        match self {
            CrdsData::ContactInfo(info) => info.wallclock_ms,
            CrdsData::Vote { wallclock_ms, .. }
            | CrdsData::LowestSlot { wallclock_ms, .. }
            | CrdsData::EpochSlots { wallclock_ms, .. }
            | CrdsData::NodeInstance { wallclock_ms, .. }
            | CrdsData::SnapshotHashes { wallclock_ms, .. }
            | CrdsData::RestartLastVotedForkSlots { wallclock_ms, .. }
            | CrdsData::RestartHeaviestFork { wallclock_ms, .. } => *wallclock_ms,
        }
    }

    pub fn label(&self) -> CrdsValueLabel {
        match self {
            CrdsData::ContactInfo(info) => CrdsValueLabel::ContactInfo(info.origin.clone()),
            CrdsData::Vote {
                tower_index, origin, ..
            } => CrdsValueLabel::Vote(*tower_index, origin.clone()),
            CrdsData::LowestSlot { origin, .. } => CrdsValueLabel::LowestSlot(origin.clone()),
            CrdsData::EpochSlots { index, origin, .. } => {
                CrdsValueLabel::EpochSlots(*index, origin.clone())
            }
            CrdsData::NodeInstance { origin, .. } => CrdsValueLabel::NodeInstance(origin.clone()),
            CrdsData::SnapshotHashes { origin, .. } => {
                CrdsValueLabel::SnapshotHashes(origin.clone())
            }
            CrdsData::RestartLastVotedForkSlots { origin, .. } => {
                CrdsValueLabel::RestartLastVotedForkSlots(origin.clone())
            }
            CrdsData::RestartHeaviestFork { origin, .. } => {
                CrdsValueLabel::RestartHeaviestFork(origin.clone())
            }
        }
    }
}

/// Uniquely identifies a record slot in the CRDS table: (kind, origin, and,
/// for indexed kinds, a sub-index).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CrdsValueLabel {
    ContactInfo(NodeId),
    Vote(u8, NodeId),
    LowestSlot(NodeId),
    EpochSlots(u8, NodeId),
    NodeInstance(NodeId),
    SnapshotHashes(NodeId),
    RestartLastVotedForkSlots(NodeId),
    RestartHeaviestFork(NodeId),
}

impl CrdsValueLabel {
    pub fn origin(&self) -> &NodeId {
        match self {
            CrdsValueLabel::ContactInfo(origin)
            | CrdsValueLabel::Vote(_, origin)
            | CrdsValueLabel::LowestSlot(origin)
            | CrdsValueLabel::EpochSlots(_, origin)
            | CrdsValueLabel::NodeInstance(origin)
            | CrdsValueLabel::SnapshotHashes(origin)
            | CrdsValueLabel::RestartLastVotedForkSlots(origin)
            | CrdsValueLabel::RestartHeaviestFork(origin) => origin,
        }
    }
}

/// A signed record: payload, signature, and the content-hash derived from both.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq)]
pub struct CrdsValue {
    pub signature: Signature,
    pub data: CrdsData,
    hash: CrdsHash,
}

impl CrdsValue {
    /// Signs a payload with the cluster secret. Without a secret, the
    /// signature is all zeroes and verification accepts only that.
    pub fn new_signed(data: CrdsData, secret: &Option<String>) -> Self {
        let signature = match secret {
            None => [0u8; 32],
            Some(secret) => {
                let payload = Self::serialized_payload(&data);
                let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                    .expect("HMAC accepts keys of any length");
                mac.update(&payload);
                mac.finalize().into_bytes().into()
            }
        };
        let hash = Self::compute_hash(&signature, &data);
        Self {
            signature,
            data,
            hash,
        }
    }

    /// Reconstructs a value received from the wire, recomputing the
    /// content-hash locally rather than trusting the sender's.
    pub fn from_wire(signature: Signature, data: CrdsData) -> Self {
        let hash = Self::compute_hash(&signature, &data);
        Self {
            signature,
            data,
            hash,
        }
    }

    pub fn verify(&self, secret: &Option<String>) -> bool {
        match secret {
            None => self.signature == [0u8; 32],
            Some(secret) => {
                if self.signature == [0u8; 32] {
                    return false;
                }
                let payload = Self::serialized_payload(&self.data);
                let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                    .expect("HMAC accepts keys of any length");
                mac.update(&payload);
                mac.verify_slice(&self.signature).is_ok()
            }
        }
    }

    /// `SHA-256(signature ‖ serialized_payload)`.
    fn compute_hash(signature: &Signature, data: &CrdsData) -> CrdsHash {
        let mut hasher = Sha256::new();
        hasher.update(signature);
        hasher.update(Self::serialized_payload(data));
        hasher.finalize().into()
    }

    fn serialized_payload(data: &CrdsData) -> Vec<u8> {
        bincode::encode_to_vec(data, bincode::config::standard())
            .expect("CRDS payloads contain no unencodable types")
    }

    pub fn hash(&self) -> &CrdsHash {
        &self.hash
    }

    pub fn label(&self) -> CrdsValueLabel {
        self.data.label()
    }

    pub fn origin(&self) -> &NodeId {
        self.data.origin()
    }

    pub fn wallclock_ms(&self) -> u64 {
        self.data.wallclock_ms()
    }

    /// The conflict-resolution rule for two values with the same label:
    /// for contact info a strictly greater instance outset wins, then a
    /// strictly greater wallclock, then the lexicographically greater
    /// content-hash as a deterministic tiebreak.
    pub fn overrides(&self, other: &CrdsValue) -> bool {
        debug_assert_eq!(self.label(), other.label());
        if let (CrdsData::ContactInfo(new), CrdsData::ContactInfo(old)) = (&self.data, &other.data)
        {
            if new.outset != old.outset {
                return new.outset > old.outset;
            }
        }
        match self.wallclock_ms().cmp(&other.wallclock_ms()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.hash > other.hash,
        }
    }
}

/// A stored record plus node-local bookkeeping.
#[derive(Debug, Clone)]
pub struct VersionedCrdsValue {
    pub value: CrdsValue,
    /// Monotonic insertion ordinal; updates get a fresh one.
    pub ordinal: u64,
    pub local_timestamp_ms: u64,
    pub num_push_receipts: u32,
    pub from_pull_response: bool,
}
