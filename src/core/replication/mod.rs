// src/core/replication/mod.rs

//! Best-effort replication of externally-supplied entries to a dynamic set
//! of targets, independent of the consensus log. Provides batching,
//! heartbeats, lag monitoring, and targeted resync.

pub mod manager;

use crate::core::{NodeId, PeridotError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a batch is judged successful across its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationStrategy {
    /// Every active target must acknowledge.
    Synchronous,
    /// Fire-and-forget: success if at least one send was attempted.
    Asynchronous,
    /// At least `quorum_size` targets must acknowledge.
    QuorumBased,
}

/// One replicated entry with a non-cryptographic content checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEntry {
    pub index: u64,
    pub payload: Bytes,
    pub checksum: u32,
    pub timestamp_ms: u64,
}

impl ReplicationEntry {
    pub fn new(index: u64, payload: Bytes, timestamp_ms: u64) -> Self {
        let checksum = crc32(&payload);
        Self {
            index,
            payload,
            checksum,
            timestamp_ms,
        }
    }

    pub fn verify_checksum(&self) -> bool {
        crc32(&self.payload) == self.checksum
    }
}

pub fn crc32(payload: &[u8]) -> u32 {
    const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    CRC.checksum(payload)
}

/// A contiguous run of entries shipped together.
#[derive(Debug, Clone)]
pub struct ReplicationBatch {
    pub batch_id: Uuid,
    pub start_index: u64,
    pub end_index: u64,
    pub entries: Vec<ReplicationEntry>,
}

impl ReplicationBatch {
    pub fn byte_size(&self) -> usize {
        self.entries.iter().map(|entry| entry.payload.len()).sum()
    }
}

/// Per-target replication bookkeeping.
#[derive(Debug, Clone)]
pub struct ReplicationTarget {
    pub node_id: NodeId,
    pub address: String,
    pub last_applied_index: u64,
    pub last_heartbeat_ms: u64,
    pub retry_count: u32,
    pub active: bool,
}

impl ReplicationTarget {
    pub fn new(node_id: NodeId, address: String) -> Self {
        Self {
            node_id,
            address,
            last_applied_index: 0,
            last_heartbeat_ms: 0,
            retry_count: 0,
            active: true,
        }
    }
}

/// The injected replication transport. Each send is at-most-once and lossy.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Ships a batch; resolves to the target's acknowledged end index.
    async fn send_batch(
        &self,
        target: &ReplicationTarget,
        batch: &ReplicationBatch,
    ) -> Result<u64, PeridotError>;

    /// Probes a target; resolves to its last applied index.
    async fn send_heartbeat(
        &self,
        target: &ReplicationTarget,
        current_index: u64,
    ) -> Result<u64, PeridotError>;

    /// Asks a lagging target to pull entries from `from_index` out of the
    /// registered data provider.
    async fn request_sync(
        &self,
        target: &ReplicationTarget,
        from_index: u64,
    ) -> Result<(), PeridotError>;
}

/// Serves historical entries to targets that resync.
pub trait ReplicationDataProvider: Send + Sync {
    fn entries_from(&self, from_index: u64, max: usize) -> Vec<ReplicationEntry>;
}

pub use manager::{ReplicationManager, ReplicationStats};
