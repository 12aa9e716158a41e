// src/core/gossip/crds.rs

//! The Conflict-free Replicated Data Store: a keyed, versioned table of
//! signed per-origin records with deterministic conflict resolution.
//!
//! The table itself sits behind a single reader-writer lock; the shard index
//! used for per-origin enumeration and filter sampling is locked separately.

use crate::core::gossip::crds_value::{
    CrdsHash, CrdsValue, CrdsValueLabel, VersionedCrdsValue,
};
use crate::core::gossip::contact_info::ContactInfo;
use crate::core::metrics;
use crate::core::{NodeId, PeridotError};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// How a value arrived. Retained for stats and to decide whether the value
/// should be rebroadcast by the push loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CrdsRoute {
    LocalMessage,
    PullRequest,
    PullResponse,
    PushMessage,
}

/// The result of a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdsInsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Default)]
pub struct CrdsTableStats {
    pub inserts: AtomicU64,
    pub updates: AtomicU64,
    pub fails: AtomicU64,
    pub bad_signatures: AtomicU64,
    pub trimmed: AtomicU64,
}

/// Shard index over origins. A fixed power-of-two array of label sets keyed
/// by a hash of the origin id, accelerating "all records for an origin"
/// scans and random sampling for bloom-filter construction.
#[derive(Debug)]
pub struct CrdsShards {
    shards: Vec<Mutex<HashSet<CrdsValueLabel>>>,
    mask: usize,
}

impl CrdsShards {
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards.is_power_of_two());
        Self {
            shards: (0..num_shards).map(|_| Mutex::new(HashSet::new())).collect(),
            mask: num_shards - 1,
        }
    }

    fn shard_index(&self, origin: &NodeId) -> usize {
        let digest = Sha256::digest(origin.as_bytes());
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(first) as usize) & self.mask
    }

    pub fn insert(&self, label: CrdsValueLabel) {
        let idx = self.shard_index(label.origin());
        self.shards[idx].lock().insert(label);
    }

    pub fn remove(&self, label: &CrdsValueLabel) {
        let idx = self.shard_index(label.origin());
        self.shards[idx].lock().remove(label);
    }

    /// All labels recorded for an origin.
    pub fn labels_for(&self, origin: &NodeId) -> Vec<CrdsValueLabel> {
        let idx = self.shard_index(origin);
        self.shards[idx]
            .lock()
            .iter()
            .filter(|label| label.origin() == origin)
            .cloned()
            .collect()
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}

#[derive(Debug, Default)]
struct CrdsTableInner {
    table: HashMap<CrdsValueLabel, VersionedCrdsValue>,
    /// Ordinal -> label, for `get_entries_after` range scans.
    ordinals: BTreeMap<u64, CrdsValueLabel>,
}

/// The CRDS table.
#[derive(Debug)]
pub struct Crds {
    self_id: NodeId,
    secret: Option<String>,
    inner: RwLock<CrdsTableInner>,
    shards: CrdsShards,
    next_ordinal: AtomicU64,
    pub stats: CrdsTableStats,
}

impl Crds {
    pub fn new(self_id: NodeId, secret: Option<String>, num_shards: usize) -> Self {
        Self {
            self_id,
            secret,
            inner: RwLock::new(CrdsTableInner::default()),
            shards: CrdsShards::new(num_shards),
            // Ordinals start at 1 so `get_entries_after(0, ..)` scans the whole table.
            next_ordinal: AtomicU64::new(1),
            stats: CrdsTableStats::default(),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Inserts a value, enforcing the override rule. `route` records how the
    /// value arrived. Failures are non-fatal and counted.
    pub fn insert(
        &self,
        value: CrdsValue,
        now_ms: u64,
        route: CrdsRoute,
    ) -> Result<CrdsInsertOutcome, PeridotError> {
        if !value.verify(&self.secret) {
            self.stats.bad_signatures.fetch_add(1, Ordering::Relaxed);
            metrics::GOSSIP_BAD_SIGNATURES_TOTAL.inc();
            return Err(PeridotError::SignatureInvalid);
        }

        let label = value.label();
        let outcome = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;

            if let Some(existing) = inner.table.get_mut(&label) {
                if !value.overrides(&existing.value) {
                    // A repeated push of the stored value still counts as a receipt.
                    if route == CrdsRoute::PushMessage && value.hash() == existing.value.hash() {
                        existing.num_push_receipts += 1;
                    }
                    self.stats.fails.fetch_add(1, Ordering::Relaxed);
                    metrics::CRDS_INSERT_FAILS_TOTAL.inc();
                    return Err(PeridotError::StaleValue);
                }
                let old_ordinal = existing.ordinal;
                let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
                *existing = VersionedCrdsValue {
                    value,
                    ordinal,
                    local_timestamp_ms: now_ms,
                    num_push_receipts: 0,
                    from_pull_response: route == CrdsRoute::PullResponse,
                };
                inner.ordinals.remove(&old_ordinal);
                inner.ordinals.insert(ordinal, label.clone());
                CrdsInsertOutcome::Updated
            } else {
                let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
                inner.ordinals.insert(ordinal, label.clone());
                inner.table.insert(
                    label.clone(),
                    VersionedCrdsValue {
                        value,
                        ordinal,
                        local_timestamp_ms: now_ms,
                        num_push_receipts: 0,
                        from_pull_response: route == CrdsRoute::PullResponse,
                    },
                );
                metrics::CRDS_TABLE_SIZE.set(inner.table.len() as f64);
                CrdsInsertOutcome::Inserted
            }
        };

        match outcome {
            CrdsInsertOutcome::Inserted => {
                self.shards.insert(label);
                self.stats.inserts.fetch_add(1, Ordering::Relaxed);
            }
            CrdsInsertOutcome::Updated => {
                self.stats.updates.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(outcome)
    }

    pub fn get(&self, label: &CrdsValueLabel) -> Option<VersionedCrdsValue> {
        self.inner.read().table.get(label).cloned()
    }

    /// All stored records originated by a node.
    pub fn get_records(&self, origin: &NodeId) -> Vec<VersionedCrdsValue> {
        let labels = self.shards.labels_for(origin);
        let inner = self.inner.read();
        labels
            .iter()
            .filter_map(|label| inner.table.get(label).cloned())
            .collect()
    }

    /// Entries with ordinal strictly greater than `after`, ascending, at
    /// most `limit` of them. Feeds the push loop.
    pub fn get_entries_after(&self, after: u64, limit: usize) -> Vec<VersionedCrdsValue> {
        let inner = self.inner.read();
        inner
            .ordinals
            .range((after + 1)..)
            .take(limit)
            .filter_map(|(_, label)| inner.table.get(label).cloned())
            .collect()
    }

    /// The content-hashes of every stored record, for filter construction.
    pub fn hashes(&self) -> Vec<CrdsHash> {
        self.inner
            .read()
            .table
            .values()
            .map(|entry| *entry.value.hash())
            .collect()
    }

    /// Records whose content-hash is absent from `filter`, capped at `limit`.
    pub fn filter_missing(
        &self,
        filter: &crate::core::gossip::filter::CrdsFilter,
        limit: usize,
    ) -> Vec<CrdsValue> {
        self.inner
            .read()
            .table
            .values()
            .filter(|entry| !filter.contains(entry.value.hash()))
            .take(limit)
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// All contact-info records currently stored.
    pub fn get_contact_infos(&self) -> Vec<ContactInfo> {
        let inner = self.inner.read();
        inner
            .table
            .iter()
            .filter_map(|(label, entry)| match label {
                CrdsValueLabel::ContactInfo(_) => {
                    match &entry.value.data {
                        crate::core::gossip::crds_value::CrdsData::ContactInfo(info) => {
                            Some(info.clone())
                        }
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect()
    }

    pub fn get_contact_info(&self, origin: &NodeId) -> Option<ContactInfo> {
        let entry = self.get(&CrdsValueLabel::ContactInfo(origin.clone()))?;
        match entry.value.data {
            crate::core::gossip::crds_value::CrdsData::ContactInfo(info) => Some(info),
            _ => None,
        }
    }

    /// Number of distinct nodes known through contact info.
    pub fn num_nodes(&self) -> usize {
        self.inner
            .read()
            .table
            .keys()
            .filter(|label| matches!(label, CrdsValueLabel::ContactInfo(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().table.is_empty()
    }

    /// Removes non-self entries whose local timestamp is older than
    /// `timeout_ms`. Self-originated records are refreshed elsewhere, never
    /// trimmed. Returns how many entries were removed.
    pub fn trim(&self, now_ms: u64, timeout_ms: u64) -> usize {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.write();
            let stale: Vec<CrdsValueLabel> = inner
                .table
                .iter()
                .filter(|(label, entry)| {
                    label.origin() != &self.self_id
                        && now_ms.saturating_sub(entry.local_timestamp_ms) > timeout_ms
                })
                .map(|(label, _)| label.clone())
                .collect();
            for label in stale {
                if let Some(entry) = inner.table.remove(&label) {
                    inner.ordinals.remove(&entry.ordinal);
                    removed.push(label);
                }
            }
            metrics::CRDS_TABLE_SIZE.set(inner.table.len() as f64);
        }
        for label in &removed {
            self.shards.remove(label);
        }
        self.stats
            .trimmed
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed.len()
    }
}
