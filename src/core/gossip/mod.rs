// src/core/gossip/mod.rs

//! The gossip plane: a conflict-free replicated data store disseminated via
//! a hybrid push/pull protocol with bloom-filter anti-entropy.

pub mod active_set;
pub mod contact_info;
pub mod crds;
pub mod crds_value;
pub mod dup_shred;
pub mod filter;
pub mod protocol;
pub mod received_cache;
pub mod service;
pub mod weighted_shuffle;

pub use crate::core::NodeId;
pub use contact_info::{ContactInfo, LegacyContactInfo, SocketTag};
pub use crds::{Crds, CrdsInsertOutcome, CrdsRoute};
pub use crds_value::{CrdsData, CrdsHash, CrdsValue, CrdsValueLabel, VersionedCrdsValue};
pub use service::{GossipMetrics, GossipNotification, GossipService, GossipSink, UdpGossipSink};
