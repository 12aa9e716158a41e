// src/core/coordinator/mod.rs

//! Multi-master coordination: role assignment, global consensus state, and
//! cross-master synchronization.

pub mod global;
pub mod master;

pub use global::{
    CoordinationEvent, CoordinationEventKind, CoordinatorStats, CrossMasterSyncHandler,
    CrossMasterSyncRequest, GlobalConsensusState, MultiMasterCoordinator, SyncKind,
};
pub use master::{MasterNode, MasterRole, MultiMasterManager, MultiMasterStats};
